//! Tether IPC Protocol Library
//!
//! This crate defines the messages and transport used between the foreground
//! client (`tether_client`, driven by `tether_session`) and the tunnel service
//! process (`tether_service`).
//!
//! Every message travels as one frame: a little-endian `u32` length followed
//! by the bincode encoding of a [`Command`] or [`RemoteEvent`].

pub mod messages;
pub mod transport;

/// Re-export common types for convenience
pub use messages::{Command, ConnectionStatus, RemoteEvent, VpnConfig};
pub use transport::{
    ClientConnection, CommandSink, EventSource, IpcError, IpcResult, UnixSocketListener,
    UnixSocketTransport,
};
