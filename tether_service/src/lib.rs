//! tether tunnel service
//!
//! Owns the (simulated) tunnel and serves it to foreground clients over a
//! Unix domain socket.

pub mod ipc_handler;
pub mod tunnel;

pub use ipc_handler::IpcHandler;
pub use tunnel::{TunnelOptions, TunnelSimulator};
