//! Session coordination for the tether client.
//!
//! This crate keeps a foreground client continuously informed about the
//! tunnel service running in another process. It binds to the service,
//! exchanges [`Command`]s and [`RemoteEvent`]s over a best-effort channel,
//! reconciles the displayed [`ConnectionStatus`] with the service's, and
//! recovers from channel death by rebinding.
//!
//! The moving parts:
//!
//! - [`machine::SessionMachine`]: every coordination decision, driven by
//!   [`machine::Input`] on a single task
//! - [`sync::StatusSync`]: bind and status-request timeouts
//! - [`channel`]: the live endpoint to the service and its socket tasks
//! - [`network::NetworkObserver`]: validated-network transitions
//! - [`store::StateStore`]: last-known state for cold starts
//! - [`runtime::Coordinator`]: the tokio wiring and the [`SessionHandle`]
//!   used by the presentation layer

pub mod channel;
pub mod error;
pub mod listener;
pub mod machine;
pub mod network;
pub mod runtime;
pub mod state;
pub mod store;
pub mod sync;

pub use error::{ChannelError, SessionError, StoreError};
pub use listener::{Notification, NotificationForwarder, SessionListener};
pub use runtime::{Coordinator, CoordinatorOptions, SessionHandle};
pub use state::{BindPhase, SessionState};
pub use store::StateStore;
pub use tether_ipc::{Command, ConnectionStatus, RemoteEvent, VpnConfig};
