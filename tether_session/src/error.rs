//! Error types for the session layer.

use std::io;
use thiserror::Error;

/// Failure to hand a command to the service.
///
/// None of these are user-visible: the caller drops the command, and
/// `Dead` additionally tears the channel down.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// No live channel, or the bind phase does not allow this command yet
    #[error("channel is not connected")]
    NotConnected,

    /// The remote endpoint is permanently gone
    #[error("remote endpoint is dead")]
    Dead,

    /// The outbound queue is full; the command was dropped
    #[error("outbound queue is full")]
    Congested,
}

/// Errors from the durable state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The file did not contain a valid snapshot
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The snapshot parsed but names a server while not in an active status
    #[error("inconsistent session state on disk")]
    Inconsistent,
}

/// Errors returned to callers of [`crate::SessionHandle`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// The coordinator inbox is full
    #[error("coordinator is busy, request dropped")]
    Busy,

    /// The coordinator task has stopped
    #[error("coordinator has shut down")]
    Closed,
}
