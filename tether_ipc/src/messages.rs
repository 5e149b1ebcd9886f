//! IPC Message Definitions
//!
//! This module defines the message types exchanged between the client and
//! the tunnel service.
//!
//! The wire tag of every variant is its bincode variant index, encoded as a
//! little-endian `u32` at the start of the payload. Variants must only ever be
//! appended; reordering them changes the wire contract.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection status of the tunnel, as reported by the service.
///
/// Wire tags: `Disconnected=0`, `Connecting=1`, `Connected=2`,
/// `Reconnecting=3`, `Error=4`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// No tunnel is up
    #[default]
    Disconnected,

    /// The service is establishing a tunnel
    Connecting,

    /// The tunnel is up
    Connected,

    /// The tunnel dropped and the service is re-establishing it
    Reconnecting,

    /// The service reported a failure
    Error(String),
}

impl ConnectionStatus {
    /// Whether this status belongs to a live (or being established) session.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting
                | ConnectionStatus::Connected
                | ConnectionStatus::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Reconnecting => write!(f, "reconnecting"),
            ConnectionStatus::Error(message) => write!(f, "error: {}", message),
        }
    }
}

/// Configuration handed to the service when a session is started
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VpnConfig {
    /// Display name of the server this session targets
    pub server_name: String,

    /// Protocol configuration, forwarded to the service untouched
    pub payload: String,
}

impl VpnConfig {
    /// Create a new config for the given server
    pub fn new(server_name: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            payload: payload.into(),
        }
    }
}

/// Command sent from the client to the tunnel service
///
/// Wire tags: `RegisterClient=0`, `RequestStatus=1`, `Connect=2`,
/// `Disconnect=3`, `SetSaveLogs=4`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Register this connection as the reply address for service events.
    /// Must be resent after every new connection.
    RegisterClient,

    /// Ask the service for a one-off `StatusReport`
    RequestStatus,

    /// Bring the tunnel up with the given configuration
    Connect(VpnConfig),

    /// Tear the tunnel down
    Disconnect,

    /// Toggle log persistence inside the service
    SetSaveLogs(bool),
}

impl Command {
    /// Wire tag of this command
    pub fn wire_tag(&self) -> u32 {
        match self {
            Command::RegisterClient => 0,
            Command::RequestStatus => 1,
            Command::Connect(_) => 2,
            Command::Disconnect => 3,
            Command::SetSaveLogs(_) => 4,
        }
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Command::RegisterClient => "RegisterClient",
            Command::RequestStatus => "RequestStatus",
            Command::Connect(_) => "Connect",
            Command::Disconnect => "Disconnect",
            Command::SetSaveLogs(_) => "SetSaveLogs",
        }
    }
}

/// Event pushed from the tunnel service to registered clients
///
/// Wire tags: `Connected=0`, `Disconnected=1`, `Reconnecting=2`,
/// `StatusReport=3`, `StatisticsUpdate=4`, `ErrorReport=5`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    /// The tunnel came up
    Connected,

    /// The tunnel went down
    Disconnected,

    /// The tunnel dropped and is being re-established
    Reconnecting,

    /// Answer to `RequestStatus`
    StatusReport(ConnectionStatus),

    /// Periodic traffic counters
    StatisticsUpdate { rx_bytes: u64, tx_bytes: u64 },

    /// The service hit an error
    ErrorReport(String),
}

impl RemoteEvent {
    /// Wire tag of this event
    pub fn wire_tag(&self) -> u32 {
        match self {
            RemoteEvent::Connected => 0,
            RemoteEvent::Disconnected => 1,
            RemoteEvent::Reconnecting => 2,
            RemoteEvent::StatusReport(_) => 3,
            RemoteEvent::StatisticsUpdate { .. } => 4,
            RemoteEvent::ErrorReport(_) => 5,
        }
    }

    /// Whether this event conclusively sets the connection status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RemoteEvent::Connected
                | RemoteEvent::Disconnected
                | RemoteEvent::Reconnecting
                | RemoteEvent::ErrorReport(_)
        )
    }
}
