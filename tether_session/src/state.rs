//! Session state types.

use serde::{Deserialize, Serialize};
use tether_ipc::ConnectionStatus;

/// OS-level connection to the service process.
///
/// Ordered: a command that needs `Bound` is also allowed in `Registered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BindPhase {
    /// No connection and none requested
    Unbound,
    /// A connection attempt is in flight
    Binding,
    /// Connected, reply address not yet registered
    Bound,
    /// Connected and registered for events
    Registered,
}

/// Snapshot of what the user sees: status plus the server it refers to.
///
/// `server_name` is only kept while the status is active
/// (Connecting, Connected or Reconnecting).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SessionState {
    status: ConnectionStatus,
    server_name: Option<String>,
}

impl SessionState {
    /// Build a snapshot, dropping the server name for inactive statuses.
    pub fn new(status: ConnectionStatus, server_name: Option<String>) -> Self {
        let server_name = if status.is_active() { server_name } else { None };
        Self {
            status,
            server_name,
        }
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// Whether the server-name invariant holds (relevant for deserialized data).
    pub fn is_consistent(&self) -> bool {
        self.server_name.is_none() || self.status.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_dropped_when_inactive() {
        let state = SessionState::new(ConnectionStatus::Disconnected, Some("srv1".into()));
        assert_eq!(state.server_name(), None);

        let state = SessionState::new(
            ConnectionStatus::Error("auth".into()),
            Some("srv1".into()),
        );
        assert_eq!(state.server_name(), None);

        let state = SessionState::new(ConnectionStatus::Reconnecting, Some("srv1".into()));
        assert_eq!(state.server_name(), Some("srv1"));
    }

    #[test]
    fn test_phase_ordering_gates_commands() {
        assert!(BindPhase::Registered >= BindPhase::Bound);
        assert!(BindPhase::Binding < BindPhase::Bound);
        assert!(BindPhase::Unbound < BindPhase::Binding);
    }
}
