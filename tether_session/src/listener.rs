//! Notifications delivered to the presentation layer.
//!
//! All callbacks run on the coordinator task, one at a time. Implementations
//! must return quickly and must not block.

use tether_ipc::ConnectionStatus;
use tokio::sync::mpsc;

/// Receiver of session notifications. Every method defaults to a no-op.
pub trait SessionListener: Send + Sync {
    fn on_connected(&self) {}

    fn on_disconnected(&self) {}

    fn on_reconnecting(&self) {}

    /// Status resolved from a status report or synthesized after a timeout
    fn on_status(&self, _status: &ConnectionStatus) {}

    fn on_statistics_update(&self, _rx_bytes: u64, _tx_bytes: u64) {}

    fn on_service_error(&self, _message: &str) {}

    /// Registered with the service process; status reports from here on
    /// come from the service itself
    fn on_service_connected(&self) {}

    /// The connection to the service process was torn down
    fn on_service_disconnected(&self) {}
}

/// A notification as a value, for consumers that prefer a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Connected,
    Disconnected,
    Reconnecting,
    Status(ConnectionStatus),
    Statistics { rx_bytes: u64, tx_bytes: u64 },
    ServiceError(String),
    ServiceConnected,
    ServiceDisconnected,
}

/// Listener that forwards every notification into an unbounded channel.
pub struct NotificationForwarder {
    tx: mpsc::UnboundedSender<Notification>,
}

impl NotificationForwarder {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, notification: Notification) {
        // A dropped receiver just means nobody is watching any more.
        let _ = self.tx.send(notification);
    }
}

impl SessionListener for NotificationForwarder {
    fn on_connected(&self) {
        self.forward(Notification::Connected);
    }

    fn on_disconnected(&self) {
        self.forward(Notification::Disconnected);
    }

    fn on_reconnecting(&self) {
        self.forward(Notification::Reconnecting);
    }

    fn on_status(&self, status: &ConnectionStatus) {
        self.forward(Notification::Status(status.clone()));
    }

    fn on_statistics_update(&self, rx_bytes: u64, tx_bytes: u64) {
        self.forward(Notification::Statistics { rx_bytes, tx_bytes });
    }

    fn on_service_error(&self, message: &str) {
        self.forward(Notification::ServiceError(message.to_string()));
    }

    fn on_service_connected(&self) {
        self.forward(Notification::ServiceConnected);
    }

    fn on_service_disconnected(&self) {
        self.forward(Notification::ServiceDisconnected);
    }
}
