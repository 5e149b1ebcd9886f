//! Terminal rendering of session notifications.

use std::time::Duration;
use tether_session::{ConnectionStatus, Notification, SessionState};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

/// One line of user-facing output for a notification
pub fn describe(notification: &Notification) -> String {
    match notification {
        Notification::Connected => "Connected".to_string(),
        Notification::Disconnected => "Disconnected".to_string(),
        Notification::Reconnecting => "Reconnecting...".to_string(),
        Notification::Status(status) => format!("Status: {}", status),
        Notification::Statistics { rx_bytes, tx_bytes } => {
            format!("Traffic: {} received, {} sent", bytes(*rx_bytes), bytes(*tx_bytes))
        }
        Notification::ServiceError(message) => format!("Service error: {}", message),
        Notification::ServiceConnected => "Connected to tunnel service".to_string(),
        Notification::ServiceDisconnected => "Tunnel service connection closed".to_string(),
    }
}

pub fn render(notification: &Notification) {
    match notification {
        Notification::ServiceError(_) => warn!(?notification, "Notification"),
        _ => debug!(?notification, "Notification"),
    }
    println!("{}", describe(notification));
}

pub fn describe_state(state: &SessionState) -> String {
    match state.server_name() {
        Some(server) => format!("{} ({})", state.status(), server),
        None => state.status().to_string(),
    }
}

fn bytes(count: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = count as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", count)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Render notifications until the coordinator has registered with the
/// service. A status seen before that was made up by the bind timeout and
/// is skipped. Returns `false` if the service turned out unreachable.
pub async fn wait_for_service(
    notifications: &mut UnboundedReceiver<Notification>,
    within: Duration,
) -> bool {
    let wait = async {
        while let Some(notification) = notifications.recv().await {
            if let Notification::Status(status) = &notification {
                debug!(%status, "Skipping status reported before registration");
                continue;
            }
            render(&notification);
            match notification {
                Notification::ServiceConnected => return true,
                Notification::ServiceError(_) => return false,
                _ => {}
            }
        }
        false
    };
    tokio::time::timeout(within, wait).await.unwrap_or(false)
}

/// Render notifications until the status is resolved. Returns `None` if
/// nothing resolves it within `within`.
pub async fn wait_for_status(
    notifications: &mut UnboundedReceiver<Notification>,
    within: Duration,
) -> Option<ConnectionStatus> {
    let wait = async {
        while let Some(notification) = notifications.recv().await {
            render(&notification);
            match notification {
                Notification::Status(status) => return Some(status),
                Notification::Connected => return Some(ConnectionStatus::Connected),
                Notification::Disconnected => return Some(ConnectionStatus::Disconnected),
                Notification::Reconnecting => return Some(ConnectionStatus::Reconnecting),
                _ => {}
            }
        }
        None
    };
    tokio::time::timeout(within, wait).await.ok().flatten()
}

/// Render notifications until the tunnel reports it is down.
pub async fn wait_for_disconnect(
    notifications: &mut UnboundedReceiver<Notification>,
    within: Duration,
) -> bool {
    let wait = async {
        while let Some(notification) = notifications.recv().await {
            render(&notification);
            if matches!(
                notification,
                Notification::Disconnected | Notification::ServiceDisconnected
            ) {
                return true;
            }
        }
        false
    };
    tokio::time::timeout(within, wait).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_describe_statistics() {
        let line = describe(&Notification::Statistics {
            rx_bytes: 512,
            tx_bytes: 3 * 1024 * 1024,
        });
        assert_eq!(line, "Traffic: 512 B received, 3.0 MiB sent");
    }

    #[test]
    fn test_describe_state() {
        let state = SessionState::new(ConnectionStatus::Connected, Some("srv1".into()));
        assert_eq!(describe_state(&state), "connected (srv1)");
        assert_eq!(describe_state(&SessionState::default()), "disconnected");
    }

    #[tokio::test]
    async fn test_wait_for_status_skips_errors() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(Notification::ServiceError("unreachable".into())).unwrap();
        tx.send(Notification::Status(ConnectionStatus::Disconnected))
            .unwrap();

        let status = wait_for_status(&mut rx, Duration::from_secs(1)).await;
        assert_eq!(status, Some(ConnectionStatus::Disconnected));
    }

    #[tokio::test]
    async fn test_status_before_registration_is_not_trusted() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(Notification::Status(ConnectionStatus::Disconnected))
            .unwrap();
        tx.send(Notification::ServiceConnected).unwrap();
        tx.send(Notification::Status(ConnectionStatus::Connected))
            .unwrap();

        assert!(wait_for_service(&mut rx, Duration::from_secs(1)).await);
        let status = wait_for_status(&mut rx, Duration::from_secs(1)).await;
        assert_eq!(status, Some(ConnectionStatus::Connected));
    }

    #[tokio::test]
    async fn test_wait_for_service_stops_on_bind_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(Notification::Status(ConnectionStatus::Disconnected))
            .unwrap();
        tx.send(Notification::ServiceError("unreachable".into()))
            .unwrap();

        assert!(!wait_for_service(&mut rx, Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_service_times_out() {
        let (_tx, mut rx) = mpsc::unbounded_channel();
        assert!(!wait_for_service(&mut rx, Duration::from_secs(3)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_status_times_out() {
        let (_tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(wait_for_status(&mut rx, Duration::from_secs(3)).await, None);
    }

    #[tokio::test]
    async fn test_wait_for_disconnect() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(Notification::Statistics {
            rx_bytes: 1,
            tx_bytes: 1,
        })
        .unwrap();
        tx.send(Notification::Disconnected).unwrap();

        assert!(wait_for_disconnect(&mut rx, Duration::from_secs(1)).await);
    }
}
