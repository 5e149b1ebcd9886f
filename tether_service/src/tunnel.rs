//! Simulated tunnel
//!
//! Stands in for the real protocol engine. It walks through the same status
//! transitions a tunnel would and broadcasts the matching events to every
//! registered client.

use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tether_ipc::{ConnectionStatus, RemoteEvent, VpnConfig};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;

/// Events buffered per subscriber before it starts lagging
const EVENT_BUFFER: usize = 64;

/// Bytes added to the counters on every statistics tick
const SIMULATED_RX_PER_TICK: u64 = 1500;
const SIMULATED_TX_PER_TICK: u64 = 600;

/// Timing of the simulated tunnel
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// Time between `Connect` and the tunnel reporting `Connected`
    pub connect_delay: Duration,
    /// Interval of `StatisticsUpdate` events while connected
    pub statistics_interval: Duration,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            connect_delay: Duration::from_millis(500),
            statistics_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Default)]
struct TunnelState {
    status: ConnectionStatus,
    server_name: Option<String>,
    rx_bytes: u64,
    tx_bytes: u64,
    save_logs: bool,
    /// Bumped on every connect/disconnect so stale tasks can tell
    session: u64,
    task: Option<AbortHandle>,
}

/// The single tunnel owned by the service
pub struct TunnelSimulator {
    options: TunnelOptions,
    state: Mutex<TunnelState>,
    events: broadcast::Sender<RemoteEvent>,
}

impl TunnelSimulator {
    pub fn new(options: TunnelOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            options,
            state: Mutex::new(TunnelState::default()),
            events,
        })
    }

    /// Receive every event broadcast from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RemoteEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock().status.clone()
    }

    pub fn server_name(&self) -> Option<String> {
        self.lock().server_name.clone()
    }

    pub fn save_logs(&self) -> bool {
        self.lock().save_logs
    }

    pub fn set_save_logs(&self, enabled: bool) {
        info!("Save logs {}", if enabled { "enabled" } else { "disabled" });
        self.lock().save_logs = enabled;
    }

    /// Bring the tunnel up, or re-establish it if it is already up
    pub fn connect(self: &Arc<Self>, config: VpnConfig) {
        if config.server_name.trim().is_empty() {
            warn!("Rejecting connect without a server name");
            let message = "server name must not be empty".to_string();
            let mut state = self.lock();
            Self::stop_task(&mut state);
            state.status = ConnectionStatus::Error(message.clone());
            state.server_name = None;
            drop(state);
            self.broadcast(RemoteEvent::ErrorReport(message));
            return;
        }

        let mut state = self.lock();
        Self::stop_task(&mut state);
        state.session += 1;
        let session = state.session;

        info!(
            "Connecting to {} ({} bytes of configuration)",
            config.server_name,
            config.payload.len()
        );
        let reconnecting = state.status == ConnectionStatus::Connected;
        state.status = if reconnecting {
            ConnectionStatus::Reconnecting
        } else {
            ConnectionStatus::Connecting
        };
        state.server_name = Some(config.server_name);

        let tunnel = Arc::clone(self);
        let task = tokio::spawn(async move { tunnel.establish(session).await });
        state.task = Some(task.abort_handle());
        drop(state);

        if reconnecting {
            self.broadcast(RemoteEvent::Reconnecting);
        }
    }

    /// Tear the tunnel down. Always answered with `Disconnected`.
    pub fn disconnect(&self) {
        let mut state = self.lock();
        Self::stop_task(&mut state);
        state.session += 1;
        state.status = ConnectionStatus::Disconnected;
        state.server_name = None;
        state.rx_bytes = 0;
        state.tx_bytes = 0;
        drop(state);

        info!("Tunnel disconnected");
        self.broadcast(RemoteEvent::Disconnected);
    }

    async fn establish(self: Arc<Self>, session: u64) {
        tokio::time::sleep(self.options.connect_delay).await;
        {
            let mut state = self.lock();
            if state.session != session {
                return;
            }
            state.status = ConnectionStatus::Connected;
        }
        info!("Tunnel connected");
        self.broadcast(RemoteEvent::Connected);

        let mut ticker = tokio::time::interval(self.options.statistics_interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let (rx_bytes, tx_bytes) = {
                let mut state = self.lock();
                if state.session != session {
                    return;
                }
                state.rx_bytes += SIMULATED_RX_PER_TICK;
                state.tx_bytes += SIMULATED_TX_PER_TICK;
                (state.rx_bytes, state.tx_bytes)
            };
            self.broadcast(RemoteEvent::StatisticsUpdate { rx_bytes, tx_bytes });
        }
    }

    fn stop_task(state: &mut TunnelState) {
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }

    fn broadcast(&self, event: RemoteEvent) {
        // No receivers just means no client is registered.
        if self.events.send(event).is_err() {
            debug!("No registered clients for event");
        }
    }

    fn lock(&self) -> MutexGuard<'_, TunnelState> {
        // The state stays consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> TunnelOptions {
        TunnelOptions {
            connect_delay: Duration::from_millis(100),
            statistics_interval: Duration::from_millis(50),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_then_connected_then_statistics() {
        let tunnel = TunnelSimulator::new(fast());
        let mut events = tunnel.subscribe();

        tunnel.connect(VpnConfig::new("srv1", "cfg"));
        assert_eq!(tunnel.status(), ConnectionStatus::Connecting);
        assert_eq!(tunnel.server_name().as_deref(), Some("srv1"));

        assert_eq!(events.recv().await.unwrap(), RemoteEvent::Connected);
        assert_eq!(tunnel.status(), ConnectionStatus::Connected);
        assert_eq!(
            events.recv().await.unwrap(),
            RemoteEvent::StatisticsUpdate {
                rx_bytes: SIMULATED_RX_PER_TICK,
                tx_bytes: SIMULATED_TX_PER_TICK,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_connected_reconnects() {
        let tunnel = TunnelSimulator::new(fast());
        let mut events = tunnel.subscribe();
        tunnel.connect(VpnConfig::new("srv1", ""));
        assert_eq!(events.recv().await.unwrap(), RemoteEvent::Connected);

        tunnel.connect(VpnConfig::new("srv2", ""));
        assert_eq!(events.recv().await.unwrap(), RemoteEvent::Reconnecting);
        assert_eq!(events.recv().await.unwrap(), RemoteEvent::Connected);
        assert_eq!(tunnel.server_name().as_deref(), Some("srv2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_connect() {
        let tunnel = TunnelSimulator::new(fast());
        let mut events = tunnel.subscribe();

        tunnel.connect(VpnConfig::new("srv1", ""));
        tunnel.disconnect();
        assert_eq!(events.recv().await.unwrap(), RemoteEvent::Disconnected);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(tunnel.status(), ConnectionStatus::Disconnected);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_server_name_is_an_error() {
        let tunnel = TunnelSimulator::new(fast());
        let mut events = tunnel.subscribe();

        tunnel.connect(VpnConfig::new("  ", ""));
        assert!(matches!(
            events.recv().await.unwrap(),
            RemoteEvent::ErrorReport(_)
        ));
        assert!(matches!(tunnel.status(), ConnectionStatus::Error(_)));
    }

    #[test]
    fn test_save_logs_flag() {
        let tunnel = TunnelSimulator::new(fast());
        assert!(!tunnel.save_logs());
        tunnel.set_save_logs(true);
        assert!(tunnel.save_logs());
    }
}
