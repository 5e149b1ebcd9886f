//! The session state machine.
//!
//! [`SessionMachine`] owns the displayed [`ConnectionStatus`], the bind
//! lifecycle and the live [`ChannelHandle`]. It is driven one [`Input`] at a
//! time by a single task and performs every side effect through the seams
//! in [`Seams`], so each transition can be exercised synchronously.

use crate::channel::ChannelHandle;
use crate::error::ChannelError;
use crate::listener::SessionListener;
use crate::network::{NetworkObservation, NetworkObserver};
use crate::state::{BindPhase, SessionState};
use crate::sync::{StatusSync, TimerKind, TimerService};
use std::sync::Arc;
use tether_ipc::{Command, ConnectionStatus, RemoteEvent, VpnConfig};
use tracing::{debug, info, warn};

/// Everything that can happen to a session.
#[derive(Debug)]
pub enum Input {
    /// User asked for a session with this configuration
    Start(VpnConfig),
    /// User asked to end the session
    Stop,
    SetSaveLogs(bool),
    /// Foreground came up; observe the service without starting a session
    Attach,
    /// Foreground went away; drop the bind
    Detach,
    /// Ask a registered service for its status again, replacing whatever
    /// status is currently shown
    RefreshStatus,
    /// A bind attempt produced a live endpoint
    Bound {
        generation: u64,
        handle: ChannelHandle,
    },
    BindFailed {
        generation: u64,
        reason: String,
    },
    Remote {
        generation: u64,
        event: RemoteEvent,
    },
    /// The endpoint of this generation is permanently gone
    ChannelDied {
        generation: u64,
    },
    TimerFired {
        kind: TimerKind,
        token: u64,
    },
    Network(NetworkObservation),
}

/// Issues and cancels non-blocking bind attempts.
///
/// The outcome of `bind` must come back later as `Input::Bound` or
/// `Input::BindFailed` carrying the same generation.
pub trait ServiceBinder: Send {
    fn bind(&mut self, generation: u64);

    /// Abandon the attempt or connection of `generation`
    fn unbind(&mut self, generation: u64);
}

/// Receives a snapshot whenever the persisted view of the session changes.
pub trait SnapshotSink: Send {
    fn publish(&mut self, state: &SessionState);
}

/// Side-effect seams of the machine.
pub struct Seams {
    pub binder: Box<dyn ServiceBinder>,
    pub timers: Box<dyn TimerService>,
    pub listener: Arc<dyn SessionListener>,
    pub snapshots: Box<dyn SnapshotSink>,
}

pub struct SessionMachine {
    phase: BindPhase,
    channel: Option<ChannelHandle>,
    generation: u64,
    status: ConnectionStatus,
    server_name: Option<String>,
    sync: StatusSync,
    network: NetworkObserver,
    /// Latest path report, kept while the observer is unbound
    last_observation: Option<NetworkObservation>,

    /// The user wants a session; cleared by stop or a remote disconnect
    session_desired: bool,
    /// Connect to send once registered
    pending_connect: Option<VpnConfig>,
    last_config: Option<VpnConfig>,
    /// A Connect went out since the service last reported Disconnected
    connect_sent: bool,
    disconnect_requested: bool,
    save_logs: bool,

    last_published: SessionState,
    seams: Seams,
}

impl SessionMachine {
    /// Create an unbound machine displaying `initial` (usually the last
    /// persisted state). The status counts as unresolved until the service
    /// answers or a timeout fires.
    pub fn new(initial: SessionState, seams: Seams) -> Self {
        Self {
            phase: BindPhase::Unbound,
            channel: None,
            generation: 0,
            status: initial.status().clone(),
            server_name: initial.server_name().map(str::to_string),
            sync: StatusSync::new(),
            network: NetworkObserver::new(),
            last_observation: None,
            session_desired: false,
            pending_connect: None,
            last_config: None,
            connect_sent: false,
            disconnect_requested: false,
            save_logs: false,
            last_published: initial,
            seams,
        }
    }

    pub fn phase(&self) -> BindPhase {
        self.phase
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_session_desired(&self) -> bool {
        self.session_desired
    }

    pub fn save_logs(&self) -> bool {
        self.save_logs
    }

    pub fn is_status_resolved(&self) -> bool {
        self.sync.is_resolved()
    }

    pub fn snapshot(&self) -> SessionState {
        SessionState::new(self.status.clone(), self.server_name.clone())
    }

    /// Process one input to completion.
    pub fn handle(&mut self, input: Input) {
        match input {
            Input::Start(config) => self.start(config),
            Input::Stop => self.stop(),
            Input::SetSaveLogs(enabled) => self.set_save_logs(enabled),
            Input::Attach => self.bind(),
            Input::Detach => self.detach(),
            Input::RefreshStatus => self.refresh_status(),
            Input::Bound { generation, handle } => self.on_bound(generation, handle),
            Input::BindFailed { generation, reason } => self.on_bind_failed(generation, &reason),
            Input::Remote { generation, event } => {
                if self.is_current(generation) {
                    self.on_remote(event);
                } else {
                    debug!(generation, ?event, "Dropping event from stale channel");
                }
            }
            Input::ChannelDied { generation } => {
                if self.is_current(generation) {
                    self.on_channel_death();
                } else {
                    debug!(generation, "Ignoring death of stale channel");
                }
            }
            Input::TimerFired { kind, token } => {
                if self.sync.take_expiry(kind, token) {
                    self.on_timeout(kind);
                }
            }
            Input::Network(observation) => {
                if self.network.observe(&observation) {
                    self.on_network_change(&observation);
                }
                self.last_observation = Some(observation);
            }
        }

        self.publish_if_changed();
    }

    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && self.channel.is_some()
    }

    fn start(&mut self, config: VpnConfig) {
        info!(server = %config.server_name, phase = ?self.phase, "Starting session");
        self.session_desired = true;
        self.server_name = Some(config.server_name.clone());
        self.last_config = Some(config.clone());
        self.bind_network();

        if self.phase == BindPhase::Registered {
            self.send_connect(config);
        } else {
            self.pending_connect = Some(config);
            self.bind();
        }
    }

    fn stop(&mut self) {
        self.session_desired = false;
        self.pending_connect = None;
        self.network.unbind();

        if self.phase == BindPhase::Registered {
            if self.disconnect_requested {
                debug!("Disconnect already requested");
                return;
            }
            if self.status == ConnectionStatus::Disconnected && !self.connect_sent {
                debug!("Already disconnected");
                return;
            }
            info!("Requesting disconnect");
            if self.send(Command::Disconnect).is_ok() {
                self.disconnect_requested = true;
            }
        } else {
            // Nobody to ask; settle the display locally.
            self.sync.resolve(self.seams.timers.as_mut());
            self.apply_terminal(ConnectionStatus::Disconnected);
        }
    }

    fn set_save_logs(&mut self, enabled: bool) {
        self.save_logs = enabled;
        if self.phase == BindPhase::Registered {
            let _ = self.send(Command::SetSaveLogs(enabled));
        } else {
            debug!(enabled, "Not registered, SetSaveLogs recorded locally only");
        }
    }

    fn refresh_status(&mut self) {
        if self.phase != BindPhase::Registered {
            debug!("Not registered, status refresh dropped");
            return;
        }
        self.sync.reset(self.seams.timers.as_mut());
        if self.send(Command::RequestStatus).is_ok() {
            self.sync.arm_status_request(self.seams.timers.as_mut());
        }
    }

    fn detach(&mut self) {
        self.session_desired = false;
        self.pending_connect = None;
        self.network.unbind();
        self.unbind();
    }

    fn bind(&mut self) {
        if self.phase != BindPhase::Unbound {
            return;
        }
        self.generation += 1;
        self.phase = BindPhase::Binding;
        info!(generation = self.generation, "Binding to tunnel service");
        self.seams.binder.bind(self.generation);
        self.sync.arm_bind_timeout(self.seams.timers.as_mut());
    }

    fn unbind(&mut self) {
        if self.phase == BindPhase::Unbound {
            return;
        }
        info!(generation = self.generation, phase = ?self.phase, "Unbinding from tunnel service");
        self.seams.binder.unbind(self.generation);
        self.channel = None;
        self.phase = BindPhase::Unbound;
        self.sync.reset(self.seams.timers.as_mut());
        self.connect_sent = false;
        self.disconnect_requested = false;
        self.seams.listener.on_service_disconnected();
    }

    /// Bind the observer, seeding it with the path already in use so the
    /// next switch counts as a change.
    fn bind_network(&mut self) {
        if self.network.is_bound() {
            return;
        }
        self.network.bind();
        if let Some(observation) = &self.last_observation {
            self.network.observe(observation);
        }
    }

    fn on_bound(&mut self, generation: u64, handle: ChannelHandle) {
        if generation != self.generation || self.phase != BindPhase::Binding {
            debug!(generation, "Discarding endpoint of abandoned bind");
            return;
        }

        debug!(generation, "Bound to tunnel service");
        self.phase = BindPhase::Bound;
        self.channel = Some(handle);
        self.sync.cancel_bind_timeout(self.seams.timers.as_mut());

        if self.send(Command::RegisterClient).is_err() {
            return;
        }
        self.phase = BindPhase::Registered;
        debug!(generation, "Registered with tunnel service");
        self.seams.listener.on_service_connected();

        if !self.sync.is_resolved() && self.send(Command::RequestStatus).is_ok() {
            self.sync.arm_status_request(self.seams.timers.as_mut());
        }
        if self.phase != BindPhase::Registered {
            // The channel died under us; the pending connect waits for the rebind.
            return;
        }
        if let Some(config) = self.pending_connect.take() {
            self.send_connect(config);
        }
    }

    fn on_bind_failed(&mut self, generation: u64, reason: &str) {
        if generation != self.generation || self.phase != BindPhase::Binding {
            debug!(generation, "Ignoring failure of abandoned bind");
            return;
        }

        warn!(generation, "Tunnel service unavailable: {}", reason);
        self.phase = BindPhase::Unbound;
        // The session stays desired so a network change can retry it.
        // Status is left to the bind timeout.
        self.pending_connect = None;
        self.seams
            .listener
            .on_service_error(&format!("tunnel service unavailable: {}", reason));
    }

    fn on_remote(&mut self, event: RemoteEvent) {
        debug!(?event, "Remote event");
        match event {
            RemoteEvent::Connected => {
                self.apply_terminal(ConnectionStatus::Connected);
            }
            RemoteEvent::Reconnecting => {
                self.apply_terminal(ConnectionStatus::Reconnecting);
            }
            RemoteEvent::Disconnected => {
                self.apply_terminal(ConnectionStatus::Disconnected);
                self.session_desired = false;
                self.pending_connect = None;
                self.server_name = None;
                self.network.unbind();
                self.unbind();
            }
            RemoteEvent::StatusReport(status) => {
                if self.sync.resolve(self.seams.timers.as_mut()) {
                    info!(%status, "Status resolved from service report");
                    self.status = status;
                    self.seams.listener.on_status(&self.status);
                } else {
                    debug!(%status, "Ignoring status report, status already resolved");
                }
            }
            RemoteEvent::StatisticsUpdate { rx_bytes, tx_bytes } => {
                self.seams.listener.on_statistics_update(rx_bytes, tx_bytes);
            }
            RemoteEvent::ErrorReport(message) => {
                warn!("Tunnel service reported an error: {}", message);
                self.apply_terminal(ConnectionStatus::Error(message.clone()));
                self.connect_sent = false;
                self.seams.listener.on_service_error(&message);
            }
        }
    }

    fn on_channel_death(&mut self) {
        warn!(generation = self.generation, "Channel to tunnel service died");
        self.apply_terminal(ConnectionStatus::Disconnected);
        self.unbind();
        if self.session_desired {
            info!("Session still desired, rebinding");
            self.bind();
        }
    }

    fn on_timeout(&mut self, kind: TimerKind) {
        if self.sync.is_resolved() {
            return;
        }
        match kind {
            TimerKind::Bind if self.phase >= BindPhase::Bound => return,
            TimerKind::Bind => info!("Bind timeout, reporting disconnected"),
            TimerKind::StatusRequest => info!("No status report from service, reporting disconnected"),
        }
        self.sync.resolve(self.seams.timers.as_mut());
        self.status = ConnectionStatus::Disconnected;
        self.seams.listener.on_status(&self.status);
    }

    fn on_network_change(&mut self, observation: &NetworkObservation) {
        if !self.session_desired {
            debug!(network = %observation.network_id, "Network changed with no session desired");
            return;
        }
        info!(network = %observation.network_id, "Validated network change, reconnecting");
        match self.phase {
            BindPhase::Registered => {
                if let Some(config) = self.last_config.clone() {
                    self.send_connect(config);
                }
            }
            BindPhase::Unbound => {
                self.pending_connect = self.last_config.clone();
                self.bind();
            }
            BindPhase::Binding | BindPhase::Bound => {
                debug!("Bind in progress, pending connect covers the change");
            }
        }
    }

    /// Set a status that came from a terminal event. Returns whether it changed.
    fn apply_terminal(&mut self, status: ConnectionStatus) -> bool {
        self.sync.resolve(self.seams.timers.as_mut());
        if self.status == status {
            debug!(%status, "Status unchanged");
            return false;
        }

        self.status = status;
        let listener = &self.seams.listener;
        match &self.status {
            ConnectionStatus::Connected => listener.on_connected(),
            ConnectionStatus::Disconnected => listener.on_disconnected(),
            ConnectionStatus::Reconnecting => listener.on_reconnecting(),
            // Errors are reported through on_service_error by the caller.
            ConnectionStatus::Connecting | ConnectionStatus::Error(_) => {}
        }
        true
    }

    fn send_connect(&mut self, config: VpnConfig) {
        self.disconnect_requested = false;
        match self.send(Command::Connect(config.clone())) {
            Ok(()) => self.connect_sent = true,
            // Channel death already started a rebind; retry the connect on it.
            Err(ChannelError::Dead) if self.session_desired && self.phase == BindPhase::Binding => {
                self.pending_connect = Some(config);
            }
            Err(_) => {}
        }
    }

    /// Send a command if the bind phase allows it. A dead channel is torn
    /// down before this returns.
    fn send(&mut self, command: Command) -> Result<(), ChannelError> {
        let name = command.name();
        let required = match command {
            Command::RegisterClient => BindPhase::Bound,
            _ => BindPhase::Registered,
        };
        if self.phase < required {
            debug!(command = name, phase = ?self.phase, "Dropping command, not bound");
            return Err(ChannelError::NotConnected);
        }
        let Some(channel) = self.channel.as_mut() else {
            return Err(ChannelError::NotConnected);
        };

        match channel.send(command) {
            Ok(()) => {
                debug!(command = name, generation = self.generation, "Command sent");
                Ok(())
            }
            Err(ChannelError::Dead) => {
                self.on_channel_death();
                Err(ChannelError::Dead)
            }
            Err(e) => {
                warn!(command = name, "Dropping command: {}", e);
                Err(e)
            }
        }
    }

    fn publish_if_changed(&mut self) {
        let snapshot = self.snapshot();
        if snapshot != self.last_published {
            self.seams.snapshots.publish(&snapshot);
            self.last_published = snapshot;
        }
    }
}
