//! Tokio wiring for the session machine.
//!
//! One task owns the [`SessionMachine`] and drains a bounded inbox. User
//! requests, socket events, timer expiries and network observations all
//! arrive there, so the machine never needs a lock. A second task persists
//! snapshots on the blocking pool.

use crate::channel;
use crate::error::SessionError;
use crate::listener::SessionListener;
use crate::machine::{Input, Seams, ServiceBinder, SessionMachine, SnapshotSink};
use crate::network::{MonitorOptions, NetworkObservation, route_monitor};
use crate::state::SessionState;
use crate::store::StateStore;
use crate::sync::{TimerKind, TimerService};
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tether_ipc::VpnConfig;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the coordinator inbox
pub const INBOX_CAPACITY: usize = 64;

type ObservationStream = Pin<Box<dyn Stream<Item = NetworkObservation> + Send>>;

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Socket the tunnel service listens on
    pub socket_path: PathBuf,
    /// Route monitoring; `None` disables network-driven reconnects
    pub network: Option<MonitorOptions>,
}

/// Entry point for running a coordinator.
pub struct Coordinator;

impl Coordinator {
    /// Spawn the coordinator on the current tokio runtime.
    ///
    /// The displayed state starts as whatever `store` holds. The returned
    /// task finishes after [`SessionHandle::shutdown`], once the final
    /// snapshot has been written.
    pub fn spawn(
        options: CoordinatorOptions,
        store: Arc<StateStore>,
        listener: Arc<dyn SessionListener>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let network = options.network.map(route_monitor);
        Self::spawn_with_network(options.socket_path, store, listener, network)
    }

    fn spawn_with_network(
        socket_path: PathBuf,
        store: Arc<StateStore>,
        listener: Arc<dyn SessionListener>,
        network: Option<ObservationStream>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let initial = store.read();
        info!(status = %initial.status(), server = ?initial.server_name(), "Restored session state");

        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (state_tx, state_rx) = watch::channel(initial.clone());
        let shutdown = CancellationToken::new();

        let seams = Seams {
            binder: Box::new(SocketBinder::new(socket_path, inbox_tx.clone())),
            timers: Box::new(TokioTimers::new(inbox_tx.clone())),
            listener,
            snapshots: Box::new(state_tx),
        };
        let machine = SessionMachine::new(initial.clone(), seams);

        let persist_task = tokio::spawn(persist(store, state_rx.clone(), initial));
        let task = tokio::spawn(run(
            machine,
            inbox_rx,
            network,
            shutdown.clone(),
            persist_task,
        ));

        let handle = SessionHandle {
            inbox: inbox_tx,
            state: state_rx,
            shutdown,
        };
        (handle, task)
    }
}

async fn run(
    mut machine: SessionMachine,
    mut inbox: mpsc::Receiver<Input>,
    mut network: Option<ObservationStream>,
    shutdown: CancellationToken,
    persist_task: JoinHandle<()>,
) {
    debug!("Coordinator started");
    loop {
        let input = tokio::select! {
            _ = shutdown.cancelled() => break,
            input = inbox.recv() => match input {
                Some(input) => input,
                None => break,
            },
            observation = next_observation(&mut network) => match observation {
                Some(observation) => Input::Network(observation),
                None => {
                    debug!("Network monitor ended");
                    network = None;
                    continue;
                }
            },
        };
        machine.handle(input);
    }

    info!("Coordinator shutting down");
    machine.handle(Input::Detach);
    // Dropping the machine closes the snapshot channel, which ends the
    // persistence task after its last write.
    drop(machine);
    if let Err(e) = persist_task.await {
        warn!("Persistence task failed: {}", e);
    }
}

async fn next_observation(network: &mut Option<ObservationStream>) -> Option<NetworkObservation> {
    match network {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn persist(
    store: Arc<StateStore>,
    mut snapshots: watch::Receiver<SessionState>,
    mut written: SessionState,
) {
    while snapshots.changed().await.is_ok() {
        let state = snapshots.borrow_and_update().clone();
        if state != written {
            write_snapshot(&store, state.clone()).await;
            written = state;
        }
    }

    // A value published right before shutdown may not have been seen yet.
    let last = snapshots.borrow().clone();
    if last != written {
        write_snapshot(&store, last).await;
    }
}

async fn write_snapshot(store: &Arc<StateStore>, state: SessionState) {
    let store = Arc::clone(store);
    match tokio::task::spawn_blocking(move || store.write(&state)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Failed to persist session state: {}", e),
        Err(e) => warn!("Persistence write panicked: {}", e),
    }
}

impl SnapshotSink for watch::Sender<SessionState> {
    fn publish(&mut self, state: &SessionState) {
        self.send_replace(state.clone());
    }
}

/// Binds by connecting to the service socket in a background task.
struct SocketBinder {
    socket_path: PathBuf,
    inbox: mpsc::Sender<Input>,
    attempt: Option<(u64, AbortHandle)>,
}

impl SocketBinder {
    fn new(socket_path: PathBuf, inbox: mpsc::Sender<Input>) -> Self {
        Self {
            socket_path,
            inbox,
            attempt: None,
        }
    }
}

impl ServiceBinder for SocketBinder {
    fn bind(&mut self, generation: u64) {
        if let Some((_, previous)) = self.attempt.take() {
            previous.abort();
        }
        let path = self.socket_path.clone();
        let inbox = self.inbox.clone();
        let task = tokio::spawn(async move { channel::connect(&path, generation, inbox).await });
        self.attempt = Some((generation, task.abort_handle()));
    }

    fn unbind(&mut self, generation: u64) {
        // Live channels are closed by dropping their handle; this only
        // stops an attempt that has not reported back yet.
        if let Some((attempt, handle)) = self.attempt.take() {
            if attempt == generation {
                handle.abort();
            } else {
                self.attempt = Some((attempt, handle));
            }
        }
    }
}

/// One sleeping task per armed timer kind.
struct TokioTimers {
    inbox: mpsc::Sender<Input>,
    armed: HashMap<TimerKind, AbortHandle>,
}

impl TokioTimers {
    fn new(inbox: mpsc::Sender<Input>) -> Self {
        Self {
            inbox,
            armed: HashMap::new(),
        }
    }
}

impl TimerService for TokioTimers {
    fn arm(&mut self, kind: TimerKind, token: u64, after: Duration) {
        self.cancel(kind);
        let inbox = self.inbox.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = inbox.send(Input::TimerFired { kind, token }).await;
        });
        self.armed.insert(kind, task.abort_handle());
    }

    fn cancel(&mut self, kind: TimerKind) {
        if let Some(task) = self.armed.remove(&kind) {
            task.abort();
        }
    }
}

/// Cheap, cloneable handle used by the presentation layer.
///
/// Every request is enqueued without waiting; results arrive later through
/// the [`SessionListener`] and the state channel.
#[derive(Clone)]
pub struct SessionHandle {
    inbox: mpsc::Sender<Input>,
    state: watch::Receiver<SessionState>,
    shutdown: CancellationToken,
}

impl SessionHandle {
    /// Start a session, binding to the service first if needed
    pub fn start(&self, config: VpnConfig) -> Result<(), SessionError> {
        self.enqueue(Input::Start(config))
    }

    /// End the session
    pub fn stop(&self) -> Result<(), SessionError> {
        self.enqueue(Input::Stop)
    }

    pub fn set_save_logs(&self, enabled: bool) -> Result<(), SessionError> {
        self.enqueue(Input::SetSaveLogs(enabled))
    }

    /// Bind to the service to observe its state without starting a session
    pub fn attach(&self) -> Result<(), SessionError> {
        self.enqueue(Input::Attach)
    }

    /// Ask the service for its status again once registered
    pub fn refresh_status(&self) -> Result<(), SessionError> {
        self.enqueue(Input::RefreshStatus)
    }

    pub fn detach(&self) -> Result<(), SessionError> {
        self.enqueue(Input::Detach)
    }

    /// Stop the coordinator. Pending inputs are discarded.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Latest published state
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    fn enqueue(&self, input: Input) -> Result<(), SessionError> {
        self.inbox.try_send(input).map_err(|e| match e {
            TrySendError::Full(_) => SessionError::Busy,
            TrySendError::Closed(_) => SessionError::Closed,
        })
    }
}
