//! The message channel to the tunnel service.
//!
//! A [`ChannelHandle`] owns one live endpoint. Sends never block: commands
//! go into a small queue drained by a writer task, and events read by a pump
//! task are posted back to the coordinator inbox tagged with the handle's
//! generation. Dropping the handle closes the endpoint and stops both tasks.

use crate::error::ChannelError;
use crate::machine::Input;
use std::fmt;
use std::path::Path;
use tether_ipc::{Command, CommandSink, EventSource, UnixSocketTransport};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Commands that may be queued on one channel before sends report congestion
const COMMAND_QUEUE_DEPTH: usize = 16;

/// Outbound half of a live endpoint, as seen by the coordinator.
pub trait ServiceLink: Send {
    /// Queue a command without waiting. No delivery acknowledgement is implied.
    fn send(&mut self, command: Command) -> Result<(), ChannelError>;

    /// Tear the endpoint down. Further sends fail with `NotConnected`.
    fn close(&mut self);
}

/// Ownership token for one bind generation's endpoint. Never reused.
pub struct ChannelHandle {
    generation: u64,
    link: Box<dyn ServiceLink>,
}

impl ChannelHandle {
    pub fn new(generation: u64, link: Box<dyn ServiceLink>) -> Self {
        Self { generation, link }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn send(&mut self, command: Command) -> Result<(), ChannelError> {
        self.link.send(command)
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.link.close();
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// [`ServiceLink`] backed by the socket tasks spawned in [`open`].
pub struct SocketLink {
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
}

impl ServiceLink for SocketLink {
    fn send(&mut self, command: Command) -> Result<(), ChannelError> {
        if self.cancel.is_cancelled() {
            return Err(ChannelError::NotConnected);
        }
        match self.commands.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ChannelError::Congested),
            // The writer task only exits early when the socket failed.
            Err(TrySendError::Closed(_)) => Err(ChannelError::Dead),
        }
    }

    fn close(&mut self) {
        self.cancel.cancel();
    }
}

/// Connect to the service socket and report the outcome to the coordinator
/// as `Bound` or `BindFailed`.
pub async fn connect(path: &Path, generation: u64, inbox: mpsc::Sender<Input>) {
    match UnixSocketTransport::connect(path).await {
        Ok(transport) => {
            info!(generation, "Connected to tunnel service at {}", path.display());
            let (events, commands) = transport.into_split();
            open(generation, events, commands, inbox).await;
        }
        Err(e) => {
            warn!(generation, "Bind failed: {}", e);
            let reason = e.to_string();
            let _ = inbox.send(Input::BindFailed { generation, reason }).await;
        }
    }
}

/// Wrap an established endpoint in a [`ChannelHandle`] and start its tasks.
///
/// `Bound` is posted before the event pump starts, so the coordinator always
/// sees the handle before the first event of its generation.
pub async fn open<E, C>(generation: u64, events: E, commands: C, inbox: mpsc::Sender<Input>)
where
    E: EventSource + 'static,
    C: CommandSink + 'static,
{
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);

    tokio::spawn(write_commands(
        generation,
        commands,
        rx,
        cancel.clone(),
        inbox.clone(),
    ));

    let link = SocketLink {
        commands: tx,
        cancel: cancel.clone(),
    };
    let handle = ChannelHandle::new(generation, Box::new(link));
    if inbox.send(Input::Bound { generation, handle }).await.is_err() {
        // Coordinator is gone; the returned handle was dropped and closed.
        return;
    }

    tokio::spawn(pump_events(generation, events, cancel, inbox));
}

async fn write_commands<C: CommandSink>(
    generation: u64,
    mut sink: C,
    mut commands: mpsc::Receiver<Command>,
    cancel: CancellationToken,
    inbox: mpsc::Sender<Input>,
) {
    loop {
        tokio::select! {
            biased;

            command = commands.recv() => {
                let Some(command) = command else { break };
                if let Err(e) = sink.send_command(&command).await {
                    warn!(generation, command = command.name(), "Failed to send command: {}", e);
                    let _ = inbox.send(Input::ChannelDied { generation }).await;
                    break;
                }
                debug!(generation, command = command.name(), "Command written");
            }
            _ = cancel.cancelled() => break,
        }
    }

    if let Err(e) = sink.close().await {
        debug!(generation, "Error shutting down command stream: {}", e);
    }
}

async fn pump_events<E: EventSource>(
    generation: u64,
    mut events: E,
    cancel: CancellationToken,
    inbox: mpsc::Sender<Input>,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            received = events.receive_event() => received,
        };

        match received {
            Ok(Some(event)) => {
                if inbox.send(Input::Remote { generation, event }).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                info!(generation, "Tunnel service closed the connection");
                break;
            }
            Err(e) => {
                warn!(generation, "Error reading from tunnel service: {}", e);
                break;
            }
        }
    }

    let _ = inbox.send(Input::ChannelDied { generation }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tether_ipc::{RemoteEvent, UnixSocketListener};

    #[tokio::test]
    async fn test_bound_arrives_before_events_and_death() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("svc.sock");
        let listener = UnixSocketListener::bind(&path).await.unwrap();
        let (inbox_tx, mut inbox) = mpsc::channel(8);

        let service = tokio::spawn(async move {
            let (mut commands, mut events) = listener.accept().await.unwrap().into_split();
            let command = commands.receive_command().await.unwrap();
            assert_eq!(command, Some(Command::RegisterClient));
            events.send_event(&RemoteEvent::Connected).await.unwrap();
            // Dropping both halves closes the connection.
        });

        connect(&path, 7, inbox_tx).await;

        let mut handle = match inbox.recv().await.unwrap() {
            Input::Bound { generation, handle } => {
                assert_eq!(generation, 7);
                handle
            }
            other => panic!("expected Bound, got {:?}", other),
        };
        handle.send(Command::RegisterClient).unwrap();

        assert!(matches!(
            inbox.recv().await.unwrap(),
            Input::Remote { generation: 7, event: RemoteEvent::Connected }
        ));
        assert!(matches!(
            inbox.recv().await.unwrap(),
            Input::ChannelDied { generation: 7 }
        ));
        service.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_socket_reports_bind_failure() {
        let dir = tempdir().unwrap();
        let (inbox_tx, mut inbox) = mpsc::channel(8);

        connect(&dir.path().join("absent.sock"), 3, inbox_tx).await;

        assert!(matches!(
            inbox.recv().await.unwrap(),
            Input::BindFailed { generation: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_send_after_close_is_not_connected() {
        let (tx, _rx) = mpsc::channel(1);
        let mut link = SocketLink {
            commands: tx,
            cancel: CancellationToken::new(),
        };

        link.send(Command::RequestStatus).unwrap();
        assert_eq!(link.send(Command::RequestStatus), Err(ChannelError::Congested));

        link.close();
        assert_eq!(link.send(Command::Disconnect), Err(ChannelError::NotConnected));
    }

    #[tokio::test]
    async fn test_send_to_stopped_writer_is_dead() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut link = SocketLink {
            commands: tx,
            cancel: CancellationToken::new(),
        };

        assert_eq!(link.send(Command::Disconnect), Err(ChannelError::Dead));
    }
}
