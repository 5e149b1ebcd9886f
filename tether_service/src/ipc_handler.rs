//! IPC Handler for the tunnel service
//!
//! Accepts client connections and serves the command/event protocol. A
//! connection only receives pushed events after it sent `RegisterClient`;
//! the registration dies with the connection.

use crate::tunnel::TunnelSimulator;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tether_ipc::{ClientConnection, Command, RemoteEvent, UnixSocketListener};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Commands read ahead of the handler per connection
const COMMAND_BACKLOG: usize = 16;

/// IPC Handler for the tunnel service
pub struct IpcHandler {
    tunnel: Arc<TunnelSimulator>,
}

impl IpcHandler {
    /// Create a new IPC handler serving the given tunnel
    pub fn new(tunnel: Arc<TunnelSimulator>) -> Self {
        Self { tunnel }
    }

    /// Bind the socket and run until `shutdown_rx` fires
    pub async fn run<P: AsRef<Path>>(
        &self,
        socket_path: P,
        shutdown_rx: oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        let listener = UnixSocketListener::bind(&socket_path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to socket: {}", e))?;

        info!(
            "IPC handler listening on {}",
            socket_path.as_ref().display()
        );

        self.run_with_listener(listener, shutdown_rx).await
    }

    /// Serve connections from an already bound listener
    pub async fn run_with_listener(
        &self,
        listener: UnixSocketListener,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        // Channel for client tasks to signal completion
        let (client_done_tx, mut client_done_rx) = mpsc::channel::<u64>(10);
        let mut client_tasks = HashMap::new();
        let mut next_client_id = 0u64;

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok(connection) => {
                            next_client_id += 1;
                            let client_id = next_client_id;
                            info!("Accepted connection from client ID={}", client_id);

                            let tunnel = Arc::clone(&self.tunnel);
                            let client_done_tx = client_done_tx.clone();
                            let handle = tokio::spawn(async move {
                                if let Err(e) = Self::handle_client(connection, client_id, tunnel).await {
                                    error!("Error handling client ID={}: {}", client_id, e);
                                }

                                if let Err(e) = client_done_tx.send(client_id).await {
                                    error!("Failed to send client done signal: {}", e);
                                }
                            });

                            client_tasks.insert(client_id, handle);
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                },

                Some(client_id) = client_done_rx.recv() => {
                    debug!("Client ID={} task completed", client_id);
                    client_tasks.remove(&client_id);
                },

                _ = &mut shutdown_rx => {
                    info!("Received shutdown signal, closing IPC handler");
                    break;
                }
            }
        }

        // Clients never hang up on their own, so close them here.
        for (id, handle) in client_tasks {
            debug!("Closing client ID={}", id);
            handle.abort();
            let _ = handle.await;
        }

        info!("IPC handler shut down");
        Ok(())
    }

    /// Handle a client connection
    async fn handle_client(
        connection: ClientConnection,
        client_id: u64,
        tunnel: Arc<TunnelSimulator>,
    ) -> anyhow::Result<()> {
        let (mut commands, mut events) = connection.into_split();

        // Frame reads are not cancel-safe, so they get their own task.
        let (command_tx, mut command_rx) = mpsc::channel(COMMAND_BACKLOG);
        let reader = tokio::spawn(async move {
            loop {
                match commands.receive_command().await {
                    Ok(Some(command)) => {
                        if command_tx.send(command).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("Client ID={} disconnected", client_id);
                        break;
                    }
                    Err(e) => {
                        warn!("Error receiving command from client ID={}: {}", client_id, e);
                        break;
                    }
                }
            }
        });

        let mut subscription: Option<broadcast::Receiver<RemoteEvent>> = None;
        let result = loop {
            tokio::select! {
                command = command_rx.recv() => {
                    let Some(command) = command else { break Ok(()) };
                    debug!("Received {} from client ID={}", command.name(), client_id);

                    match command {
                        Command::RegisterClient => {
                            if subscription.is_none() {
                                info!("Client ID={} registered for events", client_id);
                                subscription = Some(tunnel.subscribe());
                            }
                        }
                        Command::RequestStatus => {
                            let report = RemoteEvent::StatusReport(tunnel.status());
                            if let Err(e) = events.send_event(&report).await {
                                break Err(anyhow::anyhow!("Failed to send status report: {}", e));
                            }
                        }
                        Command::Connect(config) => tunnel.connect(config),
                        Command::Disconnect => tunnel.disconnect(),
                        Command::SetSaveLogs(enabled) => tunnel.set_save_logs(enabled),
                    }
                }

                event = next_event(&mut subscription) => {
                    match event {
                        Ok(event) => {
                            if let Err(e) = events.send_event(&event).await {
                                break Err(anyhow::anyhow!("Failed to push event: {}", e));
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Client ID={} lagged, {} events dropped", client_id, skipped);
                        }
                        Err(RecvError::Closed) => break Ok(()),
                    }
                }
            }
        };

        reader.abort();
        result
    }
}

async fn next_event(
    subscription: &mut Option<broadcast::Receiver<RemoteEvent>>,
) -> Result<RemoteEvent, RecvError> {
    match subscription {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
