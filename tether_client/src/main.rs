//! tether client
//!
//! Foreground client for the tether tunnel service. It keeps the displayed
//! connection state in sync with the service through the session
//! coordinator and prints every notification as it arrives.

mod console;

use anyhow::Context;
use clap::{Parser, Subcommand};
use shared_utils::config::Config;
use shared_utils::logging::{init_logging, parse_level, LogOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tether_session::network::MonitorOptions;
use tether_session::{
    ConnectionStatus, Coordinator, CoordinatorOptions, Notification, NotificationForwarder,
    SessionHandle, StateStore, VpnConfig,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long to wait for the service to settle the status
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the tunnel to come down after a stop
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Command-line arguments for the client
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Path to the Unix Domain Socket of the tunnel service
    #[clap(short, long)]
    socket: Option<PathBuf>,

    /// File holding the last known session state
    #[clap(long)]
    state_file: Option<PathBuf>,

    /// Log level
    #[clap(short, long)]
    log_level: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a session and follow it until Ctrl+C
    Connect {
        /// Server to connect to
        #[clap(long)]
        server: String,

        /// File with protocol configuration handed to the service as is
        #[clap(long)]
        payload_file: Option<PathBuf>,
    },

    /// End the active session
    Disconnect,

    /// Ask the service for the current status
    Status,

    /// Print the last persisted state without contacting the service
    #[clap(name = "last-state")]
    LastState,

    /// Follow the session until Ctrl+C
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::load_or_default(Config::default_path())?,
    };
    if let Some(socket) = args.socket.clone() {
        config.socket_path = socket;
    }
    if let Some(state_file) = args.state_file.clone() {
        config.client.state_file = state_file;
    }
    if let Some(level) = args.log_level.clone() {
        config.log_level = level;
    }

    let _guard = init_logging(LogOptions {
        level: parse_level(&config.log_level),
        log_to_file: config.logging.log_to_file,
        log_dir: config.logging.log_dir.clone(),
        log_file_name: "tether-client".to_string(),
        json_format: config.logging.json_format,
        include_file_line: false,
        ..Default::default()
    });
    debug!("Socket path: {}", config.socket_path.display());
    debug!("State file: {}", config.client.state_file.display());

    let store = Arc::new(StateStore::new(config.client.state_file.clone()));

    match args.command {
        Command::LastState => {
            let state = store.read();
            println!("{}", console::describe_state(&state));
            debug!("{}", serde_json::to_string(&state)?);
            Ok(())
        }
        Command::Connect {
            server,
            payload_file,
        } => {
            let payload = match payload_file {
                Some(path) => tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                None => String::new(),
            };
            let mut session = Session::spawn(&config, store)?;
            session.handle.start(VpnConfig::new(server, payload))?;
            session.follow().await?;

            session.handle.stop()?;
            if !console::wait_for_disconnect(&mut session.notifications, STOP_TIMEOUT).await {
                warn!("Tunnel did not confirm the disconnect");
            }
            session.close().await;
            Ok(())
        }
        Command::Disconnect => {
            let mut session = Session::spawn(&config, store)?;
            match session.service_status().await? {
                Some(ConnectionStatus::Disconnected) => println!("Already disconnected"),
                Some(_) => {
                    session.handle.stop()?;
                    if !console::wait_for_disconnect(&mut session.notifications, STOP_TIMEOUT)
                        .await
                    {
                        warn!("Tunnel did not confirm the disconnect");
                    }
                }
                None => warn!("Tunnel service did not report a status"),
            }
            session.close().await;
            Ok(())
        }
        Command::Status => {
            let mut session = Session::spawn(&config, store)?;
            if session.service_status().await?.is_none() {
                warn!("Tunnel service did not report a status");
            }
            println!("{}", console::describe_state(&session.handle.state()));
            session.close().await;
            Ok(())
        }
        Command::Watch => {
            let mut session = Session::spawn(&config, store)?;
            println!(
                "Last known: {}",
                console::describe_state(&session.handle.state())
            );
            session.handle.attach()?;
            session.follow().await?;
            session.close().await;
            Ok(())
        }
    }
}

/// A running coordinator plus the notifications it produces
struct Session {
    handle: SessionHandle,
    task: JoinHandle<()>,
    notifications: UnboundedReceiver<Notification>,
}

impl Session {
    fn spawn(config: &Config, store: Arc<StateStore>) -> anyhow::Result<Self> {
        let network = if config.network.enabled {
            Some(MonitorOptions {
                poll_interval: config.network.poll_interval(),
                probe_address: config.network.probe_socket_addr()?,
                probe_timeout: config.network.probe_timeout(),
            })
        } else {
            None
        };

        let (listener, notifications) = NotificationForwarder::channel();
        let options = CoordinatorOptions {
            socket_path: config.socket_path.clone(),
            network,
        };
        let (handle, task) = Coordinator::spawn(options, store, Arc::new(listener));
        Ok(Self {
            handle,
            task,
            notifications,
        })
    }

    /// Attach and ask the service itself for the status. A status made up
    /// by the bind timeout is never returned.
    async fn service_status(&mut self) -> anyhow::Result<Option<ConnectionStatus>> {
        self.handle.attach()?;
        if !console::wait_for_service(&mut self.notifications, RESOLVE_TIMEOUT).await {
            warn!("Tunnel service unreachable");
            return Ok(None);
        }
        self.handle.refresh_status()?;
        Ok(console::wait_for_status(&mut self.notifications, RESOLVE_TIMEOUT).await)
    }

    /// Render notifications until Ctrl+C
    async fn follow(&mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    info!("Interrupted");
                    return Ok(());
                }
                notification = self.notifications.recv() => match notification {
                    Some(notification) => console::render(&notification),
                    None => return Ok(()),
                },
            }
        }
    }

    async fn close(self) {
        self.handle.shutdown();
        if let Err(e) = self.task.await {
            warn!("Coordinator task failed: {}", e);
        }
    }
}
