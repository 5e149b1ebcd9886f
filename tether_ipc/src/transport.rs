//! IPC Transport Layer
//!
//! This module defines the framing, the error type and the Unix domain socket
//! endpoints for both sides of the protocol. A connection is split into an
//! independent read half and write half so events can be received while
//! commands are being sent.

use crate::messages::{Command, RemoteEvent};
use async_trait::async_trait;
use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::{timeout, Duration};

/// Frames larger than this are rejected as a protocol error
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Bound on writes and on reading a frame body once its header arrived
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Result type for IPC operations
pub type IpcResult<T> = Result<T, IpcError>;

/// Error type for IPC operations
#[derive(Error, Debug)]
pub enum IpcError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),
}

/// Write one length-prefixed frame
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> IpcResult<()>
where
    W: AsyncWrite + Unpin + Send,
    T: Serialize + Sync,
{
    let serialized = bincode::serialize(message)?;
    if serialized.len() > MAX_FRAME_LEN {
        return Err(IpcError::Protocol(format!(
            "Message too large: {} bytes",
            serialized.len()
        )));
    }

    let mut frame = Vec::with_capacity(4 + serialized.len());
    frame.extend_from_slice(&(serialized.len() as u32).to_le_bytes());
    frame.extend_from_slice(&serialized);

    match timeout(IO_TIMEOUT, writer.write_all(&frame)).await {
        Ok(result) => result?,
        Err(_) => return Err(IpcError::Timeout("Write operation timed out".to_string())),
    };

    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly between
/// frames. Waiting for the header is unbounded since events are push-driven.
pub async fn read_frame<R, T>(reader: &mut R) -> IpcResult<Option<T>>
where
    R: AsyncRead + Unpin + Send,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(IpcError::Protocol(
                "Connection closed inside a frame header".to_string(),
            ));
        }
        filled += n;
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(IpcError::Protocol(format!(
            "Message too large: {} bytes",
            len
        )));
    }

    let mut data = vec![0u8; len];
    match timeout(IO_TIMEOUT, reader.read_exact(&mut data)).await {
        Ok(result) => result?,
        Err(_) => return Err(IpcError::Timeout("Read operation timed out".to_string())),
    };

    Ok(Some(bincode::deserialize(&data)?))
}

/// Source of events pushed by the tunnel service
#[async_trait]
pub trait EventSource: Send {
    /// Receive the next event, or `None` once the service closed the connection
    async fn receive_event(&mut self) -> IpcResult<Option<RemoteEvent>>;
}

/// Sink for commands addressed to the tunnel service
#[async_trait]
pub trait CommandSink: Send {
    /// Send a command to the service
    async fn send_command(&mut self, command: &Command) -> IpcResult<()>;

    /// Shut the write side down
    async fn close(&mut self) -> IpcResult<()>;
}

/// Client side of a Unix Domain Socket connection to the tunnel service
pub struct UnixSocketTransport {
    stream: UnixStream,
}

impl UnixSocketTransport {
    /// Connect to the tunnel service listening on the given path
    pub async fn connect<P: AsRef<Path>>(path: P) -> IpcResult<Self> {
        let stream = UnixStream::connect(path.as_ref()).await.map_err(|e| {
            IpcError::Connection(format!(
                "Failed to connect to {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Ok(Self { stream })
    }

    /// Split into independently owned event and command halves
    pub fn into_split(self) -> (EventReader, CommandWriter) {
        let (read, write) = self.stream.into_split();
        (EventReader { read }, CommandWriter { write })
    }
}

/// Read half of a client connection
pub struct EventReader {
    read: OwnedReadHalf,
}

#[async_trait]
impl EventSource for EventReader {
    async fn receive_event(&mut self) -> IpcResult<Option<RemoteEvent>> {
        read_frame(&mut self.read).await
    }
}

/// Write half of a client connection
pub struct CommandWriter {
    write: OwnedWriteHalf,
}

#[async_trait]
impl CommandSink for CommandWriter {
    async fn send_command(&mut self, command: &Command) -> IpcResult<()> {
        write_frame(&mut self.write, command).await
    }

    async fn close(&mut self) -> IpcResult<()> {
        self.write.shutdown().await.map_err(IpcError::Io)
    }
}

/// Service side Unix Domain Socket listener
pub struct UnixSocketListener {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl UnixSocketListener {
    /// Bind a listener at the given path, replacing a stale socket file
    pub async fn bind<P: AsRef<Path>>(path: P) -> IpcResult<Self> {
        let path = path.as_ref();

        // Remove the socket file if it already exists
        if path.exists() {
            std::fs::remove_file(path).map_err(|e| {
                IpcError::Connection(format!("Failed to remove existing socket: {}", e))
            })?;
        }

        let listener = UnixListener::bind(path)
            .map_err(|e| IpcError::Connection(format!("Failed to bind to socket: {}", e)))?;

        // rw-rw----
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660)).map_err(
                |e| IpcError::Connection(format!("Failed to set socket permissions: {}", e)),
            )?;
        }

        Ok(Self {
            listener,
            socket_path: path.to_path_buf(),
        })
    }

    /// Path this listener is bound to
    pub fn path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept a new client connection
    pub async fn accept(&self) -> IpcResult<ClientConnection> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|e| IpcError::Connection(format!("Failed to accept connection: {}", e)))?;

        debug!("Accepted connection on {}", self.socket_path.display());
        Ok(ClientConnection { stream })
    }
}

impl Drop for UnixSocketListener {
    fn drop(&mut self) {
        // Clean up the socket file when the listener is dropped
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Service side of one client connection
pub struct ClientConnection {
    stream: UnixStream,
}

impl ClientConnection {
    /// Split into independently owned command and event halves
    pub fn into_split(self) -> (CommandReader, EventWriter) {
        let (read, write) = self.stream.into_split();
        (CommandReader { read }, EventWriter { write })
    }
}

/// Read half of a service-side connection
pub struct CommandReader {
    read: OwnedReadHalf,
}

impl CommandReader {
    /// Receive the next command, or `None` once the client hung up
    pub async fn receive_command(&mut self) -> IpcResult<Option<Command>> {
        read_frame(&mut self.read).await
    }
}

/// Write half of a service-side connection
pub struct EventWriter {
    write: OwnedWriteHalf,
}

impl EventWriter {
    /// Push an event to the client
    pub async fn send_event(&mut self, event: &RemoteEvent) -> IpcResult<()> {
        write_frame(&mut self.write, event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ConnectionStatus, VpnConfig};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_unix_socket_round_trip() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("tether_test.sock");

        let listener = UnixSocketListener::bind(&socket_path).await.unwrap();

        let server = tokio::spawn(async move {
            let connection = listener.accept().await.unwrap();
            let (mut commands, mut events) = connection.into_split();

            match commands.receive_command().await.unwrap() {
                Some(Command::RequestStatus) => {}
                other => panic!("Unexpected command: {:?}", other),
            }
            events
                .send_event(&RemoteEvent::StatusReport(ConnectionStatus::Connected))
                .await
                .unwrap();

            // The client closes its write side next.
            assert!(commands.receive_command().await.unwrap().is_none());
        });

        let transport = UnixSocketTransport::connect(&socket_path).await.unwrap();
        let (mut events, mut commands) = transport.into_split();

        commands
            .send_command(&Command::RequestStatus)
            .await
            .unwrap();
        let event = events.receive_event().await.unwrap();
        assert_eq!(
            event,
            Some(RemoteEvent::StatusReport(ConnectionStatus::Connected))
        );

        commands.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_drop_removes_socket_file() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("tether_drop.sock");

        let listener = UnixSocketListener::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());
        drop(listener);
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_connect_without_listener_fails() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("missing.sock");

        match UnixSocketTransport::connect(&socket_path).await {
            Err(IpcError::Connection(_)) => {}
            Err(e) => panic!("Unexpected error: {:?}", e),
            Ok(_) => panic!("Connecting to a missing socket should fail"),
        }
    }

    #[tokio::test]
    async fn test_clean_eof_between_frames() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, &Command::Connect(VpnConfig::new("srv", "cfg")))
            .await
            .unwrap();
        drop(client);

        let first: Option<Command> = read_frame(&mut server).await.unwrap();
        assert_eq!(first, Some(Command::Connect(VpnConfig::new("srv", "cfg"))));
        let second: Option<Command> = read_frame(&mut server).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_eof_inside_header_is_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(16);
        client.write_all(&[7, 0]).await.unwrap();
        drop(client);

        let result: IpcResult<Option<Command>> = read_frame(&mut server).await;
        assert!(matches!(result, Err(IpcError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(16);
        let len = (MAX_FRAME_LEN as u32) + 1;
        client.write_all(&len.to_le_bytes()).await.unwrap();

        let result: IpcResult<Option<RemoteEvent>> = read_frame(&mut server).await;
        assert!(matches!(result, Err(IpcError::Protocol(_))));
    }
}
