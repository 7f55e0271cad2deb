//! IPC Server for handling CLI connections via Unix Domain Sockets.
//!
//! The server listens on a Unix socket and accepts connections from CLI clients,
//! allowing them to send commands and receive responses.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use super::messages::{IpcErrorKind, IpcRequest, IpcResponse};

/// Produces a response for each request read from a connection.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: IpcRequest) -> impl Future<Output = IpcResponse> + Send;
}

/// A server that listens for IPC connections on a Unix Domain Socket.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the server to the specified socket path.
    ///
    /// Parent directories are created as needed and a stale socket file at
    /// `path` is replaced.
    ///
    /// # Arguments
    ///
    /// * `path` - The path where the Unix socket will be created.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, the stale
    /// socket cannot be removed, or the socket cannot be bound.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// The socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept a new incoming connection.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting the connection fails.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }

    /// Accepts connections and answers requests with `handler` until
    /// `cancel` fires. The socket file is removed on exit.
    ///
    /// # Arguments
    ///
    /// * `handler` - Answers every request of every connection.
    /// * `cancel` - Stops the accept loop and all connection tasks.
    pub async fn serve<H: RequestHandler>(self, handler: Arc<H>, cancel: CancellationToken) {
        tracing::info!(path = %self.path.display(), "IPC server listening");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.accept() => match accepted {
                    Ok(conn) => {
                        let handler = Arc::clone(&handler);
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = conn.serve(handler) => {}
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept IPC connection");
                    }
                },
            }
        }

        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!(error = %e, "Could not remove IPC socket");
        }
        tracing::info!("IPC server stopped");
    }
}

/// A connection to an IPC client.
///
/// Wraps a Unix stream and speaks newline-delimited JSON.
pub struct IpcConnection {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Read the next request from the client.
    ///
    /// Returns `None` if the client has disconnected.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Io`] if reading fails. A line that is not a valid
    /// request yields [`IpcError::Json`]; the connection stays usable.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        let mut line = String::new();
        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(IpcError::Io)?;

        if bytes_read == 0 {
            return Ok(None);
        }

        let request = serde_json::from_str(line.trim()).map_err(IpcError::Json)?;
        Ok(Some(request))
    }

    /// Send a response to the client.
    ///
    /// # Arguments
    ///
    /// * `response` - The response to send.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(response).map_err(IpcError::Json)?;
        json.push('\n');

        self.writer
            .write_all(json.as_bytes())
            .await
            .map_err(IpcError::Io)?;
        self.writer.flush().await.map_err(IpcError::Io)?;

        Ok(())
    }

    /// Answers requests until the client disconnects.
    pub async fn serve<H: RequestHandler>(mut self, handler: Arc<H>) {
        loop {
            let response = match self.read_request().await {
                Ok(Some(request)) => handler.handle(request).await,
                Ok(None) => break,
                Err(IpcError::Json(e)) => {
                    tracing::debug!(error = %e, "Malformed IPC request");
                    IpcResponse::error(IpcErrorKind::Malformed, format!("malformed request: {}", e))
                }
                Err(e) => {
                    tracing::debug!(error = %e, "IPC connection error");
                    break;
                }
            };
            if let Err(e) = self.send_response(&response).await {
                tracing::debug!(error = %e, "Failed to send IPC response");
                break;
            }
        }
    }
}

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A JSON serialization/deserialization error occurred.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
