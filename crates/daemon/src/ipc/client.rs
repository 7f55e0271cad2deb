//! IPC Client for communicating with the daemon via Unix Domain Sockets.
//!
//! The client connects to the daemon's Unix socket and sends commands,
//! receiving responses in a request-response pattern.

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::messages::{IpcRequest, IpcResponse};
use super::server::IpcError;

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 10;

fn timed_out(what: &str) -> IpcError {
    IpcError::Io(io::Error::new(io::ErrorKind::TimedOut, what.to_string()))
}

/// A client for communicating with the daemon via IPC.
pub struct IpcClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    timeout: Duration,
}

impl IpcClient {
    /// Connect to the daemon at the specified socket path.
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the Unix socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    /// This typically indicates that the daemon is not running.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        let stream = UnixStream::connect(path).await.map_err(IpcError::Io)?;
        Ok(Self::from_stream(
            stream,
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        ))
    }

    /// Connect to the daemon with a custom timeout applied to the connect
    /// and to every request.
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the Unix socket.
    /// * `timeout` - The timeout for connecting and for each request.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established in time.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| timed_out("connection timed out"))?
            .map_err(IpcError::Io)?;
        Ok(Self::from_stream(stream, timeout))
    }

    fn from_stream(stream: UnixStream, timeout: Duration) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        }
    }

    /// Set the timeout for operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a request to the daemon and wait for a response.
    ///
    /// # Arguments
    ///
    /// * `request` - The request to send.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The request cannot be serialized or sent
    /// - The daemon closes the connection before answering
    /// - The response cannot be parsed
    /// - The operation times out
    ///
    /// Daemon-side failures arrive as [`IpcResponse::Error`], not as `Err`.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        tokio::time::timeout(self.timeout, self.send_internal(request))
            .await
            .map_err(|_| timed_out("operation timed out"))?
    }

    async fn send_internal(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        let mut json = serde_json::to_string(&request).map_err(IpcError::Json)?;
        json.push('\n');

        self.writer
            .write_all(json.as_bytes())
            .await
            .map_err(IpcError::Io)?;
        self.writer.flush().await.map_err(IpcError::Io)?;

        let mut line = String::new();
        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(IpcError::Io)?;

        if bytes_read == 0 {
            return Err(IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "daemon closed connection",
            )));
        }

        let response = serde_json::from_str(line.trim()).map_err(IpcError::Json)?;
        Ok(response)
    }

    /// Returns `true` if the daemon answers a ping.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(IpcRequest::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }

    pub async fn status(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Status).await
    }

    pub async fn stop(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Stop).await
    }

    /// Start a session for a build, or reconnect to its open session.
    ///
    /// # Arguments
    ///
    /// * `build_number` - A build registered in the archive's catalog.
    /// * `operator` - Free-text operator name, recorded on creation only.
    pub async fn start_session(
        &mut self,
        build_number: impl Into<String>,
        operator: impl Into<String>,
    ) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::StartSession {
            build_number: build_number.into(),
            operator: operator.into(),
        })
        .await
    }

    pub async fn pause_session(&mut self, session_id: impl Into<String>) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::PauseSession {
            session_id: session_id.into(),
        })
        .await
    }

    pub async fn resume_session(&mut self, session_id: impl Into<String>) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::ResumeSession {
            session_id: session_id.into(),
        })
        .await
    }

    pub async fn finish_session(&mut self, session_id: impl Into<String>) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::FinishSession {
            session_id: session_id.into(),
        })
        .await
    }

    pub async fn get_session(&mut self, session_id: impl Into<String>) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::GetSession {
            session_id: session_id.into(),
        })
        .await
    }

    pub async fn list_sessions(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::ListSessions).await
    }

    /// Injects a message into the result feed.
    ///
    /// # Arguments
    ///
    /// * `topic` - A result topic of the form `tests/{session_id}/result`.
    /// * `payload` - The raw JSON test event.
    pub async fn publish(
        &mut self,
        topic: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Publish {
            topic: topic.into(),
            payload: payload.into(),
        })
        .await
    }

    pub async fn register_build(&mut self, build_number: impl Into<String>) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::RegisterBuild {
            build_number: build_number.into(),
        })
        .await
    }
}
