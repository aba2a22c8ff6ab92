//! The client request engine: one TCP session with one remote device.
//!
//! # Connection states (for beginners)
//!
//! ```text
//!  Disconnected ──connect()──▶ Connecting ──handshake ok──▶ Ready
//!        ▲                         │                          │
//!        └──── handshake failed ───┘◀──── transport error ────┘
//! ```
//!
//! [`RequestEngine::request`] connects on demand.  When the socket fails it
//! drops back to `Disconnected`, waits `retry_delay`, reconnects (presenting
//! the session id the server assigned the first time, so the server re-binds
//! the same session) and sends the request again, up to `max_retries` times.
//! Rejections and decode errors are never retried.

use std::time::Duration;

use async_trait::async_trait;
use shrd_core::protocol::{
    compress_flags, read_frame, split_compress_flags, write_frame, Command, CompressionSpec,
    Header, PROTOCOL_RELEASE, PROTOCOL_VERSION, SUPPORTED_ALGORITHMS,
};
use shrd_core::{DevNum, SessionId};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::{ClientError, RemoteTransport, Response};

/// Uncompressed prefix of a WRITE payload: `[block:4][offset:4]`.
const WRITE_PREFIX: usize = 8;

/// Connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// `host:port` of the server.
    pub addr: String,
    pub devnum: DevNum,
    /// Reconnect attempts per request before giving up.
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// zlib level to ask for, or `None` to send and receive uncompressed.
    pub compression_level: Option<u8>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            addr: format!("127.0.0.1:{}", shrd_core::protocol::DEFAULT_PORT),
            devnum: 0,
            max_retries: 10,
            retry_delay: Duration::from_millis(100),
            compression_level: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
}

/// Reconnecting request/response client for one remote device.
#[derive(Debug)]
pub struct RequestEngine {
    config: EngineConfig,
    state: ConnectionState,
    stream: Option<TcpStream>,
    /// Assigned by the server on first CONNECT; kept across reconnects.
    id: SessionId,
    compression: Option<CompressionSpec>,
    server_version: Option<(u8, u8)>,
}

impl RequestEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            stream: None,
            id: 0,
            compression: None,
            server_version: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Session id, or 0 before the first successful CONNECT.
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn devnum(&self) -> DevNum {
        self.config.devnum
    }

    /// Negotiated compression, if any.
    pub fn compression(&self) -> Option<CompressionSpec> {
        self.compression
    }

    /// `(version, release)` reported by the server.
    pub fn server_version(&self) -> Option<(u8, u8)> {
        self.server_version
    }

    /// Establishes the session if it is not already up.
    ///
    /// Calling it again after a failure simply redoes the handshake; the
    /// session id, once assigned, is kept.
    ///
    /// # Errors
    ///
    /// [`ClientError::Transport`] if the server is unreachable,
    /// [`ClientError::Rejected`] if it refuses the CONNECT.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if self.state == ConnectionState::Ready {
            return Ok(());
        }
        self.state = ConnectionState::Connecting;
        match self.handshake().await {
            Ok(()) => {
                self.state = ConnectionState::Ready;
                Ok(())
            }
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    async fn handshake(&mut self) -> Result<(), ClientError> {
        let mut stream = TcpStream::connect(&self.config.addr)
            .await
            .map_err(ClientError::Transport)?;
        let _ = stream.set_nodelay(true);

        let connect = Header::request(Command::Connect, 0, self.config.devnum, self.id);
        write_frame(&mut stream, &connect, &[PROTOCOL_VERSION, PROTOCOL_RELEASE], None).await?;
        let (header, payload) = read_frame(&mut stream).await?;
        let reply = Response { header, payload }.into_ok()?;

        if self.id != 0 && reply.header.id != self.id {
            warn!("server assigned session {} instead of {}", reply.header.id, self.id);
        }
        self.id = reply.header.id;
        self.server_version = match reply.payload.as_slice() {
            [version, release, ..] => Some((*version, *release)),
            _ => None,
        };

        self.compression = None;
        if let Some(level) = self.config.compression_level {
            let flags = compress_flags(SUPPORTED_ALGORITHMS, level);
            let req = Header::request(Command::Compress, flags, self.config.devnum, self.id);
            write_frame(&mut stream, &req, &[], None).await?;
            let (header, payload) = read_frame(&mut stream).await?;
            let reply = Response { header, payload }.into_ok()?;
            let (mask, level) = split_compress_flags(reply.header.flags);
            if mask & SUPPORTED_ALGORITHMS != 0 {
                self.compression = Some(CompressionSpec::zlib(level));
            }
        }

        info!(
            "connected to {} device {:04X} as session {} (compression {:?})",
            self.config.addr, self.config.devnum, self.id, self.compression
        );
        self.stream = Some(stream);
        Ok(())
    }

    fn reset(&mut self) {
        self.stream = None;
        self.state = ConnectionState::Disconnected;
    }

    async fn round_trip(&mut self, command: Command, flags: u8, payload: &[u8]) -> Result<Response, ClientError> {
        let header = Header::request(command, flags, self.config.devnum, self.id);
        let prefix = if command == Command::Write { WRITE_PREFIX } else { 0 };
        let compression = self.compression.map(|c| c.with_offset(prefix));
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        write_frame(stream, &header, payload, compression.as_ref()).await?;
        let (header, payload) = read_frame(stream).await?;
        Ok(Response { header, payload })
    }

    /// Sends one request and returns the reply, whatever its code.
    ///
    /// # Errors
    ///
    /// [`ClientError::Transport`] once `max_retries` reconnects have failed;
    /// any handshake rejection or decode error immediately.
    pub async fn request(&mut self, command: Command, flags: u8, payload: &[u8]) -> Result<Response, ClientError> {
        let mut attempt = 0;
        loop {
            let result = match self.connect().await {
                Ok(()) => self.round_trip(command, flags, payload).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transport() => {
                    self.reset();
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        warn!("{} failed after {} retries: {e}", command.name(), self.config.max_retries);
                        return Err(e);
                    }
                    debug!("{} failed ({e}); retry {attempt}/{}", command.name(), self.config.max_retries);
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => {
                    if matches!(e, ClientError::Protocol(_)) {
                        self.reset();
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Sends DISCONNECT and closes the socket.  Transport errors are ignored.
    ///
    /// # Errors
    ///
    /// Never fails today; the `Result` mirrors [`RemoteTransport::disconnect`].
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        if self.state == ConnectionState::Ready {
            match self.round_trip(Command::Disconnect, 0, &[]).await {
                Ok(_) => debug!("session {} disconnected", self.id),
                Err(e) => debug!("ignoring error on DISCONNECT: {e}"),
            }
        }
        self.reset();
        self.id = 0;
        self.compression = None;
        Ok(())
    }
}

#[async_trait]
impl RemoteTransport for RequestEngine {
    async fn request(&mut self, command: Command, flags: u8, payload: &[u8]) -> Result<Response, ClientError> {
        RequestEngine::request(self, command, flags, payload).await
    }

    async fn disconnect(&mut self) -> Result<(), ClientError> {
        RequestEngine::disconnect(self).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
