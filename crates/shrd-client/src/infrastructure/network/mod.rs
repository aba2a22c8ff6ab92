//! Network infrastructure for the shared device client.
//!
//! # Sub-modules
//!
//! - **`engine`** – [`RequestEngine`]: the TCP connection to one device on
//!   one server, with the CONNECT/COMPRESS handshake and transparent
//!   reconnect-and-retry around every request.
//!
//! This module also defines the [`RemoteTransport`] seam the application
//! layer talks to, so [`RemoteDevice`](crate::application::remote_device::RemoteDevice)
//! can be tested without a server.

use async_trait::async_trait;
use shrd_core::protocol::{Command, ErrorStatus, FrameError, Header, ResponseCode};
use shrd_core::ProtocolError;
use thiserror::Error;

pub mod engine;

pub use engine::{ConnectionState, EngineConfig, RequestEngine};

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server could not be reached, even after retrying.
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),

    /// The server sent bytes that could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The server answered ERROR.
    #[error("request rejected: {status}")]
    Rejected { status: ErrorStatus },

    /// The device reported an I/O error; fetch the sense with SENSE.
    #[error("device I/O error (equipment check)")]
    DeviceError,

    /// START/RESUME with NOWAIT found the device in use.
    #[error("device busy")]
    Busy,

    /// No session exists.
    #[error("not connected")]
    NotConnected,
}

impl ClientError {
    /// Whether the failure is worth a reconnect-and-retry.
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }
}

impl From<FrameError> for ClientError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(io) => ClientError::Transport(io),
            FrameError::Protocol(p) => ClientError::Protocol(p),
        }
    }
}

/// A decoded reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Response {
    pub fn code(&self) -> Option<ResponseCode> {
        self.header.response_code()
    }

    /// Whether a START/RESUME reply carries an invalidation list.
    pub fn has_purge(&self) -> bool {
        self.code() == Some(ResponseCode::Ok) && self.header.has_purge()
    }

    /// Turns non-OK replies into the matching [`ClientError`].
    ///
    /// # Errors
    ///
    /// [`ClientError::Rejected`] for ERROR (unknown sub-statuses read as
    /// INVALID), [`ClientError::DeviceError`] for IOERR and
    /// [`ClientError::Busy`] for BUSY.
    pub fn into_ok(self) -> Result<Response, ClientError> {
        match self.code() {
            Some(ResponseCode::Ok) => Ok(self),
            Some(ResponseCode::IoError) => Err(ClientError::DeviceError),
            Some(ResponseCode::Busy) => Err(ClientError::Busy),
            Some(ResponseCode::Error) | None => Err(ClientError::Rejected {
                status: ErrorStatus::try_from(self.header.flags).unwrap_or(ErrorStatus::Invalid),
            }),
        }
    }
}

/// One request/response round trip to a remote device.
#[async_trait]
pub trait RemoteTransport: Send {
    /// Sends `command` and returns the server's reply, whatever its code.
    async fn request(
        &mut self,
        command: Command,
        flags: u8,
        payload: &[u8],
    ) -> Result<Response, ClientError>;

    /// Ends the session.  Best effort: transport failures are ignored.
    async fn disconnect(&mut self) -> Result<(), ClientError>;
}
