//! Infrastructure layer for the shared device server.
//!
//! Contains the adapters around the application logic: device handlers
//! backed by memory or image files, the device registry, the TCP listener
//! and per-device dispatch loops, the request trace, and TOML storage.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `shrd_core`, but MUST NOT be imported by the `application` layer except
//! through the [`registry`] types the use cases operate on.

use std::net::SocketAddr;

use shrd_core::DevNum;
use thiserror::Error;

use crate::application::handler::HandlerError;

pub mod device;
pub mod network;
pub mod registry;
pub mod storage;
pub mod trace;

/// Errors raised while setting up or operating the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The TCP listener could not be bound.
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// No device is registered under this number.
    #[error("device {0:04X} is not shared")]
    UnknownDevice(DevNum),

    /// A device is already registered under this number.
    #[error("device {0:04X} is already shared")]
    DuplicateDevice(DevNum),

    /// The device has no free session slot.
    #[error("device {0:04X} has no free session slot")]
    SessionTableFull(DevNum),

    /// The device handler failed.
    #[error("device handler error: {0}")]
    Handler(#[from] HandlerError),
}
