//! # shrd-core
//!
//! Shared library for the shared DASD server and client: the wire protocol
//! codec, payload compression, the device image cache, and device identity
//! types.
//!
//! # Architecture overview (for beginners)
//!
//! Several emulator instances can use the same virtual disk at the same time.
//! One of them owns the disk image (the *server*); the others reach it over
//! TCP (the *clients*).  Before touching the disk a user must become its
//! *active owner*, and whenever somebody writes a track or block, every other
//! user's cached copy of that unit must be thrown away.
//!
//! This crate is the part both sides agree on:
//!
//! - **`protocol`** – How bytes travel over the network.  Every message is a
//!   10-byte header followed by an optional, optionally compressed payload.
//!
//! - **`cache`** – A fixed-size, least-recently-used cache of track/block
//!   images with exclusive per-entry handles.  The server uses it to serve
//!   READs; the client uses it to avoid round trips and to defer writes.
//!
//! - **`domain`** – Plain types with no I/O: device numbers, session ids,
//!   device kinds (CKD or FBA) and `lcss:devnum` addresses.

pub mod cache;
pub mod domain;
pub mod protocol;

pub use cache::{Cache, CacheHandle, CacheKey, CacheStats, TryLookup};
pub use domain::device::{DevAddr, DevNum, DeviceKind, SessionId};
pub use protocol::codec::{decode_message, encode_message, CompressionSpec, ProtocolError};
pub use protocol::messages::{Command, ErrorStatus, Header, ResponseCode};
