//! Infrastructure layer for the shared device client.
//!
//! Contains the network adapter (the reconnecting request engine) and the
//! TOML configuration storage.
//!
//! **Dependency rule**: this layer may depend on `shrd_core`; the
//! `application` layer reaches it only through the
//! [`network::RemoteTransport`] trait and the error types.

pub mod network;
pub mod storage;
