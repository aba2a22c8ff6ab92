//! shrd-server library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! A minimal embedding registers devices and starts the listener:
//!
//! ```no_run
//! use std::sync::Arc;
//! use shrd_core::DeviceKind;
//! use shrd_server::infrastructure::device::memory::MemoryDevice;
//! use shrd_server::{start, DeviceRegistry, SharingSettings};
//!
//! # async fn run() -> Result<(), shrd_server::ServerError> {
//! let registry = Arc::new(DeviceRegistry::new(SharingSettings::default()));
//! registry.register(0x0190, Box::new(MemoryDevice::new(DeviceKind::Ckd, 0x0190, 150, 56832)))?;
//! let server = start("0.0.0.0:3990".parse().unwrap(), registry).await?;
//! // ...
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod application;
pub mod infrastructure;

pub use infrastructure::network::listener::{start, ServerHandle};
pub use infrastructure::registry::{Device, DeviceRegistry, SharingSettings};
pub use infrastructure::ServerError;
