//! Application layer of the shared device client.
//!
//! - **`remote_device`** – [`remote_device::RemoteDevice`]: device operations
//!   on top of a transport, with a local image cache and deferred writes.

pub mod remote_device;
