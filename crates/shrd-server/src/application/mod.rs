//! Application layer of the shared device server.
//!
//! # Sub-modules
//!
//! - **`arbiter`** – The ownership state machine of one device: who is the
//!   active user, whether the local system has suspended or reserved it.
//!   Pure logic, no locking or I/O.
//!
//! - **`handler`** – The [`handler::DeviceHandler`] trait through which the
//!   server reaches the real device, plus its error type.
//!
//! - **`purge_list`** – Per-session list of blocks another user changed,
//!   delivered on the next START/RESUME.
//!
//! - **`dispatch`** – Executes one remote request against a device and
//!   builds the reply.

pub mod arbiter;
pub mod dispatch;
pub mod handler;
pub mod purge_list;
