//! Network infrastructure for the shared device server.
//!
//! # Sub-modules
//!
//! - **`listener`** – Accepts TCP connections, runs the CONNECT handshake,
//!   and hands each new session to its device's dispatch loop.
//!
//! - **`dispatch_loop`** – One task per device with sessions.  Reaps dead
//!   sessions, schedules requests fairly, and sends replies.
//!
//! - **`session`** – Server-side session records and the socket reader task.

pub mod dispatch_loop;
pub mod listener;
pub mod session;
