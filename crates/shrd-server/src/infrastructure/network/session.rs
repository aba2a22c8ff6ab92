//! Server-side state of one remote session and its socket reader task.
//!
//! A session is created by a successful CONNECT and lives in its device's
//! session table until it disconnects, its socket fails, or it is reaped.
//! The socket is split: a reader task decodes frames and forwards them to
//! the device's dispatch loop, which owns the write half and sends replies.

use std::collections::VecDeque;
use std::time::Instant;

use shrd_core::protocol::{read_frame, Command};
use shrd_core::{CompressionSpec, Header, SessionId};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::application::purge_list::PurgeList;

/// A decoded request waiting to be executed.
#[derive(Debug, Clone)]
pub struct Request {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// Messages delivered to a device's dispatch loop.
#[derive(Debug)]
pub enum Inbound {
    /// A session's socket is ready; the loop takes ownership of both halves.
    Attach {
        id: SessionId,
        generation: u64,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
    },
    /// A request arrived on a session's socket.
    Frame {
        id: SessionId,
        generation: u64,
        request: Request,
    },
    /// A session's socket failed or was closed by the peer.
    Closed {
        id: SessionId,
        generation: u64,
        reason: String,
    },
}

/// Server-side record of one remote session.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    /// Peer address, for logs and status reports.
    pub addr: String,
    /// Bumped on every reconnect so frames from a stale socket are ignored.
    pub generation: u64,
    pub last_activity: Instant,
    /// Requests received but not yet executed.  The front one is pending.
    pub queue: VecDeque<Request>,
    /// Set while the front request is a START/RESUME waiting for the device.
    pub ticket: Option<u64>,
    /// The remote sent DISCONNECT.
    pub disconnect: bool,
    /// The socket failed or the server is shutting the session down.
    pub dropped: bool,
    pub compression: Option<CompressionSpec>,
    pub purge: PurgeList,
}

impl Session {
    pub fn new(id: SessionId, addr: String, generation: u64, purge_capacity: usize) -> Self {
        Self {
            id,
            addr,
            generation,
            last_activity: Instant::now(),
            queue: VecDeque::new(),
            ticket: None,
            disconnect: false,
            dropped: false,
            compression: None,
            purge: PurgeList::new(purge_capacity),
        }
    }

    /// Whether the session has a request to run.
    pub fn is_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn is_waiting(&self) -> bool {
        self.ticket.is_some()
    }

    /// Re-binds the session to a new socket after a reconnect.
    ///
    /// Ownership and the purge list survive; in-flight requests do not,
    /// since the client resends them on the new connection.
    pub fn reattach(&mut self, addr: String, generation: u64) {
        self.addr = addr;
        self.generation = generation;
        self.last_activity = Instant::now();
        self.queue.clear();
        self.ticket = None;
        self.disconnect = false;
        self.dropped = false;
    }
}

/// Point-in-time view of a session, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub id: SessionId,
    pub addr: String,
    pub pending: usize,
    pub waiting: bool,
    pub purge_pending: usize,
}

impl From<&Session> for SessionStatus {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id,
            addr: s.addr.clone(),
            pending: s.queue.len(),
            waiting: s.is_waiting(),
            purge_pending: s.purge.len(),
        }
    }
}

/// Spawns the task that reads frames from a session socket.
///
/// The task stops after forwarding a DISCONNECT, or after reporting a
/// transport or decode failure as [`Inbound::Closed`].
pub fn spawn_reader(
    tx: mpsc::UnboundedSender<Inbound>,
    id: SessionId,
    generation: u64,
    mut reader: OwnedReadHalf,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok((header, payload)) => {
                    let disconnect = header.command() == Some(Command::Disconnect);
                    let request = Request { header, payload };
                    if tx.send(Inbound::Frame { id, generation, request }).is_err() || disconnect {
                        break;
                    }
                }
                Err(e) => {
                    let reason = if e.is_eof() {
                        "connection closed by peer".to_string()
                    } else {
                        e.to_string()
                    };
                    debug!("session {id} reader stopping: {reason}");
                    let _ = tx.send(Inbound::Closed {
                        id,
                        generation,
                        reason,
                    });
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shrd_core::protocol::{Command, Header};

    #[test]
    fn test_reattach_keeps_purge_list_and_drops_queue() {
        // Arrange
        let mut s = Session::new(3, "10.0.0.1:5000".into(), 1, 16);
        s.purge.push(7);
        s.queue.push_back(Request {
            header: Header::request(Command::Start, 0, 0x0190, 3),
            payload: Vec::new(),
        });
        s.ticket = Some(4);
        s.dropped = true;

        // Act
        s.reattach("10.0.0.1:5001".into(), 2);

        // Assert
        assert_eq!(s.generation, 2);
        assert!(!s.is_pending());
        assert!(!s.is_waiting());
        assert!(!s.dropped);
        assert_eq!(s.purge.len(), 1);
    }

    #[test]
    fn test_status_reflects_session_state() {
        let mut s = Session::new(9, "peer".into(), 1, 16);
        s.purge.push(1);
        s.purge.push(2);
        let status = SessionStatus::from(&s);
        assert_eq!(status.id, 9);
        assert_eq!(status.purge_pending, 2);
        assert!(!status.waiting);
    }
}
