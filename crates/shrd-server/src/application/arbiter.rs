//! Exclusive-use arbitration for one shared device.
//!
//! The arbiter is a pure state machine: it decides who may use the device
//! and never blocks, sleeps, or does I/O.  Waiting, wakeups and logging are
//! the caller's job (see `infrastructure::registry::Device`).
//!
//! # States
//!
//! | state              | start (local)     | start (remote)          | end / suspend        |
//! |--------------------|-------------------|-------------------------|----------------------|
//! | `Idle`             | `LocalActive`     | `RemoteActive`          | NOTACTIVE            |
//! | `LocalActive`      | granted           | wait / busy             | `Idle` / `LocalSuspended` |
//! | `LocalSuspended`   | `LocalActive`     | `RemoteActive` unless reserved | local end: `Idle` |
//! | `RemoteActive`     | wait / busy       | owner: granted, others wait | `Idle`, or `LocalSuspended` if taken over |
//!
//! A remote user that takes over a locally suspended device gives it back
//! in the suspended state when it ends.  Ending always clears the
//! reservation.

use shrd_core::SessionId;
use thiserror::Error;

/// Who is asking for the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Requester {
    /// The server host's own execution path.
    Local,
    /// A connected remote session.
    Remote(SessionId),
}

/// Observable arbitration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterState {
    Idle,
    LocalActive,
    LocalSuspended,
    RemoteActive(SessionId),
}

/// Outcome of a START or RESUME attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDecision {
    /// The requester is now the active owner.
    Granted,
    /// Somebody else owns the device and the requester asked not to wait.
    Busy,
    /// Somebody else owns the device; retry after the next release.
    Wait,
}

/// Errors returned by ownership-checked operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterError {
    /// The requester is not the active owner.
    #[error("requester is not the active owner of the device")]
    NotActive,
    /// The device is owned by someone else and NOWAIT was requested.
    #[error("device is busy")]
    Busy,
}

/// Ownership state of one device.
#[derive(Debug, Default, Clone)]
pub struct Arbiter {
    owner: Option<Requester>,
    /// The local system suspended its use of the device and still holds it.
    suspended: bool,
    reserved: bool,
}

impl Arbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state, for status reports and tests.
    pub fn state(&self) -> ArbiterState {
        match (self.owner, self.suspended) {
            (Some(Requester::Remote(id)), _) => ArbiterState::RemoteActive(id),
            (Some(Requester::Local), _) => ArbiterState::LocalActive,
            (None, true) => ArbiterState::LocalSuspended,
            (None, false) => ArbiterState::Idle,
        }
    }

    pub fn owner(&self) -> Option<Requester> {
        self.owner
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved
    }

    pub fn is_owner(&self, who: Requester) -> bool {
        self.owner == Some(who)
    }

    /// Attempts to make `who` the active owner.
    pub fn start(&mut self, who: Requester, nowait: bool) -> StartDecision {
        if self.owner == Some(who) {
            return StartDecision::Granted;
        }
        let available = match (self.owner, who) {
            (Some(_), _) => false,
            (None, Requester::Local) => true,
            // A remote may borrow a locally suspended device unless it is reserved.
            (None, Requester::Remote(_)) => !(self.suspended && self.reserved),
        };
        if available {
            if who == Requester::Local {
                self.suspended = false;
            }
            self.owner = Some(who);
            StartDecision::Granted
        } else if nowait {
            StartDecision::Busy
        } else {
            StartDecision::Wait
        }
    }

    /// Ends `who`'s use of the device and clears any reservation.
    ///
    /// The local system may also end from the suspended state.
    pub fn end(&mut self, who: Requester) -> Result<(), ArbiterError> {
        if self.owner == Some(who) {
            self.owner = None;
            self.reserved = false;
            if who == Requester::Local {
                self.suspended = false;
            }
            return Ok(());
        }
        if who == Requester::Local && self.owner.is_none() && self.suspended {
            self.suspended = false;
            self.reserved = false;
            return Ok(());
        }
        Err(ArbiterError::NotActive)
    }

    /// Suspends `who`'s use of the device.
    ///
    /// The local system keeps the device (and its reservation) while
    /// suspended.  A remote suspend releases the device like an end, since
    /// the remote client parks its state on its own side.
    pub fn suspend(&mut self, who: Requester) -> Result<(), ArbiterError> {
        if self.owner != Some(who) {
            return Err(ArbiterError::NotActive);
        }
        match who {
            Requester::Local => {
                self.owner = None;
                self.suspended = true;
                Ok(())
            }
            Requester::Remote(_) => self.end(who),
        }
    }

    pub fn reserve(&mut self, who: Requester) -> Result<(), ArbiterError> {
        if self.owner != Some(who) {
            return Err(ArbiterError::NotActive);
        }
        self.reserved = true;
        Ok(())
    }

    pub fn release(&mut self, who: Requester) -> Result<(), ArbiterError> {
        if self.owner != Some(who) {
            return Err(ArbiterError::NotActive);
        }
        self.reserved = false;
        Ok(())
    }

    /// Forcibly removes a vanished remote session from ownership.
    ///
    /// Returns `true` when the session was the owner.
    pub fn extricate(&mut self, id: SessionId) -> bool {
        if self.owner != Some(Requester::Remote(id)) {
            return false;
        }
        self.owner = None;
        self.reserved = false;
        true
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
