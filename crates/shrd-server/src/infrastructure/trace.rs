//! In-memory ring of recently processed requests, for diagnostics.
//!
//! The ring has a configurable size; zero disables recording.  Operators
//! can resize it, clear it, or take a snapshot at any time.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use shrd_core::protocol::Command;
use shrd_core::{DevNum, SessionId};

/// One processed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub at: SystemTime,
    pub devnum: DevNum,
    pub id: SessionId,
    /// Raw request command byte.
    pub cmd: u8,
    pub flags: u8,
    pub length: u32,
    /// Raw reply command byte.
    pub response: u8,
}

impl TraceEntry {
    /// Human-readable request name, or `?` for an unknown opcode.
    pub fn command_name(&self) -> &'static str {
        Command::try_from(self.cmd).map(Command::name).unwrap_or("?")
    }
}

impl std::fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04X} id={} {} flags={:02X} len={} -> {:02X}",
            self.devnum,
            self.id,
            self.command_name(),
            self.flags,
            self.length,
            self.response
        )
    }
}

#[derive(Debug)]
struct Ring {
    entries: VecDeque<TraceEntry>,
    capacity: usize,
}

/// Bounded trace of processed requests shared by all dispatch loops.
#[derive(Debug)]
pub struct TraceRing {
    inner: Mutex<Ring>,
}

impl TraceRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Ring {
                entries: VecDeque::with_capacity(capacity),
                capacity,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current capacity.
    pub fn size(&self) -> usize {
        self.lock().capacity
    }

    /// Changes the capacity, dropping the oldest entries if it shrinks.
    pub fn resize(&self, capacity: usize) {
        let mut ring = self.lock();
        ring.capacity = capacity;
        while ring.entries.len() > capacity {
            ring.entries.pop_front();
        }
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Copies the entries out, oldest first.
    pub fn snapshot(&self) -> Vec<TraceEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    pub fn record(&self, entry: TraceEntry) {
        let mut ring = self.lock();
        if ring.capacity == 0 {
            return;
        }
        if ring.entries.len() == ring.capacity {
            ring.entries.pop_front();
        }
        ring.entries.push_back(entry);
    }
}

impl Default for TraceRing {
    fn default() -> Self {
        Self::new(0)
    }
}
