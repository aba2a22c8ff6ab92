//! Per-session list of blocks the remote must drop from its cache.
//!
//! Blocks are queued when somebody else updates them and delivered on the
//! session's next START/RESUME reply.  The list is bounded: once it would
//! overflow it collapses into a single "purge everything" marker, which is
//! always a safe answer.

use std::collections::VecDeque;

/// What a START/RESUME reply must tell the remote to invalidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeNotice {
    /// Drop these blocks.
    Blocks(Vec<u32>),
    /// Drop every cached block of the device.
    All,
}

/// Bounded, deduplicated FIFO of pending invalidations.
#[derive(Debug, Clone)]
pub struct PurgeList {
    blocks: VecDeque<u32>,
    capacity: usize,
    overflowed: bool,
}

impl PurgeList {
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: VecDeque::with_capacity(capacity),
            capacity,
            overflowed: false,
        }
    }

    /// Queues `block` unless it is already queued.
    pub fn push(&mut self, block: u32) {
        if self.overflowed || self.blocks.contains(&block) {
            return;
        }
        if self.blocks.len() >= self.capacity {
            self.purge_all();
            return;
        }
        self.blocks.push_back(block);
    }

    /// Replaces the list with the "purge everything" marker.
    pub fn purge_all(&mut self) {
        self.blocks.clear();
        self.overflowed = true;
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && !self.overflowed
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Removes and returns the pending notice, if any.
    pub fn take(&mut self) -> Option<PurgeNotice> {
        if self.overflowed {
            self.overflowed = false;
            self.blocks.clear();
            return Some(PurgeNotice::All);
        }
        if self.blocks.is_empty() {
            return None;
        }
        Some(PurgeNotice::Blocks(self.blocks.drain(..).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_are_delivered_once() {
        let mut list = PurgeList::new(16);
        list.push(5);
        list.push(9);
        list.push(5);
        assert_eq!(list.take(), Some(PurgeNotice::Blocks(vec![5, 9])));
    }

    #[test]
    fn test_take_clears_the_list() {
        let mut list = PurgeList::new(16);
        list.push(1);
        list.take();
        assert!(list.is_empty());
        assert_eq!(list.take(), None);
    }

    #[test]
    fn test_overflow_collapses_to_purge_all() {
        // Arrange
        let mut list = PurgeList::new(2);

        // Act
        list.push(1);
        list.push(2);
        list.push(3);
        list.push(4);

        // Assert
        assert_eq!(list.take(), Some(PurgeNotice::All));
        assert_eq!(list.take(), None);
    }
}
