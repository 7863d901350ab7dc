// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::migrate::MigrateStateError;

use thiserror::Error;

/// The minimum configurable depth of any of the message rings.
pub const MIN_QUEUE_DEPTH: u32 = 1;

/// The maximum configurable depth of any of the message rings.
pub const MAX_QUEUE_DEPTH: u32 = 1024;

/// Errors that may be encountered while adding to a ring.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueUpdateError {
    #[error("ring is full")]
    Full,
}

/// One of the three message rings shared between host and IOC: request,
/// reply free and reply post.
///
/// The ring holds `depth + 1` slots so that a full ring can be told apart
/// from an empty one.  One slot is therefore always unused.
#[derive(Debug)]
pub struct RingQueue {
    /// Slot storage, `depth + 1` entries long.
    entries: Vec<u32>,

    /// Index of the next entry to be consumed.
    read: u32,

    /// Index of the next free slot.
    write: u32,
}

impl RingQueue {
    pub fn new(depth: u32) -> Self {
        assert!((MIN_QUEUE_DEPTH..=MAX_QUEUE_DEPTH).contains(&depth));
        Self { entries: vec![0; depth as usize + 1], read: 0, write: 0 }
    }

    /// Number of slots in the ring, including the one always left unused.
    pub fn capacity(&self) -> u32 {
        self.entries.len() as u32
    }
    /// Number of entries which may be held at once.
    pub fn depth(&self) -> u32 {
        self.capacity() - 1
    }

    fn wrap_add(&self, idx: u32, off: u32) -> u32 {
        debug_assert!(idx < self.capacity());
        debug_assert!(off < self.capacity());

        (idx + off) % self.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }
    pub fn is_full(&self) -> bool {
        self.wrap_add(self.write, 1) == self.read
    }
    /// Number of entries currently queued.
    pub fn len(&self) -> u32 {
        (self.write + self.capacity() - self.read) % self.capacity()
    }

    pub fn write_idx(&self) -> u32 {
        self.write
    }

    /// Add `val` at the write cursor.  A full ring is left untouched.
    pub fn push(&mut self, val: u32) -> Result<(), QueueUpdateError> {
        if self.is_full() {
            return Err(QueueUpdateError::Full);
        }
        self.entries[self.write as usize] = val;
        self.write = self.wrap_add(self.write, 1);
        Ok(())
    }

    /// Take the entry at the read cursor, if any.
    pub fn pop(&mut self) -> Option<u32> {
        self.pop_until(self.write)
    }

    /// Take the entry at the read cursor, unless the cursor has reached
    /// `stop`, an earlier snapshot of [RingQueue::write_idx].
    pub fn pop_until(&mut self, stop: u32) -> Option<u32> {
        if self.read == stop || self.is_empty() {
            return None;
        }
        let val = self.entries[self.read as usize];
        self.read = self.wrap_add(self.read, 1);
        Some(val)
    }

    /// Return both cursors to the start of the ring.
    pub fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    pub(super) fn export(&self) -> migrate::RingQueueV1 {
        migrate::RingQueueV1 {
            entries: self.entries.clone(),
            read: self.read,
            write: self.write,
        }
    }

    pub(super) fn import(
        &mut self,
        state: migrate::RingQueueV1,
    ) -> Result<(), MigrateStateError> {
        if state.entries.len() != self.entries.len() {
            return Err(MigrateStateError::ImportFailed(format!(
                "ring size mismatch: {} vs {}",
                state.entries.len(),
                self.entries.len()
            )));
        }
        if state.read >= self.capacity() || state.write >= self.capacity() {
            return Err(MigrateStateError::ImportFailed(format!(
                "ring cursors out of range: read {} write {}",
                state.read, state.write
            )));
        }
        self.entries = state.entries;
        self.read = state.read;
        self.write = state.write;
        Ok(())
    }
}

pub mod migrate {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Deserialize, Serialize)]
    pub struct RingQueueV1 {
        pub entries: Vec<u32>,
        pub read: u32,
        pub write: u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::VecDeque;

    #[test]
    fn one_slot_reserved() {
        let mut ring = RingQueue::new(4);
        assert_eq!(ring.capacity(), 5);
        assert!(ring.is_empty());

        for i in 0..4 {
            assert_eq!(ring.push(i), Ok(()));
        }
        assert!(ring.is_full());
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.push(0xff), Err(QueueUpdateError::Full));

        // The failed push must not have overwritten anything
        for i in 0..4 {
            assert_eq!(ring.pop(), Some(i));
        }
        assert_eq!(ring.pop(), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn pop_stops_at_snapshot() {
        let mut ring = RingQueue::new(8);
        ring.push(1).unwrap();
        ring.push(2).unwrap();
        let snap = ring.write_idx();
        ring.push(3).unwrap();

        assert_eq!(ring.pop_until(snap), Some(1));
        assert_eq!(ring.pop_until(snap), Some(2));
        assert_eq!(ring.pop_until(snap), None);
        assert_eq!(ring.pop(), Some(3));
    }

    #[test]
    fn push_pop_random() {
        let mut rng = StdRng::seed_from_u64(0x15_1030);
        let mut ring = RingQueue::new(7);
        let mut model = VecDeque::new();

        for _ in 0..10_000 {
            if rng.gen_bool(0.55) {
                let val: u32 = rng.gen();
                let res = ring.push(val);
                if model.len() == 7 {
                    assert_eq!(res, Err(QueueUpdateError::Full));
                } else {
                    assert_eq!(res, Ok(()));
                    model.push_back(val);
                }
            } else {
                assert_eq!(ring.pop(), model.pop_front());
            }
            assert_eq!(ring.len() as usize, model.len());
            assert_eq!(ring.is_empty(), model.is_empty());
            assert_eq!(ring.is_full(), model.len() == 7);
        }
    }

    #[test]
    fn import_validation() {
        let mut ring = RingQueue::new(4);
        ring.push(0x1234).unwrap();
        let state = ring.export();

        let mut other = RingQueue::new(4);
        other.import(state.clone()).unwrap();
        assert_eq!(other.pop(), Some(0x1234));

        let mut small = RingQueue::new(2);
        assert!(small.import(state.clone()).is_err());

        let mut bad = state;
        bad.read = 5;
        assert!(other.import(bad).is_err());
    }
}
