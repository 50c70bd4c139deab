//! Bounded queue of rate-limited keys awaiting replay.

use std::collections::VecDeque;

use tracing::{info, warn};

use super::key::VendorKey;

/// A key waiting for a deferred replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEntry {
    /// Key to replay.
    pub key: VendorKey,
    /// Deferred replays already scheduled for this key.
    pub attempts: u32,
}

/// Bounded in-memory list of rate-limited keys awaiting a later replay.
/// When full the oldest entry is evicted.
#[derive(Debug, Clone)]
pub struct RetryQueue {
    capacity: usize,
    entries: VecDeque<RetryEntry>,
    insertions: u64,
}

impl RetryQueue {
    /// Capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
            insertions: 0,
        }
    }

    /// Queue `key` for replay, returning the entry evicted to make room.
    /// A key already queued is updated in place.
    pub fn push(&mut self, key: VendorKey, attempts: u32) -> Option<RetryEntry> {
        if let Some(existing) =
            self.entries.iter_mut().find(|entry| entry.key == key)
        {
            existing.attempts = existing.attempts.max(attempts);
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        if let Some(dropped) = &evicted {
            warn!(
                target: "macwatch::lookup",
                key = %dropped.key,
                "retry queue full, dropped oldest key"
            );
        }

        self.entries.push_back(RetryEntry { key, attempts });
        self.insertions += 1;
        if self.insertions % 10 == 0 {
            info!(
                target: "macwatch::lookup",
                pending = self.entries.len(),
                capacity = self.capacity,
                "retry queue size"
            );
        }
        evicted
    }

    /// Take every queued entry, oldest first.
    pub fn drain(&mut self) -> Vec<RetryEntry> {
        self.entries.drain(..).collect()
    }

    /// Queued entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
