// Dedup cache: (source_id, sequence) -> first_seen
//
// Bounded on two axes: `capacity` entries at most (oldest evicted first) and
// `retention` age (older entries no longer count as seen).

use crate::message::MessageKey;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct DedupCache {
    first_seen: HashMap<MessageKey, Instant>,
    /// Insertion order; may hold superseded entries whose time no longer
    /// matches `first_seen`
    order: VecDeque<(MessageKey, Instant)>,
    capacity: usize,
    retention: Duration,
}

impl DedupCache {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            first_seen: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
            retention,
        }
    }

    /// True if `key` was recorded within the retention window
    pub fn contains(&self, key: &MessageKey, now: Instant) -> bool {
        self.first_seen
            .get(key)
            .is_some_and(|seen| now.saturating_duration_since(*seen) < self.retention)
    }

    /// Record `key`. Returns false if it was already present (a duplicate).
    pub fn insert(&mut self, key: MessageKey, now: Instant) -> bool {
        if self.contains(&key, now) {
            return false;
        }

        self.first_seen.insert(key, now);
        self.order.push_back((key, now));
        while self.order.len() > self.capacity {
            self.pop_oldest();
        }
        true
    }

    /// Drop entries older than the retention window
    pub fn prune(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some((_, seen)) = self.order.front() {
            if now.saturating_duration_since(*seen) < self.retention {
                break;
            }
            if self.pop_oldest() {
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.first_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_seen.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pop the front of the order queue; true if it removed a live entry
    fn pop_oldest(&mut self) -> bool {
        match self.order.pop_front() {
            Some((key, seen)) if self.first_seen.get(&key) == Some(&seen) => {
                self.first_seen.remove(&key);
                true
            }
            _ => false,
        }
    }
}
