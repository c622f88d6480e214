// Reassembly of fragmented messages
//
// Fragment sets are keyed by (source_id, sequence). Order of arrival does not
// matter; duplicates are ignored; a set that is still incomplete after the
// timeout is dropped whole and never delivered.

use super::header::Frame;
use super::types::{Message, MessageKey};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Buffered fragments of one in-flight message
#[derive(Debug)]
struct FragmentSet {
    /// First fragment seen, chunk already moved out
    first: Frame,
    total: u8,
    chunks: Vec<Option<Vec<u8>>>,
    received: usize,
    started_at: Instant,
}

impl FragmentSet {
    fn new(frame: Frame, now: Instant) -> Self {
        let total = frame.header.fragment_total;
        Self {
            chunks: vec![None; total as usize],
            total,
            received: 0,
            started_at: now,
            first: frame,
        }
    }

    fn insert(&mut self, index: u8, chunk: Vec<u8>) {
        let slot = &mut self.chunks[index as usize];
        if slot.is_none() {
            *slot = Some(chunk);
            self.received += 1;
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.total as usize
    }

    fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.started_at) >= timeout
    }

    fn into_message(self) -> Message {
        let header = self.first.header;
        let mut payload = Vec::new();
        for chunk in self.chunks.into_iter().flatten() {
            payload.extend_from_slice(&chunk);
        }
        Message {
            version: header.version,
            message_type: header.message_type,
            ttl: header.ttl,
            flags: header.flags,
            sequence: header.sequence,
            source_id: self.first.source_id,
            destination_id: self.first.destination_id,
            payload,
        }
    }
}

/// Collects fragments until a message is complete
#[derive(Debug)]
pub struct Reassembler {
    pending: HashMap<MessageKey, FragmentSet>,
    timeout: Duration,
    max_pending: usize,
}

impl Reassembler {
    pub fn new(timeout: Duration, max_pending: usize) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
            max_pending: max_pending.max(1),
        }
    }

    /// Feed one frame. Returns the message once every fragment is present.
    pub fn push(&mut self, mut frame: Frame, now: Instant) -> Option<Message> {
        let key = MessageKey {
            source_id: frame.source_id,
            sequence: frame.header.sequence,
        };
        let index = frame.header.fragment_index;
        let total = frame.header.fragment_total;

        // A stale set for the same key must not merge with new fragments
        let restart = match self.pending.get(&key) {
            Some(set) if set.is_expired(now, self.timeout) => {
                debug!("Reassembly of {} timed out, starting fresh", key);
                true
            }
            Some(set) if set.total != total => {
                debug!(
                    "Fragment total changed for {} ({} -> {}), starting fresh",
                    key, set.total, total
                );
                true
            }
            _ => false,
        };
        if restart {
            self.pending.remove(&key);
        }

        if !self.pending.contains_key(&key) && self.pending.len() >= self.max_pending {
            self.evict_oldest();
        }

        let chunk = std::mem::take(&mut frame.chunk);
        let set = self
            .pending
            .entry(key)
            .or_insert_with(|| FragmentSet::new(frame, now));
        set.insert(index, chunk);

        if set.is_complete() {
            self.pending.remove(&key).map(FragmentSet::into_message)
        } else {
            None
        }
    }

    /// Drop every set older than the timeout. Returns the reclaimed keys.
    pub fn expire(&mut self, now: Instant) -> Vec<MessageKey> {
        let timeout = self.timeout;
        let expired: Vec<MessageKey> = self
            .pending
            .iter()
            .filter(|(_, set)| set.is_expired(now, timeout))
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            self.pending.remove(key);
        }
        expired
    }

    /// Number of incomplete messages currently buffered
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .pending
            .iter()
            .min_by_key(|(_, set)| set.started_at)
            .map(|(key, _)| *key);
        if let Some(key) = oldest {
            debug!("Reassembly buffer full, evicting {}", key);
            self.pending.remove(&key);
        }
    }
}
