//! Routing decision engine
//!
//! For every received message:
//! 1. Already in the dedup cache -> `Duplicate`, nothing else happens
//! 2. Record it in the dedup cache
//! 3. `ttl == 0` -> `Expired`
//! 4. Broadcast or addressed to us -> deliver locally
//! 5. Broadcast or addressed elsewhere -> forward with `ttl - 1` to the
//!    selected set, unless the decremented ttl would be zero
//!
//! The engine only decides. Sending happens outside its lock.

use super::dedup::DedupCache;
use super::forwarding::{select_forwarding_set, ForwardingStrategy};
use crate::config::RoutingConfig;
use crate::identity::PeerId;
use crate::message::{Message, MessageKey};
use crate::peers::Peer;
use std::time::Instant;
use tracing::debug;

/// A forwarding pass: the re-stamped message and where it goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub message: Message,
    pub targets: Vec<PeerId>,
    pub strategy: ForwardingStrategy,
}

/// Outcome of routing one received message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Seen before within the retention window
    Duplicate,
    /// Arrived with no hops left
    Expired,
    Handle {
        /// Hand the payload to the local application
        deliver: bool,
        forward: Option<Forward>,
    },
}

impl RoutingDecision {
    pub fn delivers(&self) -> bool {
        matches!(self, RoutingDecision::Handle { deliver: true, .. })
    }

    pub fn forward(&self) -> Option<&Forward> {
        match self {
            RoutingDecision::Handle { forward, .. } => forward.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct RoutingEngine {
    local_id: PeerId,
    config: RoutingConfig,
    dedup: DedupCache,
    next_sequence: u16,
}

impl RoutingEngine {
    pub fn new(local_id: PeerId, config: RoutingConfig) -> Self {
        let dedup = DedupCache::new(config.dedup_capacity, config.dedup_retention());
        Self {
            local_id,
            config,
            dedup,
            next_sequence: rand::random(),
        }
    }

    /// Route a received message.
    ///
    /// `from` is the neighbour that handed us the message, if known;
    /// `neighbours` is the live peer snapshot from the registry.
    pub fn route(
        &mut self,
        message: &Message,
        from: Option<PeerId>,
        neighbours: &[Peer],
        now: Instant,
    ) -> RoutingDecision {
        let key = message.key();

        if !self.dedup.insert(key, now) {
            debug!("Dropping duplicate {}", key);
            return RoutingDecision::Duplicate;
        }

        if message.ttl == 0 {
            debug!("Dropping expired {}", key);
            return RoutingDecision::Expired;
        }

        let for_us = message.destination_id == Some(self.local_id);
        let deliver = message.is_broadcast() || for_us;

        let forward = if for_us {
            None
        } else if message.ttl <= 1 {
            debug!("{} has no hops left, not forwarding", key);
            None
        } else {
            let mut exclude = vec![message.source_id, self.local_id];
            exclude.extend(from);

            let (strategy, targets) = select_forwarding_set(neighbours, &exclude, &self.config);
            if targets.is_empty() {
                None
            } else {
                let mut relayed = message.clone();
                relayed.ttl -= 1;
                Some(Forward {
                    message: relayed,
                    targets,
                    strategy,
                })
            }
        };

        RoutingDecision::Handle { deliver, forward }
    }

    /// Targets for a message this node originates.
    ///
    /// The message is recorded in the dedup cache so echoes are dropped.
    /// A unicast to a live neighbour goes straight to it; everything else
    /// goes to every live neighbour.
    pub fn originate(&mut self, message: &Message, neighbours: &[Peer], now: Instant) -> Vec<PeerId> {
        self.dedup.insert(message.key(), now);

        if let Some(dest) = message.destination_id {
            if neighbours.iter().any(|p| p.peer_id == dest) {
                return vec![dest];
            }
        }

        neighbours
            .iter()
            .map(|p| p.peer_id)
            .filter(|id| *id != self.local_id)
            .collect()
    }

    /// Read-only check used by replay screening
    pub fn has_seen(&self, key: &MessageKey, now: Instant) -> bool {
        self.dedup.contains(key, now)
    }

    /// Allocate the next sequence number for a locally originated message
    pub fn next_sequence(&mut self) -> u16 {
        let seq = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        seq
    }

    /// Drop dedup entries past the retention window
    pub fn prune(&mut self, now: Instant) -> usize {
        self.dedup.prune(now)
    }

    pub fn dedup_len(&self) -> usize {
        self.dedup.len()
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }
}
