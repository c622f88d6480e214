// Pending acknowledgment waits for reliable sends
//
// One entry per outstanding reliable message, keyed by the sequence number
// this node stamped on it. An ack only resolves the wait if it comes from
// the peer the message was addressed to.

use crate::identity::PeerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug)]
struct PendingAck {
    destination: PeerId,
    resolve: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
pub struct AckTracker {
    pending: Mutex<HashMap<u16, PendingAck>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for an ack of `sequence` from `destination`.
    ///
    /// A second registration for the same sequence replaces the first; the
    /// earlier waiter sees its channel closed.
    pub fn register(&self, sequence: u16, destination: PeerId) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            sequence,
            PendingAck {
                destination,
                resolve: tx,
            },
        );
        rx
    }

    /// Resolve the wait for `sequence` if `from` is the addressed peer
    pub fn resolve(&self, from: PeerId, sequence: u16) -> bool {
        let mut pending = self.pending.lock();
        match pending.get(&sequence) {
            Some(entry) if entry.destination == from => {}
            Some(_) => {
                debug!("Ack for #{} from unexpected peer {}", sequence, from);
                return false;
            }
            None => {
                debug!("Ack for #{} with no pending wait", sequence);
                return false;
            }
        }
        match pending.remove(&sequence) {
            Some(entry) => entry.resolve.send(()).is_ok(),
            None => false,
        }
    }

    /// Release a wait that timed out or whose send failed
    pub fn cancel(&self, sequence: u16) {
        self.pending.lock().remove(&sequence);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Payload of a data-ack: the acknowledged sequence, big-endian
pub fn encode_ack(sequence: u16) -> Vec<u8> {
    sequence.to_be_bytes().to_vec()
}

pub fn decode_ack(payload: &[u8]) -> Option<u16> {
    let bytes: [u8; 2] = payload.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> PeerId {
        PeerId::from_bytes([b; 8])
    }

    #[tokio::test]
    async fn test_resolve_wakes_waiter() {
        let tracker = AckTracker::new();
        let rx = tracker.register(42, id(2));

        assert!(tracker.resolve(id(2), 42));
        assert!(rx.await.is_ok());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_ack_from_wrong_peer_is_ignored() {
        let tracker = AckTracker::new();
        let _rx = tracker.register(42, id(2));

        assert!(!tracker.resolve(id(3), 42));
        assert!(!tracker.resolve(id(2), 43));
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_releases_wait() {
        let tracker = AckTracker::new();
        let rx = tracker.register(1, id(2));
        tracker.cancel(1);

        assert!(tracker.is_empty());
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_ack_payload() {
        assert_eq!(encode_ack(0x1234), vec![0x12, 0x34]);
        assert_eq!(decode_ack(&[0x12, 0x34]), Some(0x1234));
        assert_eq!(decode_ack(&[0x12]), None);
        assert_eq!(decode_ack(&[1, 2, 3]), None);
    }
}
