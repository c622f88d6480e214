// Local transport: an in-memory radio medium
//
// A `LocalMedium` is the shared air; every `LocalTransport` is one node's
// radio on it. Links are explicit and symmetric. Used by integration tests
// and the CLI simulator.

use super::abstraction::{
    DiscoveryEvent, DiscoveryStream, FrameStream, InboundFrame, LinkTarget, MeshTransport,
    TransportCapabilities, TransportError, TransportType,
};
use super::stream::broadcast_stream;
use crate::identity::PeerId;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 1024;

/// Signal strength reported for links created without one
pub const DEFAULT_LOCAL_SIGNAL: i32 = -50;

#[derive(Debug, Clone, Copy)]
struct LinkState {
    signal_strength: i32,
    queue_depth: u32,
}

#[derive(Debug)]
struct Endpoint {
    frames: broadcast::Sender<InboundFrame>,
    discovery: broadcast::Sender<DiscoveryEvent>,
    available: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct MediumState {
    endpoints: HashMap<PeerId, Endpoint>,
    /// Directed view of each symmetric link: (from, to) -> what `from` sees
    links: HashMap<(PeerId, PeerId), LinkState>,
}

/// Shared in-memory medium
#[derive(Debug, Clone, Default)]
pub struct LocalMedium {
    state: Arc<RwLock<MediumState>>,
}

impl LocalMedium {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a radio for `peer_id` on this medium
    pub fn transport(&self, peer_id: PeerId) -> LocalTransport {
        LocalTransport::new(self.clone(), peer_id)
    }

    /// Connect two nodes with the default signal
    pub fn link(&self, a: PeerId, b: PeerId) {
        self.link_with_signal(a, b, DEFAULT_LOCAL_SIGNAL);
    }

    /// Connect two nodes; both sides get a `Sighted` event
    pub fn link_with_signal(&self, a: PeerId, b: PeerId, signal_strength: i32) {
        let mut state = self.state.write();
        let link = LinkState {
            signal_strength,
            queue_depth: 0,
        };
        state.links.insert((a, b), link);
        state.links.insert((b, a), link);

        for (me, other) in [(a, b), (b, a)] {
            if let Some(endpoint) = state.endpoints.get(&me) {
                let _ = endpoint.discovery.send(DiscoveryEvent::Sighted {
                    peer_id: other,
                    link_address: local_address(&other),
                    signal_strength,
                });
            }
        }
        debug!("Linked {} <-> {}", a, b);
    }

    /// Break a link; both sides get a `Lost` event
    pub fn unlink(&self, a: PeerId, b: PeerId) {
        let mut state = self.state.write();
        state.links.remove(&(a, b));
        state.links.remove(&(b, a));
        for (me, other) in [(a, b), (b, a)] {
            if let Some(endpoint) = state.endpoints.get(&me) {
                let _ = endpoint.discovery.send(DiscoveryEvent::Lost { peer_id: other });
            }
        }
        debug!("Unlinked {} <-> {}", a, b);
    }

    /// Report new metrics for the link as seen from `observer`
    pub fn set_link_quality(&self, observer: PeerId, peer: PeerId, signal_strength: i32, queue_depth: u32) {
        let mut state = self.state.write();
        let Some(link) = state.links.get_mut(&(observer, peer)) else {
            return;
        };
        link.signal_strength = signal_strength;
        link.queue_depth = queue_depth;
        if let Some(endpoint) = state.endpoints.get(&observer) {
            let _ = endpoint.discovery.send(DiscoveryEvent::LinkQuality {
                peer_id: peer,
                signal_strength,
                queue_depth,
            });
        }
    }

    /// Neighbours of `peer_id`, ordered by id
    pub fn neighbours(&self, peer_id: &PeerId) -> Vec<PeerId> {
        let mut out: Vec<PeerId> = self
            .state
            .read()
            .links
            .keys()
            .filter(|(from, _)| from == peer_id)
            .map(|(_, to)| *to)
            .collect();
        out.sort();
        out
    }

    fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.state.read().links.contains_key(&(*a, *b))
    }

    fn register(&self, peer_id: PeerId, available: Arc<AtomicBool>) -> (broadcast::Sender<InboundFrame>, broadcast::Sender<DiscoveryEvent>) {
        let (frames, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (discovery, _) = broadcast::channel(CHANNEL_CAPACITY);
        self.state.write().endpoints.insert(
            peer_id,
            Endpoint {
                frames: frames.clone(),
                discovery: discovery.clone(),
                available,
            },
        );
        (frames, discovery)
    }

    /// Hand a frame to `to`. False if the receiving radio is off or absent.
    fn deliver(&self, from: PeerId, to: PeerId, data: &[u8]) -> bool {
        let state = self.state.read();
        match state.endpoints.get(&to) {
            Some(endpoint) if endpoint.available.load(Ordering::SeqCst) => {
                let _ = endpoint.frames.send(InboundFrame {
                    from,
                    data: data.to_vec(),
                });
                true
            }
            _ => false,
        }
    }

    /// Current sightings for `peer_id`, used to prime new discovery streams
    fn sightings(&self, peer_id: &PeerId) -> Vec<DiscoveryEvent> {
        let state = self.state.read();
        let mut events: Vec<(PeerId, LinkState)> = state
            .links
            .iter()
            .filter(|((from, _), _)| from == peer_id)
            .map(|((_, to), link)| (*to, *link))
            .collect();
        events.sort_by_key(|(id, _)| *id);
        events
            .into_iter()
            .flat_map(|(other, link)| {
                [
                    DiscoveryEvent::Sighted {
                        peer_id: other,
                        link_address: local_address(&other),
                        signal_strength: link.signal_strength,
                    },
                    DiscoveryEvent::LinkQuality {
                        peer_id: other,
                        signal_strength: link.signal_strength,
                        queue_depth: link.queue_depth,
                    },
                ]
            })
            .collect()
    }
}

fn local_address(peer_id: &PeerId) -> String {
    format!("local:{}", peer_id)
}

/// One node's radio on a [`LocalMedium`]
#[derive(Debug)]
pub struct LocalTransport {
    medium: LocalMedium,
    local_id: PeerId,
    capabilities: TransportCapabilities,
    available: Arc<AtomicBool>,
    /// Sends to fail before the radio works again
    injected_failures: AtomicU32,
    frames: broadcast::Sender<InboundFrame>,
    discovery: broadcast::Sender<DiscoveryEvent>,
}

impl LocalTransport {
    pub fn new(medium: LocalMedium, local_id: PeerId) -> Self {
        let available = Arc::new(AtomicBool::new(true));
        let (frames, discovery) = medium.register(local_id, available.clone());
        Self {
            medium,
            local_id,
            capabilities: TransportCapabilities::for_transport(TransportType::Local),
            available,
            injected_failures: AtomicU32::new(0),
            frames,
            discovery,
        }
    }

    /// Override the link MTU
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.capabilities.mtu = mtu;
        self
    }

    /// Power the radio on or off
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `count` sends fail with `SendFailed`
    pub fn fail_next_sends(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    fn take_injected_failure(&self) -> bool {
        self.injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.medium.state.write().endpoints.remove(&self.local_id);
    }
}

#[async_trait]
impl MeshTransport for LocalTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Local
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn can_reach(&self, peer: &PeerId) -> bool {
        self.available.load(Ordering::SeqCst) && self.medium.is_linked(&self.local_id, peer)
    }

    fn mtu(&self) -> usize {
        self.capabilities.mtu
    }

    fn estimated_bandwidth(&self) -> u64 {
        self.capabilities.estimated_bandwidth_bps
    }

    fn estimated_latency(&self) -> Duration {
        self.capabilities.latency()
    }

    async fn send(&self, target: LinkTarget, frame: &[u8]) -> Result<(), TransportError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable(TransportType::Local));
        }
        if frame.len() > self.capabilities.mtu {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                mtu: self.capabilities.mtu,
            });
        }
        if self.take_injected_failure() {
            return Err(TransportError::SendFailed("injected failure".to_string()));
        }

        match target {
            LinkTarget::Peer(peer) => {
                if !self.medium.is_linked(&self.local_id, &peer)
                    || !self.medium.deliver(self.local_id, peer, frame)
                {
                    return Err(TransportError::Unreachable(peer));
                }
            }
            LinkTarget::Broadcast => {
                for peer in self.medium.neighbours(&self.local_id) {
                    self.medium.deliver(self.local_id, peer, frame);
                }
            }
        }
        Ok(())
    }

    fn receive(&self) -> FrameStream {
        broadcast_stream(self.frames.subscribe())
    }

    fn discover(&self) -> DiscoveryStream {
        // Subscribe before snapshotting so no sighting falls in between
        let live = broadcast_stream(self.discovery.subscribe());
        let primed = self.medium.sightings(&self.local_id);
        stream::iter(primed).chain(live).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> PeerId {
        PeerId::from_bytes([b; 8])
    }

    #[tokio::test]
    async fn test_linked_peers_exchange_frames() {
        let medium = LocalMedium::new();
        let a = medium.transport(id(1));
        let b = medium.transport(id(2));
        medium.link(id(1), id(2));

        let mut inbox = b.receive();
        assert!(a.can_reach(&id(2)));
        a.send(LinkTarget::Peer(id(2)), b"frame").await.unwrap();

        let got = inbox.next().await.unwrap();
        assert_eq!(got.from, id(1));
        assert_eq!(got.data, b"frame");
    }

    #[tokio::test]
    async fn test_unlinked_peer_unreachable() {
        let medium = LocalMedium::new();
        let a = medium.transport(id(1));
        let _b = medium.transport(id(2));
        assert!(!a.can_reach(&id(2)));
        assert_eq!(
            a.send(LinkTarget::Peer(id(2)), b"x").await,
            Err(TransportError::Unreachable(id(2)))
        );
    }

    #[tokio::test]
    async fn test_broadcast_reaches_neighbours_only() {
        let medium = LocalMedium::new();
        let a = medium.transport(id(1));
        let b = medium.transport(id(2));
        let c = medium.transport(id(3));
        medium.link(id(1), id(2));

        let mut inbox_b = b.receive();
        let mut inbox_c = c.receive();
        a.send(LinkTarget::Broadcast, b"hello").await.unwrap();

        assert_eq!(inbox_b.next().await.unwrap().data, b"hello");
        assert!(
            tokio::time::timeout(Duration::from_millis(20), inbox_c.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_unavailable_radio() {
        let medium = LocalMedium::new();
        let a = medium.transport(id(1));
        let _b = medium.transport(id(2));
        medium.link(id(1), id(2));

        a.set_available(false);
        assert!(!a.is_available().await);
        assert!(!a.can_reach(&id(2)));
        assert_eq!(
            a.send(LinkTarget::Peer(id(2)), b"x").await,
            Err(TransportError::Unavailable(TransportType::Local))
        );
    }

    #[tokio::test]
    async fn test_injected_failures_then_recovery() {
        let medium = LocalMedium::new();
        let a = medium.transport(id(1));
        let _b = medium.transport(id(2));
        medium.link(id(1), id(2));

        a.fail_next_sends(2);
        assert!(a.send(LinkTarget::Peer(id(2)), b"1").await.is_err());
        assert!(a.send(LinkTarget::Peer(id(2)), b"2").await.is_err());
        assert!(a.send(LinkTarget::Peer(id(2)), b"3").await.is_ok());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let medium = LocalMedium::new();
        let a = medium.transport(id(1)).with_mtu(32);
        let _b = medium.transport(id(2));
        medium.link(id(1), id(2));
        assert!(matches!(
            a.send(LinkTarget::Peer(id(2)), &[0u8; 33]).await,
            Err(TransportError::FrameTooLarge { len: 33, mtu: 32 })
        ));
    }

    #[tokio::test]
    async fn test_discovery_primed_with_existing_links() {
        let medium = LocalMedium::new();
        let a = medium.transport(id(1));
        let _b = medium.transport(id(2));
        medium.link_with_signal(id(1), id(2), -42);

        let mut events = a.discover();
        assert_eq!(
            events.next().await.unwrap(),
            DiscoveryEvent::Sighted {
                peer_id: id(2),
                link_address: "local:0202020202020202".into(),
                signal_strength: -42,
            }
        );
        assert!(matches!(
            events.next().await.unwrap(),
            DiscoveryEvent::LinkQuality { queue_depth: 0, .. }
        ));

        medium.set_link_quality(id(1), id(2), -60, 4);
        assert_eq!(
            events.next().await.unwrap(),
            DiscoveryEvent::LinkQuality {
                peer_id: id(2),
                signal_strength: -60,
                queue_depth: 4,
            }
        );

        medium.unlink(id(1), id(2));
        assert_eq!(events.next().await.unwrap(), DiscoveryEvent::Lost { peer_id: id(2) });
    }
}
