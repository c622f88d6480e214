// BLE mesh transport
//
// Advertises `len | service id | peer id`, scans for the same, connects on
// demand and writes one frame per characteristic write. Outstanding writes
// per link are bounded and reported as queue depth. A link is dropped on
// disconnect, or when an unconnected neighbour stops advertising.

use super::bridge::BlePlatformBridge;
use crate::identity::PeerId;
use crate::transport::abstraction::{
    DiscoveryEvent, DiscoveryStream, FrameStream, InboundFrame, LinkTarget, MeshTransport,
    TransportCapabilities, TransportError, TransportType,
};
use crate::transport::advertisement::Advertisement;
use crate::transport::stream::broadcast_stream;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Default maximum writes in flight per link
pub const DEFAULT_MAX_OUTSTANDING_WRITES: u32 = 10;

/// Default time an unconnected neighbour stays reachable after its last advertisement
pub const DEFAULT_SIGHTING_TIMEOUT: Duration = Duration::from_secs(30);

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct BleConfig {
    pub max_outstanding_writes: u32,
    pub sighting_timeout: Duration,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            max_outstanding_writes: DEFAULT_MAX_OUTSTANDING_WRITES,
            sighting_timeout: DEFAULT_SIGHTING_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
struct BleLink {
    address: String,
    rssi: i32,
    connected: bool,
    outstanding: u32,
    last_seen: Instant,
}

impl BleLink {
    fn is_live(&self, now: Instant, timeout: Duration) -> bool {
        self.connected
            || self.outstanding > 0
            || now.saturating_duration_since(self.last_seen) < timeout
    }
}

#[derive(Debug, Default)]
struct BleState {
    links: HashMap<PeerId, BleLink>,
    by_address: HashMap<String, PeerId>,
}

impl BleState {
    fn remove(&mut self, peer: &PeerId) -> bool {
        match self.links.remove(peer) {
            Some(link) => {
                self.by_address.remove(&link.address);
                true
            }
            None => false,
        }
    }

    fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<PeerId> {
        let stale: Vec<PeerId> = self
            .links
            .iter()
            .filter(|(_, link)| !link.is_live(now, timeout))
            .map(|(peer, _)| *peer)
            .collect();
        for peer in &stale {
            self.remove(peer);
        }
        stale
    }
}

fn expire_links(
    state: &RwLock<BleState>,
    discovery: &broadcast::Sender<DiscoveryEvent>,
    timeout: Duration,
) {
    let stale = state.write().expire(Instant::now(), timeout);
    for peer_id in stale {
        debug!("BLE neighbour {} stopped advertising, dropping", peer_id);
        let _ = discovery.send(DiscoveryEvent::Lost { peer_id });
    }
}

/// BLE transport over a platform bridge
pub struct BleTransport {
    local_id: PeerId,
    config: BleConfig,
    capabilities: TransportCapabilities,
    bridge: Arc<dyn BlePlatformBridge>,
    state: Arc<RwLock<BleState>>,
    frames: broadcast::Sender<InboundFrame>,
    discovery: broadcast::Sender<DiscoveryEvent>,
}

impl BleTransport {
    /// Create the transport and register the bridge callbacks
    pub fn new(local_id: PeerId, config: BleConfig, bridge: Arc<dyn BlePlatformBridge>) -> Self {
        let (frames, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (discovery, _) = broadcast::channel(CHANNEL_CAPACITY);
        let state = Arc::new(RwLock::new(BleState::default()));

        {
            let state = state.clone();
            let discovery = discovery.clone();
            let timeout = config.sighting_timeout;
            bridge.set_on_advertisement(Box::new(move |address, data, rssi| {
                expire_links(&state, &discovery, timeout);
                handle_advertisement(&state, &discovery, local_id, address, &data, rssi);
            }));
        }
        {
            let state = state.clone();
            let frames = frames.clone();
            bridge.set_on_data_received(Box::new(move |address, mut buffer, valid_len| {
                let Some(from) = state.read().by_address.get(&address).copied() else {
                    debug!("BLE data from unknown device {}, dropping", address);
                    return;
                };
                buffer.truncate(valid_len);
                let _ = frames.send(InboundFrame { from, data: buffer });
            }));
        }
        {
            let state = state.clone();
            let discovery = discovery.clone();
            bridge.set_on_disconnected(Box::new(move |address| {
                let lost = {
                    let mut state = state.write();
                    let peer = state.by_address.get(&address).copied();
                    peer.filter(|peer| state.remove(peer))
                };
                if let Some(peer_id) = lost {
                    info!("BLE link to {} disconnected", peer_id);
                    let _ = discovery.send(DiscoveryEvent::Lost { peer_id });
                }
            }));
        }

        let mut capabilities = TransportCapabilities::for_transport(TransportType::BLE);
        capabilities.mtu = bridge.mtu();

        Self {
            local_id,
            config,
            capabilities,
            bridge,
            state,
            frames,
            discovery,
        }
    }

    /// Number of known BLE neighbours
    pub fn link_count(&self) -> usize {
        self.state.read().links.len()
    }

    async fn send_to(&self, peer: PeerId, frame: &[u8]) -> Result<(), TransportError> {
        expire_links(&self.state, &self.discovery, self.config.sighting_timeout);
        let (address, connected) = {
            let mut state = self.state.write();
            let link = state
                .links
                .get_mut(&peer)
                .ok_or(TransportError::Unreachable(peer))?;
            if link.outstanding >= self.config.max_outstanding_writes {
                return Err(TransportError::SendFailed(format!(
                    "write queue to {} full",
                    peer
                )));
            }
            link.outstanding += 1;
            self.report_queue(peer, link);
            (link.address.clone(), link.connected)
        };

        let result = self.connect_and_write(peer, &address, connected, frame).await;

        let mut state = self.state.write();
        if let Some(link) = state.links.get_mut(&peer) {
            link.outstanding = link.outstanding.saturating_sub(1);
            if result.is_ok() {
                link.connected = true;
            }
            self.report_queue(peer, link);
        }
        result
    }

    async fn connect_and_write(
        &self,
        peer: PeerId,
        address: &str,
        connected: bool,
        frame: &[u8],
    ) -> Result<(), TransportError> {
        if !connected {
            self.bridge.connect(address).await.map_err(|e| {
                warn!("BLE connect to {} failed: {}", peer, e);
                TransportError::ConnectionFailed(e.to_string())
            })?;
            info!("BLE connected to {} ({})", peer, address);
        }
        self.bridge.write(address, frame).await
    }

    fn report_queue(&self, peer: PeerId, link: &BleLink) {
        let _ = self.discovery.send(DiscoveryEvent::LinkQuality {
            peer_id: peer,
            signal_strength: link.rssi,
            queue_depth: link.outstanding,
        });
    }
}

fn handle_advertisement(
    state: &RwLock<BleState>,
    discovery: &broadcast::Sender<DiscoveryEvent>,
    local_id: PeerId,
    address: String,
    data: &[u8],
    rssi: i32,
) {
    let Some(peer_id) = Advertisement::decode_mesh(data) else {
        return;
    };
    if peer_id == local_id {
        return;
    }

    let now = Instant::now();
    let mut state = state.write();
    let previous = state.links.get(&peer_id).map(|l| l.address.clone());
    if previous.is_some_and(|old| old != address) {
        // Address rotated: the old connection is useless
        state.remove(&peer_id);
    }
    let link = state.links.entry(peer_id).or_insert_with(|| BleLink {
        address: address.clone(),
        rssi,
        connected: false,
        outstanding: 0,
        last_seen: now,
    });
    link.rssi = rssi;
    link.last_seen = now;
    state.by_address.insert(address.clone(), peer_id);

    let _ = discovery.send(DiscoveryEvent::Sighted {
        peer_id,
        link_address: address,
        signal_strength: rssi,
    });
}

#[async_trait]
impl MeshTransport for BleTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::BLE
    }

    async fn is_available(&self) -> bool {
        self.bridge.is_powered_on().await.unwrap_or(false)
    }

    fn can_reach(&self, peer: &PeerId) -> bool {
        self.state
            .read()
            .links
            .get(peer)
            .is_some_and(|link| link.is_live(Instant::now(), self.config.sighting_timeout))
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
        if frame.len() > self.capabilities.mtu {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                mtu: self.capabilities.mtu,
            });
        }

        match target {
            LinkTarget::Peer(peer) => self.send_to(peer, frame).await,
            LinkTarget::Broadcast => {
                expire_links(&self.state, &self.discovery, self.config.sighting_timeout);
                let peers: Vec<PeerId> = self.state.read().links.keys().copied().collect();
                if peers.is_empty() {
                    return Err(TransportError::SendFailed("no BLE neighbours".to_string()));
                }
                let mut last_err = None;
                let mut delivered = 0;
                for peer in &peers {
                    match self.send_to(*peer, frame).await {
                        Ok(()) => delivered += 1,
                        Err(e) => {
                            warn!("BLE broadcast to {} failed: {}", peer, e);
                            last_err = Some(e);
                        }
                    }
                }
                match last_err {
                    Some(e) if delivered == 0 => Err(e),
                    _ => Ok(()),
                }
            }
        }
    }

    fn receive(&self) -> FrameStream {
        broadcast_stream(self.frames.subscribe())
    }

    fn discover(&self) -> DiscoveryStream {
        broadcast_stream(self.discovery.subscribe())
    }

    async fn start(&self) -> Result<(), TransportError> {
        if !self.bridge.is_powered_on().await? {
            return Err(TransportError::Unavailable(TransportType::BLE));
        }
        let advertisement = Advertisement::new(self.local_id).encode();
        self.bridge.start_advertising(&advertisement).await?;
        self.bridge.start_scanning().await?;
        info!("BLE advertising and scanning as {}", self.local_id);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let _ = self.bridge.stop_scanning().await;
        let _ = self.bridge.stop_advertising().await;
        info!("BLE transport stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::bridge::mock::MockBleBridge;
    use super::*;
    use crate::transport::advertisement::SERVICE_ID;
    use futures::StreamExt;

    fn id(b: u8) -> PeerId {
        PeerId::from_bytes([b; 8])
    }

    fn setup() -> (Arc<MockBleBridge>, BleTransport) {
        setup_with(BleConfig::default())
    }

    fn setup_with(config: BleConfig) -> (Arc<MockBleBridge>, BleTransport) {
        let bridge = Arc::new(MockBleBridge::new(true, 182));
        let transport = BleTransport::new(id(1), config, bridge.clone());
        (bridge, transport)
    }

    #[tokio::test]
    async fn test_start_advertises_service_and_peer() {
        let (bridge, transport) = setup();
        transport.start().await.unwrap();

        let advertised = bridge.advertised.lock().clone().unwrap();
        assert_eq!(Advertisement::decode_mesh(&advertised), Some(id(1)));
        assert!(*bridge.scanning.read());
        assert_eq!(transport.mtu(), 182);
    }

    #[tokio::test]
    async fn test_start_fails_when_powered_off() {
        let bridge = Arc::new(MockBleBridge::new(false, 182));
        let transport = BleTransport::new(id(1), BleConfig::default(), bridge);
        assert_eq!(
            transport.start().await,
            Err(TransportError::Unavailable(TransportType::BLE))
        );
        assert!(!transport.is_available().await);
    }

    #[tokio::test]
    async fn test_mesh_advertisement_sighted() {
        let (bridge, transport) = setup();
        let mut events = transport.discover();

        bridge.simulate_advertisement("11:22", Advertisement::new(id(2)).encode(), -55);
        assert_eq!(
            events.next().await.unwrap(),
            DiscoveryEvent::Sighted {
                peer_id: id(2),
                link_address: "11:22".into(),
                signal_strength: -55,
            }
        );
        assert!(transport.can_reach(&id(2)));
    }

    #[tokio::test]
    async fn test_foreign_and_own_advertisements_ignored() {
        let (bridge, transport) = setup();
        let foreign = Advertisement {
            service_id: "fitness.band".into(),
            peer_id: id(3),
        };
        bridge.simulate_advertisement("aa", foreign.encode(), -40);
        bridge.simulate_advertisement("bb", Advertisement::new(id(1)).encode(), -40);
        assert_eq!(transport.link_count(), 0);
        assert_ne!(foreign.service_id, SERVICE_ID);
    }

    #[tokio::test]
    async fn test_padding_stripped_from_received_buffer() {
        let (bridge, transport) = setup();
        bridge.simulate_advertisement("11:22", Advertisement::new(id(2)).encode(), -55);
        let mut inbox = transport.receive();

        let mut buffer = b"frame-bytes".to_vec();
        buffer.extend_from_slice(&[0u8; 9]);
        bridge.simulate_data("11:22", buffer, 11);

        let frame = inbox.next().await.unwrap();
        assert_eq!(frame.from, id(2));
        assert_eq!(frame.data, b"frame-bytes");
    }

    #[tokio::test]
    async fn test_send_connects_on_demand() {
        let (bridge, transport) = setup();
        bridge.simulate_advertisement("11:22", Advertisement::new(id(2)).encode(), -55);

        transport.send(LinkTarget::Peer(id(2)), b"one").await.unwrap();
        transport.send(LinkTarget::Peer(id(2)), b"two").await.unwrap();
        assert_eq!(bridge.connects.lock().len(), 1);
        assert_eq!(bridge.writes.lock().len(), 2);

        bridge.simulate_disconnect("11:22");
        bridge.simulate_advertisement("11:22", Advertisement::new(id(2)).encode(), -58);
        transport.send(LinkTarget::Peer(id(2)), b"three").await.unwrap();
        assert_eq!(bridge.connects.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_drops_link() {
        let (bridge, transport) = setup();
        bridge.simulate_advertisement("11:22", Advertisement::new(id(2)).encode(), -55);
        transport.send(LinkTarget::Peer(id(2)), b"one").await.unwrap();
        let mut events = transport.discover();

        bridge.simulate_disconnect("11:22");
        assert_eq!(
            events.next().await.unwrap(),
            DiscoveryEvent::Lost { peer_id: id(2) }
        );
        assert!(!transport.can_reach(&id(2)));
        assert_eq!(transport.link_count(), 0);
        assert_eq!(
            transport.send(LinkTarget::Peer(id(2)), b"two").await,
            Err(TransportError::Unreachable(id(2)))
        );

        // Data on the stale address is no longer attributed
        let mut inbox = transport.receive();
        bridge.simulate_data("11:22", b"late".to_vec(), 4);
        assert!(
            tokio::time::timeout(Duration::from_millis(20), inbox.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_silent_neighbour_expires() {
        let (bridge, transport) = setup_with(BleConfig {
            sighting_timeout: Duration::from_millis(30),
            ..Default::default()
        });
        bridge.simulate_advertisement("a", Advertisement::new(id(2)).encode(), -55);
        bridge.simulate_advertisement("b", Advertisement::new(id(3)).encode(), -60);
        // A connected link outlives its advertisements
        transport.send(LinkTarget::Peer(id(3)), b"x").await.unwrap();
        let mut events = transport.discover();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!transport.can_reach(&id(2)));
        assert!(transport.can_reach(&id(3)));

        transport.send(LinkTarget::Broadcast, b"y").await.unwrap();
        assert_eq!(
            events.next().await.unwrap(),
            DiscoveryEvent::Lost { peer_id: id(2) }
        );
        assert_eq!(transport.link_count(), 1);
        assert_eq!(bridge.writes.lock().len(), 2);

        // A fresh advertisement brings it back
        bridge.simulate_advertisement("a", Advertisement::new(id(2)).encode(), -50);
        assert!(transport.can_reach(&id(2)));
    }

    #[tokio::test]
    async fn test_broadcast_without_neighbours_fails() {
        let (_, transport) = setup();
        assert!(matches!(
            transport.send(LinkTarget::Broadcast, b"x").await,
            Err(TransportError::SendFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_send_errors() {
        let (bridge, transport) = setup();
        assert_eq!(
            transport.send(LinkTarget::Peer(id(9)), b"x").await,
            Err(TransportError::Unreachable(id(9)))
        );

        bridge.simulate_advertisement("11:22", Advertisement::new(id(2)).encode(), -55);
        assert!(matches!(
            transport.send(LinkTarget::Peer(id(2)), &[0u8; 183]).await,
            Err(TransportError::FrameTooLarge { .. })
        ));

        bridge.set_fail_writes(true);
        assert!(transport.send(LinkTarget::Peer(id(2)), b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_queue_depth_reported() {
        let (bridge, transport) = setup();
        bridge.simulate_advertisement("11:22", Advertisement::new(id(2)).encode(), -55);
        let mut events = transport.discover();

        transport.send(LinkTarget::Peer(id(2)), b"x").await.unwrap();
        assert_eq!(
            events.next().await.unwrap(),
            DiscoveryEvent::LinkQuality {
                peer_id: id(2),
                signal_strength: -55,
                queue_depth: 1,
            }
        );
        assert!(matches!(
            events.next().await.unwrap(),
            DiscoveryEvent::LinkQuality { queue_depth: 0, .. }
        ));
    }

    #[tokio::test]
    async fn test_broadcast_writes_every_link() {
        let (bridge, transport) = setup();
        bridge.simulate_advertisement("a", Advertisement::new(id(2)).encode(), -55);
        bridge.simulate_advertisement("b", Advertisement::new(id(3)).encode(), -60);
        transport.send(LinkTarget::Broadcast, b"hello").await.unwrap();
        assert_eq!(bridge.writes.lock().len(), 2);
    }
}
