// Peer registry: live neighbours, their link quality and capabilities
//
// All mutation goes through one write lock, so discovery consumers and the
// routing engine never observe a half-updated peer. Every method takes `now`
// explicitly; the caller owns the clock.

use crate::config::RegistryConfig;
use crate::identity::PeerId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Instant;
use tracing::info;

/// Link details reported by a discovery event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// Radio-specific address (MAC, data-path handle, ...)
    pub link_address: String,
    /// Received signal strength (dBm, higher is better)
    pub signal_strength: i32,
}

impl LinkInfo {
    pub fn new(link_address: impl Into<String>, signal_strength: i32) -> Self {
        Self {
            link_address: link_address.into(),
            signal_strength,
        }
    }
}

/// A directly reachable neighbour
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub peer_id: PeerId,
    pub link_address: String,
    pub signal_strength: i32,
    pub last_seen: Instant,
    /// Frames queued towards this peer on its link
    pub queue_depth: u32,
    /// Capabilities from the peer's last capability advertisement
    pub capabilities: Vec<String>,
}

impl Peer {
    /// Forwarding score: `signal_strength - penalty * queue_depth`
    pub fn score(&self, queue_depth_penalty: i64) -> i64 {
        self.signal_strength as i64 - queue_depth_penalty * self.queue_depth as i64
    }

    fn is_live(&self, now: Instant, config: &RegistryConfig) -> bool {
        now.saturating_duration_since(self.last_seen) < config.liveness_timeout()
    }
}

/// Peer lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Discovered(Peer),
    Lost(PeerId),
}

/// Thread-safe table of neighbours
#[derive(Debug)]
pub struct PeerRegistry {
    local_id: PeerId,
    config: RegistryConfig,
    peers: RwLock<HashMap<PeerId, Peer>>,
}

impl PeerRegistry {
    pub fn new(local_id: PeerId, config: RegistryConfig) -> Self {
        Self {
            local_id,
            config,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Record a sighting.
    ///
    /// Returns `Discovered` the first time a peer is seen, preceded by `Lost`
    /// for the least recently seen peer when the table was full.
    pub fn on_discovered(&self, peer_id: PeerId, link: LinkInfo, now: Instant) -> Vec<PeerEvent> {
        if peer_id == self.local_id {
            return Vec::new();
        }

        let mut peers = self.peers.write();
        if let Some(peer) = peers.get_mut(&peer_id) {
            peer.link_address = link.link_address;
            peer.signal_strength = link.signal_strength;
            peer.last_seen = now;
            return Vec::new();
        }

        let mut events = Vec::with_capacity(2);
        if peers.len() >= self.config.max_peers {
            let oldest = peers
                .values()
                .min_by_key(|p| (p.last_seen, p.peer_id))
                .map(|p| p.peer_id);
            if let Some(evicted) = oldest {
                info!("Peer table full, evicting {}", evicted);
                peers.remove(&evicted);
                events.push(PeerEvent::Lost(evicted));
            }
        }

        let peer = Peer {
            peer_id,
            link_address: link.link_address,
            signal_strength: link.signal_strength,
            last_seen: now,
            queue_depth: 0,
            capabilities: Vec::new(),
        };
        peers.insert(peer_id, peer.clone());
        info!("Discovered peer {} ({} dBm)", peer_id, peer.signal_strength);
        events.push(PeerEvent::Discovered(peer));
        events
    }

    /// Remove a peer. Returns `Lost` only if it was present.
    pub fn on_lost(&self, peer_id: &PeerId) -> Option<PeerEvent> {
        self.peers.write().remove(peer_id).map(|_| {
            info!("Lost peer {}", peer_id);
            PeerEvent::Lost(*peer_id)
        })
    }

    /// Snapshot of every known peer, ordered by id
    pub fn list_peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.read().values().cloned().collect();
        peers.sort_by_key(|p| p.peer_id);
        peers
    }

    /// Snapshot of peers seen within the liveness window, ordered by id
    pub fn live_peers(&self, now: Instant) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .peers
            .read()
            .values()
            .filter(|p| p.is_live(now, &self.config))
            .cloned()
            .collect();
        peers.sort_by_key(|p| p.peer_id);
        peers
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<Peer> {
        self.peers.read().get(peer_id).cloned()
    }

    pub fn is_live(&self, peer_id: &PeerId, now: Instant) -> bool {
        self.peers
            .read()
            .get(peer_id)
            .is_some_and(|p| p.is_live(now, &self.config))
    }

    /// Update signal and queue depth. Returns false for unknown peers.
    pub fn update_link_quality(&self, peer_id: &PeerId, signal_strength: i32, queue_depth: u32) -> bool {
        match self.peers.write().get_mut(peer_id) {
            Some(peer) => {
                peer.signal_strength = signal_strength;
                peer.queue_depth = queue_depth;
                true
            }
            None => false,
        }
    }

    /// Refresh liveness on inbound traffic from a known peer
    pub fn touch(&self, peer_id: &PeerId, now: Instant) -> bool {
        match self.peers.write().get_mut(peer_id) {
            Some(peer) => {
                peer.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub fn update_capabilities(&self, peer_id: &PeerId, capabilities: Vec<String>) -> bool {
        match self.peers.write().get_mut(peer_id) {
            Some(peer) => {
                peer.capabilities = capabilities;
                true
            }
            None => false,
        }
    }

    /// Remove every peer outside the liveness window
    pub fn evict_stale(&self, now: Instant) -> Vec<PeerEvent> {
        let mut peers = self.peers.write();
        let stale: Vec<PeerId> = peers
            .values()
            .filter(|p| !p.is_live(now, &self.config))
            .map(|p| p.peer_id)
            .collect();

        stale
            .into_iter()
            .filter_map(|id| peers.remove(&id))
            .map(|peer| {
                info!("Peer {} timed out", peer.peer_id);
                PeerEvent::Lost(peer.peer_id)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(b: u8) -> PeerId {
        PeerId::from_bytes([b; 8])
    }

    fn registry() -> PeerRegistry {
        PeerRegistry::new(id(0), RegistryConfig::default())
    }

    #[test]
    fn test_discovery_creates_then_updates() {
        let reg = registry();
        let now = Instant::now();
        assert!(matches!(
            reg.on_discovered(id(1), LinkInfo::new("aa:bb", -60), now).as_slice(),
            [PeerEvent::Discovered(_)]
        ));
        assert!(reg.on_discovered(id(1), LinkInfo::new("aa:cc", -50), now).is_empty());

        let peer = reg.get(&id(1)).unwrap();
        assert_eq!(peer.link_address, "aa:cc");
        assert_eq!(peer.signal_strength, -50);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_own_id_is_ignored() {
        let reg = registry();
        assert!(reg.on_discovered(id(0), LinkInfo::new("self", -10), Instant::now()).is_empty());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_lost_fires_once() {
        let reg = registry();
        reg.on_discovered(id(1), LinkInfo::new("x", -60), Instant::now());
        assert_eq!(reg.on_lost(&id(1)), Some(PeerEvent::Lost(id(1))));
        assert_eq!(reg.on_lost(&id(1)), None);
    }

    #[test]
    fn test_stale_peers_evicted_once() {
        let reg = registry();
        let start = Instant::now();
        reg.on_discovered(id(1), LinkInfo::new("a", -60), start);
        reg.on_discovered(id(2), LinkInfo::new("b", -60), start + Duration::from_secs(20));

        let now = start + Duration::from_secs(31);
        assert_eq!(reg.live_peers(now).len(), 1);
        assert_eq!(reg.evict_stale(now), vec![PeerEvent::Lost(id(1))]);
        assert!(reg.evict_stale(now).is_empty());
        assert_eq!(reg.on_lost(&id(1)), None);
    }

    #[test]
    fn test_touch_extends_liveness() {
        let reg = registry();
        let start = Instant::now();
        reg.on_discovered(id(1), LinkInfo::new("a", -60), start);
        assert!(reg.touch(&id(1), start + Duration::from_secs(25)));
        assert!(reg.is_live(&id(1), start + Duration::from_secs(40)));
        assert!(!reg.touch(&id(9), start));
    }

    #[test]
    fn test_link_quality_and_score() {
        let reg = registry();
        reg.on_discovered(id(1), LinkInfo::new("a", -40), Instant::now());
        assert!(reg.update_link_quality(&id(1), -45, 3));
        let peer = reg.get(&id(1)).unwrap();
        assert_eq!(peer.score(10), -75);
        assert!(!reg.update_link_quality(&id(2), -45, 3));
    }

    #[test]
    fn test_capabilities_recorded() {
        let reg = registry();
        reg.on_discovered(id(1), LinkInfo::new("a", -40), Instant::now());
        assert!(reg.update_capabilities(&id(1), vec!["relay".into(), "store".into()]));
        assert_eq!(reg.get(&id(1)).unwrap().capabilities, vec!["relay", "store"]);
    }

    #[test]
    fn test_bounded_by_max_peers() {
        let reg = PeerRegistry::new(
            id(0),
            RegistryConfig {
                max_peers: 2,
                ..RegistryConfig::default()
            },
        );
        let start = Instant::now();
        reg.on_discovered(id(1), LinkInfo::new("a", -40), start);
        reg.on_discovered(id(2), LinkInfo::new("b", -40), start + Duration::from_secs(1));
        let events = reg.on_discovered(id(3), LinkInfo::new("c", -40), start + Duration::from_secs(2));

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], PeerEvent::Lost(id(1)));
        assert!(matches!(&events[1], PeerEvent::Discovered(p) if p.peer_id == id(3)));
        assert_eq!(reg.len(), 2);
        assert!(reg.get(&id(1)).is_none());
        // Already gone: no second Lost
        assert_eq!(reg.on_lost(&id(1)), None);
    }

    #[test]
    fn test_list_is_ordered() {
        let reg = registry();
        let now = Instant::now();
        for b in [5, 2, 9] {
            reg.on_discovered(id(b), LinkInfo::new("x", -40), now);
        }
        let ids: Vec<PeerId> = reg.list_peers().iter().map(|p| p.peer_id).collect();
        assert_eq!(ids, vec![id(2), id(5), id(9)]);
    }
}
