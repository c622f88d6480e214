// WiFi Aware Transport
//
// High-bandwidth, low-latency links between nearby mesh peers using the
// platform's WiFi Aware (Neighbor Awareness Networking) API.
//
// This module provides:
// - Service publish/subscribe carrying the mesh advertisement as service info
// - Data path establishment on demand, secured with the mesh-derived PMK
// - Bandwidth estimation from signal strength
// - Platform abstraction through the WifiAwarePlatformBridge trait

use crate::identity::PeerId;
use crate::transport::abstraction::{
    DiscoveryEvent, DiscoveryStream, FrameStream, InboundFrame, LinkTarget, MeshTransport,
    TransportCapabilities, TransportError, TransportType,
};
use crate::transport::advertisement::{Advertisement, SERVICE_ID};
use crate::transport::stream::broadcast_stream;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

const CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// WiFi Aware transport configuration
#[derive(Debug, Clone)]
pub struct WifiAwareConfig {
    /// Service name to publish/discover
    pub service_name: String,
    /// Enable publishing this node's service
    pub publish_enabled: bool,
    /// Enable subscribing to peer services
    pub subscribe_enabled: bool,
    /// Maximum simultaneous data paths
    pub max_data_paths: usize,
    /// Largest frame sent over a data path
    pub mtu: usize,
    /// A peer without a data path is dropped when not rediscovered within this
    pub sighting_timeout: Duration,
}

impl Default for WifiAwareConfig {
    fn default() -> Self {
        Self {
            service_name: SERVICE_ID.to_string(),
            publish_enabled: true,
            subscribe_enabled: true,
            max_data_paths: 10,
            mtu: TransportCapabilities::for_transport(TransportType::WiFiAware).mtu,
            sighting_timeout: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// STATE MANAGEMENT
// ============================================================================

/// WiFi Aware capability and connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiAwareState {
    /// WiFi Aware not available on this device
    Unavailable,
    /// WiFi Aware available but not active
    Available,
    /// Service is being published
    Publishing,
    /// Published and subscribed to peer services
    Subscribing,
    /// At least one data path established
    DataPathActive,
}

// ============================================================================
// DATA STRUCTURES
// ============================================================================

/// Information about an established WiFi Aware data path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPathInfo {
    pub peer_id: PeerId,
    /// Platform handle of the discovered service instance
    pub handle: String,
    /// Address of the data path interface
    pub address: SocketAddr,
    /// Estimated bandwidth in bits per second
    pub bandwidth_estimate: u64,
}

/// Discovered peer information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub peer_id: PeerId,
    /// Platform handle of the discovered service instance
    pub handle: String,
    /// RSSI signal strength (typically -40 to -120 dBm)
    pub rssi: i32,
    pub last_seen: Instant,
}

// ============================================================================
// PLATFORM BRIDGE TRAIT
// ============================================================================

/// Service discovered: (handle, service info, rssi)
pub type ServiceDiscoveredCallback = Box<dyn Fn(String, Vec<u8>, i32) + Send + Sync>;

/// Message received on a data path: (handle, data)
pub type MessageReceivedCallback = Box<dyn Fn(String, Vec<u8>) + Send + Sync>;

/// Data path torn down by the platform: (handle)
pub type DataPathLostCallback = Box<dyn Fn(String) + Send + Sync>;

/// Platform-specific WiFi Aware API abstraction
///
/// Implementers provide actual WiFi Aware API calls for their platform.
/// This is typically implemented by platform-specific code (e.g., Android bindings).
#[async_trait]
pub trait WifiAwarePlatformBridge: Send + Sync {
    /// Check if WiFi Aware is available on this device
    async fn is_available(&self) -> Result<bool, TransportError>;

    /// Publish a service with the given name and info
    async fn publish_service(
        &self,
        service_name: &str,
        service_info: &[u8],
    ) -> Result<(), TransportError>;

    /// Subscribe to services with the given name
    async fn subscribe_to_services(&self, service_name: &str) -> Result<(), TransportError>;

    /// Stop publishing the service
    async fn unpublish_service(&self) -> Result<(), TransportError>;

    /// Stop subscribing to services
    async fn unsubscribe_from_services(&self) -> Result<(), TransportError>;

    /// Create a data path to a discovered service instance
    async fn create_data_path(
        &self,
        handle: &str,
        pmk: &[u8; 32],
    ) -> Result<SocketAddr, TransportError>;

    /// Close a data path
    async fn close_data_path(&self, handle: &str) -> Result<(), TransportError>;

    /// Send one frame over an established data path
    async fn send_data(&self, handle: &str, data: &[u8]) -> Result<(), TransportError>;

    /// Register callback for service discovered event
    fn set_on_service_discovered(&self, callback: ServiceDiscoveredCallback);

    /// Register callback for message received on data path
    fn set_on_message_received(&self, callback: MessageReceivedCallback);

    /// Register callback for data path loss
    fn set_on_data_path_lost(&self, callback: DataPathLostCallback);
}

// ============================================================================
// MOCK PLATFORM BRIDGE (for testing)
// ============================================================================

#[cfg(test)]
#[derive(Default)]
struct MockCallbacks {
    discovered: Option<ServiceDiscoveredCallback>,
    message: Option<MessageReceivedCallback>,
    lost: Option<DataPathLostCallback>,
}

/// Mock implementation of WifiAwarePlatformBridge for testing
#[cfg(test)]
pub struct MockWifiAwareBridge {
    available: RwLock<bool>,
    callbacks: RwLock<MockCallbacks>,
    published: RwLock<Option<Vec<u8>>>,
    pmks: RwLock<Vec<[u8; 32]>>,
    sent: RwLock<Vec<(String, Vec<u8>)>>,
}

#[cfg(test)]
impl MockWifiAwareBridge {
    pub fn new(available: bool) -> Self {
        Self {
            available: RwLock::new(available),
            callbacks: RwLock::new(MockCallbacks::default()),
            published: RwLock::new(None),
            pmks: RwLock::new(Vec::new()),
            sent: RwLock::new(Vec::new()),
        }
    }

    pub fn simulate_discovery(&self, handle: &str, info: Vec<u8>, rssi: i32) {
        if let Some(cb) = &self.callbacks.read().discovered {
            cb(handle.to_string(), info, rssi);
        }
    }

    pub fn simulate_message(&self, handle: &str, data: Vec<u8>) {
        if let Some(cb) = &self.callbacks.read().message {
            cb(handle.to_string(), data);
        }
    }

    pub fn simulate_path_lost(&self, handle: &str) {
        if let Some(cb) = &self.callbacks.read().lost {
            cb(handle.to_string());
        }
    }
}

#[cfg(test)]
#[async_trait]
impl WifiAwarePlatformBridge for MockWifiAwareBridge {
    async fn is_available(&self) -> Result<bool, TransportError> {
        Ok(*self.available.read())
    }

    async fn publish_service(
        &self,
        _service_name: &str,
        service_info: &[u8],
    ) -> Result<(), TransportError> {
        if !*self.available.read() {
            return Err(TransportError::Unavailable(TransportType::WiFiAware));
        }
        *self.published.write() = Some(service_info.to_vec());
        Ok(())
    }

    async fn subscribe_to_services(&self, _service_name: &str) -> Result<(), TransportError> {
        if !*self.available.read() {
            return Err(TransportError::Unavailable(TransportType::WiFiAware));
        }
        Ok(())
    }

    async fn unpublish_service(&self) -> Result<(), TransportError> {
        *self.published.write() = None;
        Ok(())
    }

    async fn unsubscribe_from_services(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn create_data_path(
        &self,
        _handle: &str,
        pmk: &[u8; 32],
    ) -> Result<SocketAddr, TransportError> {
        self.pmks.write().push(*pmk);
        Ok(SocketAddr::from(([192, 168, 100, 1], 5000)))
    }

    async fn close_data_path(&self, _handle: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send_data(&self, handle: &str, data: &[u8]) -> Result<(), TransportError> {
        self.sent.write().push((handle.to_string(), data.to_vec()));
        Ok(())
    }

    fn set_on_service_discovered(&self, callback: ServiceDiscoveredCallback) {
        self.callbacks.write().discovered = Some(callback);
    }

    fn set_on_message_received(&self, callback: MessageReceivedCallback) {
        self.callbacks.write().message = Some(callback);
    }

    fn set_on_data_path_lost(&self, callback: DataPathLostCallback) {
        self.callbacks.write().lost = Some(callback);
    }
}

// ============================================================================
// MAIN TRANSPORT STRUCT
// ============================================================================

#[derive(Debug, Default)]
struct WifiAwareTables {
    discovered: HashMap<PeerId, DiscoveredPeer>,
    by_handle: HashMap<String, PeerId>,
    data_paths: HashMap<PeerId, DataPathInfo>,
}

impl WifiAwareTables {
    /// Forget a peer entirely. Returns false if it was unknown.
    fn forget(&mut self, peer_id: &PeerId) -> bool {
        self.data_paths.remove(peer_id);
        match self.discovered.remove(peer_id) {
            Some(peer) => {
                self.by_handle.remove(&peer.handle);
                true
            }
            None => false,
        }
    }

    /// Drop peers without a data path that were not rediscovered in time
    fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<PeerId> {
        let stale: Vec<PeerId> = self
            .discovered
            .values()
            .filter(|p| !self.data_paths.contains_key(&p.peer_id))
            .filter(|p| now.saturating_duration_since(p.last_seen) >= timeout)
            .map(|p| p.peer_id)
            .collect();
        for peer in &stale {
            self.forget(peer);
        }
        stale
    }

    fn is_reachable(&self, peer_id: &PeerId, now: Instant, timeout: Duration) -> bool {
        self.data_paths.contains_key(peer_id)
            || self
                .discovered
                .get(peer_id)
                .is_some_and(|p| now.saturating_duration_since(p.last_seen) < timeout)
    }
}

fn expire_sightings(
    tables: &RwLock<WifiAwareTables>,
    discovery: &broadcast::Sender<DiscoveryEvent>,
    timeout: Duration,
) {
    let stale = tables.write().expire(Instant::now(), timeout);
    for peer_id in stale {
        debug!("WiFi Aware peer {} not rediscovered, dropping", peer_id);
        let _ = discovery.send(DiscoveryEvent::Lost { peer_id });
    }
}

/// WiFi Aware transport for high-bandwidth P2P communication
pub struct WifiAwareTransport {
    local_id: PeerId,
    config: WifiAwareConfig,
    pmk: [u8; 32],
    state: Arc<RwLock<WifiAwareState>>,
    bridge: Arc<dyn WifiAwarePlatformBridge>,
    tables: Arc<RwLock<WifiAwareTables>>,
    frames: broadcast::Sender<InboundFrame>,
    discovery: broadcast::Sender<DiscoveryEvent>,
}

impl WifiAwareTransport {
    /// Create a new WiFi Aware transport.
    ///
    /// `pmk` is the mesh's pairwise master key (`MeshKey::wifi_aware_pmk`).
    pub fn new(
        local_id: PeerId,
        config: WifiAwareConfig,
        pmk: [u8; 32],
        bridge: Arc<dyn WifiAwarePlatformBridge>,
    ) -> Result<Self, TransportError> {
        if config.service_name.is_empty() {
            return Err(TransportError::InvalidConfig(
                "Service name cannot be empty".to_string(),
            ));
        }
        if config.max_data_paths == 0 {
            return Err(TransportError::InvalidConfig(
                "max_data_paths must be > 0".to_string(),
            ));
        }

        let (frames, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (discovery, _) = broadcast::channel(CHANNEL_CAPACITY);
        let tables = Arc::new(RwLock::new(WifiAwareTables::default()));

        {
            let tables = tables.clone();
            let discovery = discovery.clone();
            let timeout = config.sighting_timeout;
            bridge.set_on_service_discovered(Box::new(move |handle, info, rssi| {
                expire_sightings(&tables, &discovery, timeout);
                let Some(peer_id) = Advertisement::decode_mesh(&info) else {
                    return;
                };
                if peer_id == local_id {
                    return;
                }
                {
                    let mut t = tables.write();
                    let previous = t.discovered.get(&peer_id).map(|p| p.handle.clone());
                    if let Some(old) = previous.filter(|old| *old != handle) {
                        t.by_handle.remove(&old);
                    }
                    t.by_handle.insert(handle.clone(), peer_id);
                    t.discovered.insert(
                        peer_id,
                        DiscoveredPeer {
                            peer_id,
                            handle: handle.clone(),
                            rssi,
                            last_seen: Instant::now(),
                        },
                    );
                }
                let _ = discovery.send(DiscoveryEvent::Sighted {
                    peer_id,
                    link_address: handle,
                    signal_strength: rssi,
                });
            }));
        }
        {
            let tables = tables.clone();
            let frames = frames.clone();
            bridge.set_on_message_received(Box::new(move |handle, data| {
                match tables.read().by_handle.get(&handle).copied() {
                    Some(from) => {
                        let _ = frames.send(InboundFrame { from, data });
                    }
                    None => debug!("WiFi Aware data from unknown handle {}, dropping", handle),
                }
            }));
        }
        {
            let tables = tables.clone();
            let discovery = discovery.clone();
            bridge.set_on_data_path_lost(Box::new(move |handle| {
                let lost = {
                    let mut t = tables.write();
                    let peer = t.by_handle.get(&handle).copied();
                    peer.filter(|peer| t.forget(peer))
                };
                if let Some(peer_id) = lost {
                    info!("WiFi Aware data path to {} lost", peer_id);
                    let _ = discovery.send(DiscoveryEvent::Lost { peer_id });
                }
            }));
        }

        Ok(Self {
            local_id,
            config,
            pmk,
            state: Arc::new(RwLock::new(WifiAwareState::Available)),
            bridge,
            tables,
            frames,
            discovery,
        })
    }

    /// Get current WiFi Aware state
    pub fn get_state(&self) -> WifiAwareState {
        *self.state.read()
    }

    /// Initialize and check WiFi Aware availability
    pub async fn initialize(&self) -> Result<(), TransportError> {
        let available = self.bridge.is_available().await.map_err(|e| {
            warn!("WiFi Aware availability check failed: {}", e);
            e
        })?;

        if !available {
            *self.state.write() = WifiAwareState::Unavailable;
            return Err(TransportError::Unavailable(TransportType::WiFiAware));
        }

        *self.state.write() = WifiAwareState::Available;
        info!("WiFi Aware initialized and available");
        Ok(())
    }

    /// Publish this node's advertisement to nearby peers
    pub async fn publish_service(&self) -> Result<(), TransportError> {
        if !self.config.publish_enabled {
            return Err(TransportError::InvalidConfig(
                "Publishing not enabled in config".to_string(),
            ));
        }
        if self.get_state() == WifiAwareState::Unavailable {
            return Err(TransportError::Unavailable(TransportType::WiFiAware));
        }

        let info = Advertisement::new(self.local_id).encode();
        self.bridge
            .publish_service(&self.config.service_name, &info)
            .await?;

        *self.state.write() = WifiAwareState::Publishing;
        info!("Published WiFi Aware service: {}", self.config.service_name);
        Ok(())
    }

    /// Subscribe to discover nearby mesh peers
    pub async fn subscribe(&self) -> Result<(), TransportError> {
        if !self.config.subscribe_enabled {
            return Err(TransportError::InvalidConfig(
                "Subscription not enabled in config".to_string(),
            ));
        }
        if self.get_state() == WifiAwareState::Unavailable {
            return Err(TransportError::Unavailable(TransportType::WiFiAware));
        }

        self.bridge
            .subscribe_to_services(&self.config.service_name)
            .await?;

        *self.state.write() = WifiAwareState::Subscribing;
        info!("Subscribed to WiFi Aware service: {}", self.config.service_name);
        Ok(())
    }

    /// Create a data path to a discovered peer
    pub async fn create_data_path(&self, peer_id: PeerId) -> Result<DataPathInfo, TransportError> {
        if self.get_state() == WifiAwareState::Unavailable {
            return Err(TransportError::Unavailable(TransportType::WiFiAware));
        }

        let peer = {
            let tables = self.tables.read();
            if tables.data_paths.len() >= self.config.max_data_paths {
                return Err(TransportError::ConnectionFailed(
                    "Maximum data paths reached".to_string(),
                ));
            }
            tables
                .discovered
                .get(&peer_id)
                .cloned()
                .ok_or(TransportError::Unreachable(peer_id))?
        };

        let address = self.bridge.create_data_path(&peer.handle, &self.pmk).await?;

        let info = DataPathInfo {
            peer_id,
            handle: peer.handle,
            address,
            bandwidth_estimate: estimate_bandwidth_from_rssi(peer.rssi),
        };
        self.tables.write().data_paths.insert(peer_id, info.clone());
        *self.state.write() = WifiAwareState::DataPathActive;

        info!("Created WiFi Aware data path to peer {}: {}", peer_id, address);
        Ok(info)
    }

    /// Close a data path to a peer
    pub async fn close_data_path(&self, peer_id: PeerId) -> Result<(), TransportError> {
        let handle = self
            .tables
            .read()
            .data_paths
            .get(&peer_id)
            .map(|p| p.handle.clone());
        if let Some(handle) = handle {
            self.bridge.close_data_path(&handle).await?;
            self.tables.write().data_paths.remove(&peer_id);
            info!("Closed WiFi Aware data path to peer {}", peer_id);
        }
        Ok(())
    }

    /// Get information about an active data path
    pub fn get_data_path(&self, peer_id: &PeerId) -> Option<DataPathInfo> {
        self.tables.read().data_paths.get(peer_id).cloned()
    }

    /// Get all active data paths
    pub fn get_active_data_paths(&self) -> Vec<DataPathInfo> {
        self.tables.read().data_paths.values().cloned().collect()
    }

    /// Get discovered peers
    pub fn get_discovered_peers(&self) -> Vec<DiscoveredPeer> {
        self.tables.read().discovered.values().cloned().collect()
    }

    /// Shutdown WiFi Aware transport
    pub async fn shutdown(&self) -> Result<(), TransportError> {
        let paths: Vec<PeerId> = self.tables.read().data_paths.keys().copied().collect();
        for peer_id in paths {
            let _ = self.close_data_path(peer_id).await;
        }

        let _ = self.bridge.unpublish_service().await;
        let _ = self.bridge.unsubscribe_from_services().await;

        *self.state.write() = WifiAwareState::Available;
        info!("WiFi Aware transport shutdown complete");
        Ok(())
    }

    async fn send_to(&self, peer: PeerId, frame: &[u8]) -> Result<(), TransportError> {
        expire_sightings(&self.tables, &self.discovery, self.config.sighting_timeout);
        let handle = match self.get_data_path(&peer) {
            Some(path) => path.handle,
            None => self.create_data_path(peer).await?.handle,
        };
        self.bridge.send_data(&handle, frame).await
    }
}

impl Drop for WifiAwareTransport {
    fn drop(&mut self) {
        self.pmk.zeroize();
    }
}

#[async_trait]
impl MeshTransport for WifiAwareTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::WiFiAware
    }

    async fn is_available(&self) -> bool {
        self.get_state() != WifiAwareState::Unavailable
            && self.bridge.is_available().await.unwrap_or(false)
    }

    fn can_reach(&self, peer: &PeerId) -> bool {
        self.tables
            .read()
            .is_reachable(peer, Instant::now(), self.config.sighting_timeout)
    }

    fn mtu(&self) -> usize {
        self.config.mtu
    }

    fn estimated_bandwidth(&self) -> u64 {
        self.tables
            .read()
            .data_paths
            .values()
            .map(|p| p.bandwidth_estimate)
            .max()
            .unwrap_or_else(|| {
                TransportCapabilities::for_transport(TransportType::WiFiAware)
                    .estimated_bandwidth_bps
            })
    }

    fn estimated_latency(&self) -> Duration {
        TransportCapabilities::for_transport(TransportType::WiFiAware).latency()
    }

    async fn send(&self, target: LinkTarget, frame: &[u8]) -> Result<(), TransportError> {
        if frame.len() > self.config.mtu {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                mtu: self.config.mtu,
            });
        }
        match target {
            LinkTarget::Peer(peer) => self.send_to(peer, frame).await,
            LinkTarget::Broadcast => {
                // Broadcast goes over established paths only
                let peers: Vec<PeerId> = self.tables.read().data_paths.keys().copied().collect();
                if peers.is_empty() {
                    return Err(TransportError::SendFailed(
                        "no WiFi Aware data paths".to_string(),
                    ));
                }
                let mut delivered = 0;
                let mut last_err = None;
                for peer in peers {
                    match self.send_to(peer, frame).await {
                        Ok(()) => delivered += 1,
                        Err(e) => {
                            warn!("WiFi Aware broadcast to {} failed: {}", peer, e);
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
        self.initialize().await?;
        if self.config.publish_enabled {
            self.publish_service().await?;
        }
        if self.config.subscribe_enabled {
            self.subscribe().await?;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.shutdown().await
    }
}

// ============================================================================
// UTILITY FUNCTIONS
// ============================================================================

/// Estimate bandwidth from WiFi Aware signal strength (RSSI)
/// RSSI ranges from -40 (excellent) to -120 (poor) dBm
fn estimate_bandwidth_from_rssi(rssi: i32) -> u64 {
    // Linear between the two ends:
    // -40 dBm -> ~100 Mbps, -120 dBm -> ~1 Mbps
    const MAX_BANDWIDTH: i32 = 100_000_000;
    const MIN_BANDWIDTH: i32 = 1_000_000;
    const RSSI_EXCELLENT: i32 = -40;
    const RSSI_POOR: i32 = -120;

    let rssi = rssi.clamp(RSSI_POOR, RSSI_EXCELLENT);
    let ratio = (rssi - RSSI_POOR) as f64 / (RSSI_EXCELLENT - RSSI_POOR) as f64;
    let bandwidth = MIN_BANDWIDTH as f64 + (MAX_BANDWIDTH - MIN_BANDWIDTH) as f64 * ratio;

    bandwidth as u64
}

// ============================================================================
// TESTS
// ============================================================================
