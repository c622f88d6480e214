//! Transport abstraction layer
//!
//! One capability-set contract implemented by every radio technology. The
//! selector iterates transports in priority order; the node consumes each
//! transport's frame and discovery streams.

use crate::identity::PeerId;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Represents different transport types available in the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    /// WiFi Aware (Neighbor Awareness Networking) data paths
    WiFiAware,
    /// Bluetooth Low Energy
    BLE,
    /// In-memory medium for tests and simulation
    Local,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::WiFiAware => write!(f, "WiFiAware"),
            TransportType::BLE => write!(f, "BLE"),
            TransportType::Local => write!(f, "Local"),
        }
    }
}

/// Static characteristics of a transport type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportCapabilities {
    /// Largest frame the link carries in one delivery
    pub mtu: usize,
    /// Estimated bandwidth in bits per second
    pub estimated_bandwidth_bps: u64,
    /// Estimated latency in milliseconds
    pub estimated_latency_ms: u32,
}

impl TransportCapabilities {
    /// Get default capabilities for a transport type
    pub fn for_transport(transport: TransportType) -> Self {
        match transport {
            TransportType::WiFiAware => Self {
                mtu: 1400,
                estimated_bandwidth_bps: 80_000_000, // 80 Mbps
                estimated_latency_ms: 10,
            },
            TransportType::BLE => Self {
                mtu: 182,
                estimated_bandwidth_bps: 1_000_000, // 1 Mbps
                estimated_latency_ms: 50,
            },
            TransportType::Local => Self {
                mtu: 512,
                estimated_bandwidth_bps: 10_000_000_000,
                estimated_latency_ms: 1,
            },
        }
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.estimated_latency_ms as u64)
    }
}

/// Where a frame goes on the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkTarget {
    /// One neighbour
    Peer(PeerId),
    /// Every neighbour the link currently reaches
    Broadcast,
}

impl fmt::Display for LinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkTarget::Peer(id) => write!(f, "{}", id),
            LinkTarget::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// A frame as delivered by the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Neighbour the frame arrived from
    pub from: PeerId,
    /// Frame bytes, already cut to the radio's valid length
    pub data: Vec<u8>,
}

/// Peer sighting events produced by `discover()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A mesh node advertising our service identifier was seen
    Sighted {
        peer_id: PeerId,
        link_address: String,
        signal_strength: i32,
    },
    /// Fresh link metrics for a known neighbour
    LinkQuality {
        peer_id: PeerId,
        signal_strength: i32,
        queue_depth: u32,
    },
    /// The radio reports the neighbour gone
    Lost { peer_id: PeerId },
}

impl DiscoveryEvent {
    pub fn peer_id(&self) -> PeerId {
        match self {
            DiscoveryEvent::Sighted { peer_id, .. }
            | DiscoveryEvent::LinkQuality { peer_id, .. }
            | DiscoveryEvent::Lost { peer_id } => *peer_id,
        }
    }
}

/// Restartable, non-terminating stream of received frames
pub type FrameStream = BoxStream<'static, InboundFrame>;

/// Restartable, non-terminating stream of discovery events
pub type DiscoveryStream = BoxStream<'static, DiscoveryEvent>;

/// Errors that can occur in the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Transport not available: {0}")]
    Unavailable(TransportType),

    #[error("Peer not reachable: {0}")]
    Unreachable(PeerId),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Frame of {len} bytes exceeds link MTU {mtu}")]
    FrameTooLarge { len: usize, mtu: usize },

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// The contract every radio technology implements
#[async_trait]
pub trait MeshTransport: Send + Sync {
    fn transport_type(&self) -> TransportType;

    /// Whether the radio is powered and usable right now
    async fn is_available(&self) -> bool;

    /// Whether `peer` is currently reachable over this transport
    fn can_reach(&self, peer: &PeerId) -> bool;

    /// Maximum frame size
    fn mtu(&self) -> usize;

    fn estimated_bandwidth(&self) -> u64;

    fn estimated_latency(&self) -> Duration;

    /// Send one frame
    async fn send(&self, target: LinkTarget, frame: &[u8]) -> Result<(), TransportError>;

    /// Fresh subscription to incoming frames
    fn receive(&self) -> FrameStream;

    /// Fresh subscription to peer sightings
    fn discover(&self) -> DiscoveryStream;

    /// Bring the radio up (advertise, scan)
    async fn start(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Bring the radio down
    async fn stop(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_type_display() {
        assert_eq!(TransportType::BLE.to_string(), "BLE");
        assert_eq!(TransportType::WiFiAware.to_string(), "WiFiAware");
        assert_eq!(TransportType::Local.to_string(), "Local");
    }

    #[test]
    fn test_transport_type_serde_names() {
        let json = serde_json::to_string(&TransportType::WiFiAware).unwrap();
        assert_eq!(json, "\"WiFiAware\"");
        let parsed: TransportType = serde_json::from_str("\"BLE\"").unwrap();
        assert_eq!(parsed, TransportType::BLE);
    }

    #[test]
    fn test_capabilities_order_by_bandwidth() {
        let wifi = TransportCapabilities::for_transport(TransportType::WiFiAware);
        let ble = TransportCapabilities::for_transport(TransportType::BLE);
        assert!(wifi.estimated_bandwidth_bps > ble.estimated_bandwidth_bps);
        assert!(wifi.mtu > ble.mtu);
        assert_eq!(ble.latency(), Duration::from_millis(50));
    }

    #[test]
    fn test_discovery_event_peer_id() {
        let id = PeerId::from_bytes([4; 8]);
        assert_eq!(DiscoveryEvent::Lost { peer_id: id }.peer_id(), id);
        let sighted = DiscoveryEvent::Sighted {
            peer_id: id,
            link_address: "aa".into(),
            signal_strength: -60,
        };
        assert_eq!(sighted.peer_id(), id);
    }

    #[test]
    fn test_link_target_display() {
        assert_eq!(LinkTarget::Broadcast.to_string(), "broadcast");
        let id = PeerId::from_bytes([0xab; 8]);
        assert_eq!(LinkTarget::Peer(id).to_string(), "abababababababab");
    }
}
