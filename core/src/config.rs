//! Mesh configuration
//!
//! Every tunable of the transport core, serializable to/from JSON. Defaults
//! are a starting point for small ad-hoc meshes, not protocol constants: the
//! only values a whole mesh must agree on are `security.kdf_iterations` and
//! the protocol version.

use crate::transport::TransportType;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Fragmentation and reassembly settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Maximum number of fragments per message (1..=255)
    pub max_fragments: u8,
    /// How long an incomplete reassembly is kept, in milliseconds
    pub reassembly_timeout_ms: u64,
    /// Maximum number of messages reassembling at once
    pub max_pending_reassemblies: usize,
    /// Optional clamp applied to every transport MTU
    pub max_frame_size: Option<usize>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_fragments: 32,
            reassembly_timeout_ms: 5_000,
            max_pending_reassemblies: 64,
            max_frame_size: None,
        }
    }
}

impl CodecConfig {
    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_millis(self.reassembly_timeout_ms)
    }

    /// MTU after applying `max_frame_size`
    pub fn effective_mtu(&self, transport_mtu: usize) -> usize {
        match self.max_frame_size {
            Some(max) => transport_mtu.min(max),
            None => transport_mtu,
        }
    }
}

/// Routing engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Hop budget given to locally originated messages
    pub default_ttl: u8,
    /// Maximum number of dedup entries kept
    pub dedup_capacity: usize,
    /// How long a dedup entry suppresses duplicates, in seconds
    pub dedup_retention_secs: u64,
    /// With at most this many candidates, forward to all of them
    pub flood_threshold: usize,
    /// Score penalty per queued frame (score = signal - penalty * queue_depth)
    pub queue_depth_penalty: i64,
    /// Lower bound of the gossip subset size
    pub min_forward_set: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_ttl: 5,
            dedup_capacity: 4_096,
            dedup_retention_secs: 120,
            flood_threshold: 3,
            queue_depth_penalty: 10,
            min_forward_set: 2,
        }
    }
}

impl RoutingConfig {
    pub fn dedup_retention(&self) -> Duration {
        Duration::from_secs(self.dedup_retention_secs)
    }
}

/// Peer registry settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Peers not sighted for this long are evicted, in seconds
    pub liveness_timeout_secs: u64,
    /// Maximum number of peers tracked
    pub max_peers: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_secs: 30,
            max_peers: 256,
        }
    }
}

impl RegistryConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }
}

/// Security envelope settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// PBKDF2 iterations for mesh key derivation (must match across the mesh)
    pub kdf_iterations: u32,
    /// Drop frames that arrive without the ENCRYPTED flag
    pub require_encryption: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: crate::crypto::DEFAULT_KDF_ITERATIONS,
            require_encryption: true,
        }
    }
}

/// Node runtime settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Transports in the order the selector tries them
    pub transport_priority: Vec<TransportType>,
    /// Interval between announce beacons, in seconds (0 disables)
    pub announce_interval_secs: u64,
    /// Interval of the maintenance sweep, in milliseconds
    pub maintenance_interval_ms: u64,
    /// How long a reliable send waits for its data-ack, in milliseconds
    pub ack_timeout_ms: u64,
    /// Re-issues of an unacknowledged reliable send
    pub max_retransmissions: u32,
    /// Capabilities this node advertises
    pub capabilities: Vec<String>,
    /// Capacity of the node event channel
    pub event_buffer: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            transport_priority: vec![
                TransportType::WiFiAware,
                TransportType::BLE,
                TransportType::Local,
            ],
            announce_interval_secs: 10,
            maintenance_interval_ms: 1_000,
            ack_timeout_ms: 5_000,
            max_retransmissions: 2,
            capabilities: Vec::new(),
            event_buffer: 256,
        }
    }
}

impl NodeConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn announce_interval(&self) -> Option<Duration> {
        (self.announce_interval_secs > 0).then(|| Duration::from_secs(self.announce_interval_secs))
    }
}

/// Complete mesh configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub codec: CodecConfig,
    pub routing: RoutingConfig,
    pub peers: RegistryConfig,
    pub security: SecurityConfig,
    pub node: NodeConfig,
}

impl MeshConfig {
    /// Create new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.codec.max_fragments == 0 {
            return invalid("codec.max_fragments must be >= 1");
        }
        if self.codec.reassembly_timeout_ms == 0 {
            return invalid("codec.reassembly_timeout_ms must be > 0");
        }
        if self.codec.max_pending_reassemblies == 0 {
            return invalid("codec.max_pending_reassemblies must be > 0");
        }
        if matches!(self.codec.max_frame_size, Some(size) if size <= crate::message::FRAME_OVERHEAD) {
            return invalid("codec.max_frame_size must exceed the frame overhead");
        }

        if self.routing.dedup_capacity == 0 {
            return invalid("routing.dedup_capacity must be > 0");
        }
        if self.routing.dedup_retention_secs == 0 {
            return invalid("routing.dedup_retention_secs must be > 0");
        }
        if self.routing.flood_threshold == 0 {
            return invalid("routing.flood_threshold must be >= 1");
        }
        if self.routing.min_forward_set == 0 {
            return invalid("routing.min_forward_set must be >= 1");
        }
        if self.routing.queue_depth_penalty < 0 {
            return invalid("routing.queue_depth_penalty cannot be negative");
        }

        if self.peers.liveness_timeout_secs == 0 {
            return invalid("peers.liveness_timeout_secs must be > 0");
        }
        if self.peers.max_peers == 0 {
            return invalid("peers.max_peers must be > 0");
        }

        if self.security.kdf_iterations == 0 {
            return invalid("security.kdf_iterations must be > 0");
        }

        if self.node.transport_priority.is_empty() {
            return invalid("node.transport_priority cannot be empty");
        }
        let unique: HashSet<_> = self.node.transport_priority.iter().collect();
        if unique.len() != self.node.transport_priority.len() {
            return invalid("node.transport_priority contains duplicates");
        }
        if self.node.maintenance_interval_ms == 0 {
            return invalid("node.maintenance_interval_ms must be > 0");
        }
        if self.node.ack_timeout_ms == 0 {
            return invalid("node.ack_timeout_ms must be > 0");
        }
        if self.node.event_buffer == 0 {
            return invalid("node.event_buffer must be > 0");
        }

        Ok(())
    }

    /// Load config from JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_string(&content)
    }

    /// Save config to JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = self.to_json_string()?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Convert to pretty JSON string
    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        self.validate()?;
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Create from JSON string
    pub fn from_json_string(json: &str) -> Result<Self, ConfigError> {
        let config: MeshConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MeshConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.routing.default_ttl, 5);
        assert_eq!(config.routing.flood_threshold, 3);
        assert_eq!(config.routing.queue_depth_penalty, 10);
        assert_eq!(config.node.transport_priority[0], TransportType::WiFiAware);
    }

    #[test]
    fn test_rejects_zero_fragments() {
        let mut config = MeshConfig::default();
        config.codec.max_fragments = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_priority() {
        let mut config = MeshConfig::default();
        config.node.transport_priority = vec![TransportType::BLE, TransportType::BLE];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_tiny_frame_clamp() {
        let mut config = MeshConfig::default();
        config.codec.max_frame_size = Some(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "routing": { "default_ttl": 7 }, "codec": { "max_fragments": 8 } }"#;
        let config = MeshConfig::from_json_string(json).unwrap();
        assert_eq!(config.routing.default_ttl, 7);
        assert_eq!(config.codec.max_fragments, 8);
        assert_eq!(config.routing.dedup_capacity, 4_096);
        assert_eq!(config.peers, RegistryConfig::default());
    }

    #[test]
    fn test_invalid_json_rejected() {
        let json = r#"{ "routing": { "flood_threshold": 0 } }"#;
        assert!(matches!(
            MeshConfig::from_json_string(json),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = MeshConfig::default();
        config.node.capabilities = vec!["relay".into()];
        config.save(&path).unwrap();

        let loaded = MeshConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_announce_interval_zero_disables() {
        let mut config = NodeConfig::default();
        config.announce_interval_secs = 0;
        assert!(config.announce_interval().is_none());
    }
}
