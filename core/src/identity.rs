// Node identity: the short peer identifier carried in every frame

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of a peer identifier in bytes
pub const PEER_ID_LEN: usize = 8;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerIdError {
    #[error("Invalid peer id length: expected {PEER_ID_LEN} bytes, got {0}")]
    InvalidLength(usize),
    #[error("Invalid hex: {0}")]
    InvalidHex(String),
}

/// 8-byte identifier of a mesh node, carried twice (source and destination)
/// in every frame's address block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Wrap raw identifier bytes
    pub const fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse from a byte slice of exactly `PEER_ID_LEN` bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, PeerIdError> {
        let arr: [u8; PEER_ID_LEN] = bytes
            .try_into()
            .map_err(|_| PeerIdError::InvalidLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Generate a random identifier
    pub fn random() -> Self {
        let mut bytes = [0u8; PEER_ID_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive the identifier from a long-term identity public key.
    ///
    /// First 8 bytes of blake3(public_key), so every node that knows the key
    /// computes the same id.
    pub fn from_identity_key(public_key: &[u8]) -> Self {
        let hash = blake3::hash(public_key);
        let mut bytes = [0u8; PEER_ID_LEN];
        bytes.copy_from_slice(&hash.as_bytes()[..PEER_ID_LEN]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| PeerIdError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}
