// Service advertisement
//
// Layout: [1] service id length | [N] service id | [8] peer id
//
// Carried in BLE advertising data and WiFi Aware service info, so scanners
// can tell mesh nodes apart from unrelated radio traffic.

use crate::identity::{PeerId, PEER_ID_LEN};

/// Identifier advertised by every mesh node
pub const SERVICE_ID: &str = "meshlink.v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub service_id: String,
    pub peer_id: PeerId,
}

impl Advertisement {
    /// Advertisement for this mesh's service
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            service_id: SERVICE_ID.to_string(),
            peer_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let service = self.service_id.as_bytes();
        let mut buf = Vec::with_capacity(1 + service.len() + PEER_ID_LEN);
        buf.push(service.len() as u8);
        buf.extend_from_slice(service);
        buf.extend_from_slice(self.peer_id.as_bytes());
        buf
    }

    /// Parse any well-formed advertisement
    pub fn decode(data: &[u8]) -> Option<Self> {
        let (&len, rest) = data.split_first()?;
        let len = len as usize;
        if rest.len() < len + PEER_ID_LEN {
            return None;
        }
        let service_id = std::str::from_utf8(&rest[..len]).ok()?.to_string();
        let peer_id = PeerId::from_slice(&rest[len..len + PEER_ID_LEN]).ok()?;
        Some(Self {
            service_id,
            peer_id,
        })
    }

    /// Parse and keep only advertisements for our service
    pub fn decode_mesh(data: &[u8]) -> Option<PeerId> {
        Self::decode(data)
            .filter(|ad| ad.service_id == SERVICE_ID)
            .map(|ad| ad.peer_id)
    }
}
