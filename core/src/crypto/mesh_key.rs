// Mesh key derivation
//
// invite secret --PBKDF2-HMAC-SHA256(salt, iterations)--> 32-byte mesh key
//
// Deterministic: every member holding the same invite derives the same key.
// The key never leaves the node; only its 4-byte fingerprint is logged.

use super::SecurityError;
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Salt for mesh key derivation.
/// Changing this splits every existing mesh.
pub const MESH_KEY_SALT: &[u8] = b"meshlink/mesh-key/v1";

/// Default PBKDF2 iteration count
pub const DEFAULT_KDF_ITERATIONS: u32 = 600_000;

/// Length of the mesh key in bytes
pub const MESH_KEY_LEN: usize = 32;

const FINGERPRINT_CONTEXT: &str = "meshlink v1 mesh key fingerprint";
const WIFI_AWARE_PMK_CONTEXT: &str = "meshlink v1 wifi-aware pairwise master key";

/// Symmetric key shared by every member of one mesh
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MeshKey {
    bytes: [u8; MESH_KEY_LEN],
}

impl MeshKey {
    /// Derive the mesh key from an invite secret with the default iteration count
    pub fn derive(invite: &str) -> Result<Self, SecurityError> {
        Self::derive_with_iterations(invite, DEFAULT_KDF_ITERATIONS)
    }

    /// Derive with an explicit iteration count (must match across the mesh)
    pub fn derive_with_iterations(invite: &str, iterations: u32) -> Result<Self, SecurityError> {
        if invite.is_empty() {
            return Err(SecurityError::InvalidInvite(
                "invite secret cannot be empty".to_string(),
            ));
        }
        if iterations == 0 {
            return Err(SecurityError::InvalidInvite(
                "iteration count must be > 0".to_string(),
            ));
        }

        let mut bytes = [0u8; MESH_KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(invite.as_bytes(), MESH_KEY_SALT, iterations, &mut bytes);
        Ok(Self { bytes })
    }

    /// Wrap raw key material
    pub fn from_bytes(bytes: [u8; MESH_KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Short, non-secret identifier of the mesh
    pub fn fingerprint(&self) -> [u8; 4] {
        let digest = blake3::derive_key(FINGERPRINT_CONTEXT, &self.bytes);
        [digest[0], digest[1], digest[2], digest[3]]
    }

    pub fn fingerprint_hex(&self) -> String {
        hex::encode(self.fingerprint())
    }

    /// Pairwise master key for WiFi Aware data paths.
    ///
    /// Only nodes holding the same mesh key can complete the data-path
    /// handshake, so foreign devices never get a link.
    pub fn wifi_aware_pmk(&self) -> [u8; 32] {
        blake3::derive_key(WIFI_AWARE_PMK_CONTEXT, &self.bytes)
    }

    pub(crate) fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.bytes))
    }
}

impl std::fmt::Debug for MeshKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MeshKey(fp={})", self.fingerprint_hex())
    }
}

impl PartialEq for MeshKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for MeshKey {}
