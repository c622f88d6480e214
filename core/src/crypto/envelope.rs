// Security envelope: XChaCha20-Poly1305 under the mesh key
//
// Sealed payload layout:
//   [24] nonce | [N] ciphertext | [16] tag
//
// The associated data binds the fields a relay must not change:
//   source_id(8) | destination_id(8, zeros for broadcast) | sequence(2 BE) | type(1)
// TTL is left out so relays forward the sealed payload untouched.

use super::mesh_key::MeshKey;
use super::SecurityError;
use crate::identity::PEER_ID_LEN;
use crate::message::{Message, MessageFlags};
use chacha20poly1305::{
    aead::{Aead, Payload},
    XNonce,
};
use rand::RngCore;
use tracing::warn;

/// Nonce length of XChaCha20-Poly1305
pub const NONCE_LEN: usize = 24;

/// Poly1305 tag length
pub const TAG_LEN: usize = 16;

/// Bytes a sealed payload adds to the plaintext
pub const ENVELOPE_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Length of the associated data block
pub const AAD_LEN: usize = 2 * PEER_ID_LEN + 3;

/// Encrypt `plaintext` under `key` with a fresh random nonce
pub fn encrypt(plaintext: &[u8], key: &MeshKey) -> Result<Vec<u8>, SecurityError> {
    seal(plaintext, key, &[])
}

/// Decrypt a payload produced by [`encrypt`]
pub fn decrypt(sealed: &[u8], key: &MeshKey) -> Result<Vec<u8>, SecurityError> {
    open(sealed, key, &[])
}

/// Encrypt with associated data
pub fn seal(plaintext: &[u8], key: &MeshKey, aad: &[u8]) -> Result<Vec<u8>, SecurityError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = key
        .cipher()
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| SecurityError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt with associated data. Any tampering yields `AuthFailure`.
pub fn open(sealed: &[u8], key: &MeshKey, aad: &[u8]) -> Result<Vec<u8>, SecurityError> {
    if sealed.len() < ENVELOPE_OVERHEAD {
        return Err(SecurityError::MalformedCiphertext { len: sealed.len() });
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);

    key.cipher()
        .decrypt(
            XNonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| SecurityError::AuthFailure)
}

/// Associated data for a message
pub fn associated_data(message: &Message) -> [u8; AAD_LEN] {
    let mut aad = [0u8; AAD_LEN];
    aad[..PEER_ID_LEN].copy_from_slice(message.source_id.as_bytes());
    if let Some(dest) = message.destination_id {
        aad[PEER_ID_LEN..2 * PEER_ID_LEN].copy_from_slice(dest.as_bytes());
    }
    aad[2 * PEER_ID_LEN..2 * PEER_ID_LEN + 2].copy_from_slice(&message.sequence.to_be_bytes());
    aad[AAD_LEN - 1] = message.message_type.as_u8();
    aad
}

/// Seals outgoing and opens incoming messages for one mesh
#[derive(Debug, Clone)]
pub struct SecurityEnvelope {
    key: MeshKey,
    require_encryption: bool,
}

impl SecurityEnvelope {
    pub fn new(key: MeshKey, require_encryption: bool) -> Self {
        Self {
            key,
            require_encryption,
        }
    }

    /// Encrypt the payload in place and set the ENCRYPTED flag
    pub fn seal_message(&self, mut message: Message) -> Result<Message, SecurityError> {
        let aad = associated_data(&message);
        message.payload = seal(&message.payload, &self.key, &aad)?;
        message.flags.insert(MessageFlags::ENCRYPTED);
        Ok(message)
    }

    /// Plaintext payload of an incoming message.
    ///
    /// The message itself is left untouched so it can be forwarded as is.
    pub fn open_message(&self, message: &Message) -> Result<Vec<u8>, SecurityError> {
        if !message.is_encrypted() {
            if self.require_encryption {
                return Err(SecurityError::Unencrypted);
            }
            return Ok(message.payload.clone());
        }

        let aad = associated_data(message);
        open(&message.payload, &self.key, &aad).map_err(|e| {
            if e == SecurityError::AuthFailure {
                // Never log payload bytes
                warn!(
                    "Authentication failed for {} ({} bytes, mesh {})",
                    message.key(),
                    message.payload.len(),
                    self.key.fingerprint_hex()
                );
            }
            e
        })
    }

    pub fn key(&self) -> &MeshKey {
        &self.key
    }

    pub fn require_encryption(&self) -> bool {
        self.require_encryption
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerId;
    use crate::message::MessageType;

    fn key(b: u8) -> MeshKey {
        MeshKey::from_bytes([b; 32])
    }

    fn message() -> Message {
        Message::unicast(
            MessageType::Data,
            PeerId::from_bytes([1; 8]),
            PeerId::from_bytes([2; 8]),
            77,
            4,
            b"meet at the north gate".to_vec(),
        )
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let k = key(1);
        let sealed = encrypt(b"hello mesh", &k).unwrap();
        assert_eq!(sealed.len(), 10 + ENVELOPE_OVERHEAD);
        assert_eq!(decrypt(&sealed, &k).unwrap(), b"hello mesh");
    }

    #[test]
    fn test_wrong_key_is_auth_failure() {
        let sealed = encrypt(b"secret", &key(1)).unwrap();
        assert_eq!(decrypt(&sealed, &key(2)), Err(SecurityError::AuthFailure));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let k = key(1);
        let mut sealed = encrypt(b"secret", &k).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(decrypt(&sealed, &k), Err(SecurityError::AuthFailure));
    }

    #[test]
    fn test_fresh_nonce_per_message() {
        let k = key(1);
        let a = encrypt(b"same", &k).unwrap();
        let b = encrypt(b"same", &k).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_truncated_ciphertext_is_malformed() {
        assert!(matches!(
            decrypt(&[0u8; 10], &key(1)),
            Err(SecurityError::MalformedCiphertext { len: 10 })
        ));
    }

    #[test]
    fn test_seal_open_message() {
        let envelope = SecurityEnvelope::new(key(3), true);
        let original = message();
        let sealed = envelope.seal_message(original.clone()).unwrap();
        assert!(sealed.is_encrypted());
        assert_ne!(sealed.payload, original.payload);
        assert_eq!(envelope.open_message(&sealed).unwrap(), original.payload);
    }

    #[test]
    fn test_ttl_change_keeps_message_valid() {
        let envelope = SecurityEnvelope::new(key(3), true);
        let mut sealed = envelope.seal_message(message()).unwrap();
        sealed.ttl -= 1;
        assert!(envelope.open_message(&sealed).is_ok());
    }

    #[test]
    fn test_readdressing_breaks_authentication() {
        let envelope = SecurityEnvelope::new(key(3), true);
        let mut sealed = envelope.seal_message(message()).unwrap();
        sealed.destination_id = Some(PeerId::from_bytes([9; 8]));
        assert_eq!(envelope.open_message(&sealed), Err(SecurityError::AuthFailure));

        let mut sealed = envelope.seal_message(message()).unwrap();
        sealed.sequence += 1;
        assert_eq!(envelope.open_message(&sealed), Err(SecurityError::AuthFailure));
    }

    #[test]
    fn test_unencrypted_policy() {
        let strict = SecurityEnvelope::new(key(3), true);
        assert_eq!(strict.open_message(&message()), Err(SecurityError::Unencrypted));

        let lenient = SecurityEnvelope::new(key(3), false);
        assert_eq!(lenient.open_message(&message()).unwrap(), message().payload);
    }
}
