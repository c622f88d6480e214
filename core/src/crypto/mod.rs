//! Security envelope
//!
//! - [`MeshKey`]: PBKDF2-derived symmetric key shared by one mesh
//! - [`SecurityEnvelope`]: authenticated encryption of message payloads
//!
//! Replay screening happens one layer up, against the routing dedup cache,
//! and reports [`SecurityError::Replay`].

pub mod envelope;
pub mod mesh_key;

pub use envelope::{
    associated_data, decrypt, encrypt, open, seal, SecurityEnvelope, ENVELOPE_OVERHEAD,
};
pub use mesh_key::{MeshKey, DEFAULT_KDF_ITERATIONS, MESH_KEY_LEN, MESH_KEY_SALT};

use crate::message::MessageKey;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecurityError {
    #[error("Authentication failed")]
    AuthFailure,
    #[error("Ciphertext too short: {len} bytes")]
    MalformedCiphertext { len: usize },
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Unencrypted message rejected")]
    Unencrypted,
    #[error("Replayed message {0}")]
    Replay(MessageKey),
    #[error("Invalid invite: {0}")]
    InvalidInvite(String),
}
