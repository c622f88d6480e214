// meshlink core: offline peer-to-peer mesh transport
//
// Nearby nodes discover each other over short-range radios, split payloads
// to fit tiny link MTUs, relay them across hops by controlled flooding, and
// seal everything under a key shared by one mesh.

pub mod config;
pub mod crypto;
pub mod identity;
pub mod message;
pub mod node;
pub mod peers;
pub mod routing;
pub mod transport;

use thiserror::Error;

pub use config::{ConfigError, MeshConfig};
pub use crypto::{MeshKey, SecurityEnvelope, SecurityError};
pub use identity::PeerId;
pub use message::{CodecError, Message, MessageFlags, MessageKey, MessageType, WireCodec};
pub use node::{Delivery, MeshNode, NodeEvent, ReliableOutcome, SendError, SendReceipt};
pub use peers::{Peer, PeerRegistry};
pub use routing::{RoutingDecision, RoutingEngine};
pub use transport::{
    LinkTarget, MeshTransport, SelectorError, TransportError, TransportSelector, TransportType,
    SERVICE_ID,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors surfaced to callers of the mesh core
#[derive(Debug, Error)]
pub enum MeshError {
    /// Payload needs more fragments than allowed; shrink it
    #[error("Message too large: {0}")]
    MessageTooLarge(CodecError),
    /// Reassembly timed out; the partial message was discarded
    #[error("Incomplete message {0} discarded")]
    IncompleteMessage(MessageKey),
    /// Integrity check failed
    #[error("Authentication failed")]
    AuthFailure,
    /// No transport could carry the message
    #[error("No route to {0}")]
    NoRoute(LinkTarget),
    /// No live registry entry for the peer
    #[error("Peer unavailable: {0}")]
    PeerUnavailable(PeerId),
    #[error("Codec error: {0}")]
    Codec(CodecError),
    #[error("Security error: {0}")]
    Security(SecurityError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl From<CodecError> for MeshError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::MessageTooLarge { .. } => MeshError::MessageTooLarge(err),
            other => MeshError::Codec(other),
        }
    }
}

impl From<SecurityError> for MeshError {
    fn from(err: SecurityError) -> Self {
        match err {
            SecurityError::AuthFailure => MeshError::AuthFailure,
            other => MeshError::Security(other),
        }
    }
}

impl From<SelectorError> for MeshError {
    fn from(err: SelectorError) -> Self {
        match err {
            SelectorError::NoRoute(target) => MeshError::NoRoute(target),
            SelectorError::MessageTooLarge(e) => MeshError::MessageTooLarge(e),
        }
    }
}

impl From<SendError> for MeshError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::NoRoute(target) => MeshError::NoRoute(target),
            SendError::MessageTooLarge(e) => MeshError::MessageTooLarge(e),
        }
    }
}
