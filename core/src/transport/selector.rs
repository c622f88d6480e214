//! Transport selector: fixed priority order with per-send fallthrough
//!
//! For every send the transports are walked in priority order. A transport
//! is skipped when it is unavailable, cannot reach the target, or has an MTU
//! too small for the message. The first one that accepts every frame wins;
//! a send error falls through to the next. Nothing is cached between sends.

use super::abstraction::{LinkTarget, MeshTransport, TransportType};
use crate::config::CodecConfig;
use crate::message::{encode_frames, CodecError, Message};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("No transport could reach {0}")]
    NoRoute(LinkTarget),
    #[error(transparent)]
    MessageTooLarge(CodecError),
}

pub struct TransportSelector {
    /// Transports in priority order
    transports: Vec<Arc<dyn MeshTransport>>,
    codec: CodecConfig,
}

impl TransportSelector {
    /// Order `transports` by `priority`. Transports whose type is not listed
    /// are dropped.
    pub fn new(
        transports: Vec<Arc<dyn MeshTransport>>,
        priority: &[TransportType],
        codec: CodecConfig,
    ) -> Self {
        let mut ordered = Vec::with_capacity(transports.len());
        for kind in priority {
            ordered.extend(
                transports
                    .iter()
                    .filter(|t| t.transport_type() == *kind)
                    .cloned(),
            );
        }
        for t in &transports {
            if !priority.contains(&t.transport_type()) {
                warn!("Transport {} not in priority list, ignoring", t.transport_type());
            }
        }
        Self {
            transports: ordered,
            codec,
        }
    }

    /// Send `message` to `target`, returning the transport that carried it
    pub async fn send(
        &self,
        message: &Message,
        target: LinkTarget,
    ) -> Result<TransportType, SelectorError> {
        let mut too_large: Option<CodecError> = None;
        let mut attempted = false;

        for transport in &self.transports {
            let kind = transport.transport_type();

            if !transport.is_available().await {
                debug!("{} unavailable, skipping", kind);
                continue;
            }
            if let LinkTarget::Peer(peer) = target {
                if !transport.can_reach(&peer) {
                    debug!("{} cannot reach {}, skipping", kind, peer);
                    continue;
                }
            }

            let mtu = self.codec.effective_mtu(transport.mtu());
            let frames = match encode_frames(message, mtu, self.codec.max_fragments) {
                Ok(frames) => frames,
                Err(e) => {
                    debug!("{} cannot carry {}: {}", kind, message.key(), e);
                    too_large.get_or_insert(e);
                    continue;
                }
            };

            attempted = true;
            match send_all(transport.as_ref(), target, &frames).await {
                Ok(()) => {
                    debug!(
                        "Sent {} to {} via {} ({} frames)",
                        message.key(),
                        target,
                        kind,
                        frames.len()
                    );
                    return Ok(kind);
                }
                Err(e) => {
                    warn!("Send of {} to {} via {} failed: {}", message.key(), target, kind, e);
                }
            }
        }

        match too_large {
            Some(e) if !attempted => Err(SelectorError::MessageTooLarge(e)),
            _ => Err(SelectorError::NoRoute(target)),
        }
    }

    /// Broadcast `message` on every available transport.
    ///
    /// Used for link-local control traffic (announce, leave) that must reach
    /// neighbours on every radio, not just the preferred one. Returns the
    /// transports that carried it.
    pub async fn broadcast_all(&self, message: &Message) -> Vec<TransportType> {
        let mut carried = Vec::new();
        for transport in &self.transports {
            let kind = transport.transport_type();
            if !transport.is_available().await {
                continue;
            }
            let mtu = self.codec.effective_mtu(transport.mtu());
            let frames = match encode_frames(message, mtu, self.codec.max_fragments) {
                Ok(frames) => frames,
                Err(e) => {
                    debug!("{} cannot carry {}: {}", kind, message.key(), e);
                    continue;
                }
            };
            match send_all(transport.as_ref(), LinkTarget::Broadcast, &frames).await {
                Ok(()) => carried.push(kind),
                Err(e) => warn!("Broadcast of {} via {} failed: {}", message.key(), kind, e),
            }
        }
        carried
    }

    /// Largest effective MTU over all transports
    pub fn max_mtu(&self) -> Option<usize> {
        self.transports
            .iter()
            .map(|t| self.codec.effective_mtu(t.mtu()))
            .max()
    }

    /// Check that `message` fits on at least one transport
    pub fn check_size(&self, message: &Message) -> Result<(), CodecError> {
        let mut last_err = None;
        for t in &self.transports {
            match encode_frames(message, self.codec.effective_mtu(t.mtu()), self.codec.max_fragments) {
                Ok(_) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn transports(&self) -> &[Arc<dyn MeshTransport>] {
        &self.transports
    }

    pub fn priority(&self) -> Vec<TransportType> {
        self.transports.iter().map(|t| t.transport_type()).collect()
    }
}

async fn send_all(
    transport: &dyn MeshTransport,
    target: LinkTarget,
    frames: &[Vec<u8>],
) -> Result<(), super::TransportError> {
    for frame in frames {
        transport.send(target, frame).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerId;
    use crate::message::MessageType;
    use crate::transport::local::{LocalMedium, LocalTransport};

    fn id(b: u8) -> PeerId {
        PeerId::from_bytes([b; 8])
    }

    fn message(len: usize) -> Message {
        Message::unicast(MessageType::Data, id(1), id(2), 1, 3, vec![0; len])
    }

    #[tokio::test]
    async fn test_selector_uses_first_reachable() {
        let medium = LocalMedium::new();
        let a = Arc::new(medium.transport(id(1)));
        let _b = medium.transport(id(2));
        medium.link(id(1), id(2));

        let selector = TransportSelector::new(
            vec![a.clone() as Arc<dyn MeshTransport>],
            &[TransportType::WiFiAware, TransportType::BLE, TransportType::Local],
            CodecConfig::default(),
        );
        assert_eq!(selector.priority(), vec![TransportType::Local]);
        assert_eq!(
            selector.send(&message(10), LinkTarget::Peer(id(2))).await,
            Ok(TransportType::Local)
        );
    }

    #[tokio::test]
    async fn test_no_route_when_unreachable() {
        let medium = LocalMedium::new();
        let a: Arc<dyn MeshTransport> = Arc::new(medium.transport(id(1)));
        let selector =
            TransportSelector::new(vec![a], &[TransportType::Local], CodecConfig::default());
        assert_eq!(
            selector.send(&message(10), LinkTarget::Peer(id(9))).await,
            Err(SelectorError::NoRoute(LinkTarget::Peer(id(9))))
        );
    }

    #[tokio::test]
    async fn test_too_large_everywhere() {
        let medium = LocalMedium::new();
        let a: Arc<dyn MeshTransport> = Arc::new(LocalTransport::new(medium.clone(), id(1)).with_mtu(64));
        let _b = medium.transport(id(2));
        medium.link(id(1), id(2));

        let codec = CodecConfig {
            max_fragments: 2,
            ..CodecConfig::default()
        };
        let selector = TransportSelector::new(vec![a], &[TransportType::Local], codec);
        // 64 - 24 = 40 bytes per fragment, 2 fragments max
        assert!(selector.check_size(&message(80)).is_ok());
        assert!(selector.check_size(&message(81)).is_err());
        assert!(matches!(
            selector.send(&message(81), LinkTarget::Peer(id(2))).await,
            Err(SelectorError::MessageTooLarge(_))
        ));
        assert_eq!(selector.max_mtu(), Some(64));
    }

    #[tokio::test]
    async fn test_broadcast_all_skips_unavailable() {
        let medium = LocalMedium::new();
        let a = Arc::new(medium.transport(id(1)));
        let _b = medium.transport(id(2));
        medium.link(id(1), id(2));

        let selector = TransportSelector::new(
            vec![a.clone() as Arc<dyn MeshTransport>],
            &[TransportType::Local],
            CodecConfig::default(),
        );
        let announce = Message::broadcast(MessageType::Announce, id(1), 7, 1, Vec::new());
        assert_eq!(selector.broadcast_all(&announce).await, vec![TransportType::Local]);

        a.set_available(false);
        assert!(selector.broadcast_all(&announce).await.is_empty());
    }
}
