//! Mesh node: codec, envelope, registry, routing engine and transports
//! wired into one running participant.
//!
//! Tasks spawned by [`MeshNode::start`]:
//! - one inbound pipeline per transport (each owns its reassembly state)
//! - one discovery consumer per transport
//! - maintenance: peer liveness, dedup pruning
//! - announce: periodic link-local presence beacon
//!
//! The routing engine sits behind one mutex and the registry behind its own
//! lock. Neither is held while a transport sends.

pub mod acks;
mod pipeline;

use crate::config::MeshConfig;
use crate::crypto::{MeshKey, SecurityEnvelope};
use crate::identity::PeerId;
use crate::message::{CodecError, Message, MessageFlags, MessageKey, MessageType};
use crate::peers::{Peer, PeerRegistry};
use crate::routing::RoutingEngine;
use crate::transport::{
    LinkTarget, MeshTransport, SelectorError, TransportSelector, TransportType,
};
use crate::MeshError;
use acks::AckTracker;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Hop budget of announce, announce-ack, leave and capability beacons
const LINK_LOCAL_TTL: u8 = 1;

// ============================================================================
// PUBLIC TYPES
// ============================================================================

/// A message handed to the local application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub source_id: PeerId,
    /// `None` for broadcasts
    pub destination_id: Option<PeerId>,
    pub message_type: MessageType,
    pub sequence: u16,
    /// Hops left on arrival
    pub ttl: u8,
    pub priority: bool,
    /// Decrypted payload
    pub payload: Vec<u8>,
}

/// Notifications from a running node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Delivered(Delivery),
    PeerDiscovered(PeerId),
    PeerLost(PeerId),
}

/// Where an originated message went
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub key: MessageKey,
    /// Neighbours that accepted the message, with the transport used for each
    pub sent_to: Vec<(PeerId, TransportType)>,
}

/// Result of [`MeshNode::send_reliable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReliableOutcome {
    Acknowledged { attempts: u32 },
    Unacknowledged { attempts: u32 },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("No route to {0}")]
    NoRoute(LinkTarget),
    #[error(transparent)]
    MessageTooLarge(CodecError),
}

// ============================================================================
// SHARED STATE
// ============================================================================

/// State shared by the node handle and every task it spawns
struct NodeShared {
    local_id: PeerId,
    config: MeshConfig,
    envelope: SecurityEnvelope,
    registry: PeerRegistry,
    engine: Mutex<RoutingEngine>,
    selector: TransportSelector,
    acks: AckTracker,
    events: mpsc::Sender<NodeEvent>,
}

impl NodeShared {
    fn next_sequence(&self) -> u16 {
        self.engine.lock().next_sequence()
    }

    fn build(
        &self,
        destination: Option<PeerId>,
        message_type: MessageType,
        payload: Vec<u8>,
        flags: MessageFlags,
        ttl: u8,
        sequence: u16,
    ) -> Message {
        let message = match destination {
            Some(dest) => {
                Message::unicast(message_type, self.local_id, dest, sequence, ttl, payload)
            }
            None => Message::broadcast(message_type, self.local_id, sequence, ttl, payload),
        };
        message.with_flags(flags)
    }

    fn seal(&self, message: Message) -> Result<Message, SendError> {
        let payload_len = message.payload.len();
        self.envelope.seal_message(message).map_err(|e| {
            // Only reachable for payloads far past any fragment cap
            warn!("Failed to seal outgoing message: {}", e);
            let max_fragments = self.config.codec.max_fragments;
            SendError::MessageTooLarge(CodecError::MessageTooLarge {
                payload_len,
                fragments: max_fragments as usize + 1,
                max_fragments,
            })
        })
    }

    /// Seal, size-check and send a message this node originates
    async fn originate(
        &self,
        destination: Option<PeerId>,
        message_type: MessageType,
        payload: Vec<u8>,
        flags: MessageFlags,
        ttl: u8,
        sequence: u16,
    ) -> Result<SendReceipt, SendError> {
        let target = destination.map_or(LinkTarget::Broadcast, LinkTarget::Peer);
        let message = self.build(destination, message_type, payload, flags, ttl, sequence);
        let sealed = self.seal(message)?;

        // Too large for every transport: fail before anything is sent
        self.selector
            .check_size(&sealed)
            .map_err(SendError::MessageTooLarge)?;

        let now = Instant::now();
        let neighbours = self.registry.live_peers(now);
        let targets = self.engine.lock().originate(&sealed, &neighbours, now);
        if targets.is_empty() {
            debug!("No live neighbours for {}", sealed.key());
            return Err(SendError::NoRoute(target));
        }

        let (sent_to, failures) = self.dispatch(&sealed, &targets).await;
        if sent_to.is_empty() {
            return Err(undelivered(target, failures));
        }
        debug!(
            "Originated {} {} to {} ({} of {} neighbours)",
            message_type,
            sealed.key(),
            target,
            sent_to.len(),
            targets.len()
        );
        Ok(SendReceipt {
            key: sealed.key(),
            sent_to,
        })
    }

    /// Send to each target in turn. A failed peer never stops the rest.
    async fn dispatch(
        &self,
        message: &Message,
        targets: &[PeerId],
    ) -> (Vec<(PeerId, TransportType)>, Vec<SelectorError>) {
        let mut sent = Vec::with_capacity(targets.len());
        let mut failures = Vec::new();
        for &peer in targets {
            match self.selector.send(message, LinkTarget::Peer(peer)).await {
                Ok(kind) => sent.push((peer, kind)),
                Err(e) => {
                    warn!("Send of {} to {} failed: {}", message.key(), peer, e);
                    failures.push(e);
                }
            }
        }
        (sent, failures)
    }

    /// Broadcast a control message to direct neighbours on every transport
    async fn broadcast_link_local(
        &self,
        message_type: MessageType,
        payload: Vec<u8>,
    ) -> Vec<TransportType> {
        let sequence = self.next_sequence();
        let message = self.build(
            None,
            message_type,
            payload,
            MessageFlags::empty(),
            LINK_LOCAL_TTL,
            sequence,
        );
        match self.seal(message) {
            Ok(sealed) => self.selector.broadcast_all(&sealed).await,
            Err(_) => Vec::new(),
        }
    }

    async fn announce(&self) -> Vec<TransportType> {
        let carried = self
            .broadcast_link_local(MessageType::Announce, Vec::new())
            .await;
        if !self.config.node.capabilities.is_empty() {
            self.advertise_capabilities().await;
        }
        carried
    }

    async fn advertise_capabilities(&self) -> Vec<TransportType> {
        match bincode::serialize(&self.config.node.capabilities) {
            Ok(payload) => {
                self.broadcast_link_local(MessageType::CapabilityAdvertise, payload)
                    .await
            }
            Err(e) => {
                warn!("Failed to encode capabilities: {}", e);
                Vec::new()
            }
        }
    }

    fn emit(&self, event: NodeEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Event queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Why nothing was sent: too large for every transport that reaches the
/// targets, or no route at all
fn undelivered(target: LinkTarget, failures: Vec<SelectorError>) -> SendError {
    let mut too_large = None;
    for failure in failures {
        match failure {
            SelectorError::MessageTooLarge(e) => {
                too_large.get_or_insert(e);
            }
            SelectorError::NoRoute(_) => return SendError::NoRoute(target),
        }
    }
    too_large.map_or(SendError::NoRoute(target), SendError::MessageTooLarge)
}

// ============================================================================
// MESH NODE
// ============================================================================

/// One participant in the mesh
pub struct MeshNode {
    shared: Arc<NodeShared>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshNode {
    /// Build a node over `transports`.
    ///
    /// Transports are ordered by `config.node.transport_priority`; any whose
    /// type is not listed there is ignored. Events arrive on the returned
    /// receiver once [`start`](Self::start) has been called.
    pub fn new(
        config: MeshConfig,
        local_id: PeerId,
        mesh_key: MeshKey,
        transports: Vec<Arc<dyn MeshTransport>>,
    ) -> Result<(Self, mpsc::Receiver<NodeEvent>), MeshError> {
        config.validate()?;

        let (events, rx) = mpsc::channel(config.node.event_buffer);
        let selector = TransportSelector::new(
            transports,
            &config.node.transport_priority,
            config.codec.clone(),
        );
        info!(
            "Mesh node {} on mesh {} (transports: {:?})",
            local_id,
            mesh_key.fingerprint_hex(),
            selector.priority()
        );

        let shared = NodeShared {
            local_id,
            envelope: SecurityEnvelope::new(mesh_key, config.security.require_encryption),
            registry: PeerRegistry::new(local_id, config.peers.clone()),
            engine: Mutex::new(RoutingEngine::new(local_id, config.routing.clone())),
            selector,
            acks: AckTracker::new(),
            events,
            config,
        };

        Ok((
            Self {
                shared: Arc::new(shared),
                running: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            },
            rx,
        ))
    }

    /// Start transports and spawn the node's tasks. Must be called from
    /// within a tokio runtime. Calling it on a running node does nothing.
    pub async fn start(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Mesh node {} already running", self.shared.local_id);
            return;
        }

        let shared = &self.shared;
        let mut tasks = Vec::new();
        for transport in shared.selector.transports() {
            let kind = transport.transport_type();
            if let Err(e) = transport.start().await {
                warn!("{} transport failed to start: {}", kind, e);
            }
            // Subscribe before spawning so nothing sent meanwhile is missed
            let frames = transport.receive();
            let discovery = transport.discover();
            tasks.push(tokio::spawn(pipeline::run_inbound(shared.clone(), kind, frames)));
            tasks.push(tokio::spawn(pipeline::run_discovery(
                shared.clone(),
                kind,
                discovery,
            )));
        }
        tasks.push(tokio::spawn(pipeline::run_maintenance(shared.clone())));
        if let Some(period) = shared.config.node.announce_interval() {
            tasks.push(tokio::spawn(pipeline::run_announce(shared.clone(), period)));
        }

        let mut current = self.tasks.lock();
        if !self.running.load(Ordering::Acquire) {
            // Shut down while transports were starting
            for task in tasks {
                task.abort();
            }
            return;
        }
        info!(
            "Mesh node {} started ({} tasks)",
            shared.local_id,
            tasks.len()
        );
        current.extend(tasks);
    }

    /// Send `leave`, stop every task and transport
    pub async fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            let carried = self
                .shared
                .broadcast_link_local(MessageType::Leave, Vec::new())
                .await;
            debug!("Leave sent via {:?}", carried);
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
        for transport in self.shared.selector.transports() {
            if let Err(e) = transport.stop().await {
                warn!("{} transport failed to stop: {}", transport.transport_type(), e);
            }
        }
        info!("Mesh node {} shut down", self.shared.local_id);
    }

    /// Originate a message.
    ///
    /// `destination: None` broadcasts. The payload is sealed under the mesh
    /// key, checked against the fragment budget, then sent to the destination
    /// directly if it is a live neighbour, or to every live neighbour
    /// otherwise. Fails with `MessageTooLarge` when every transport that
    /// reaches the targets is too small for it.
    pub async fn send(
        &self,
        destination: Option<PeerId>,
        message_type: MessageType,
        payload: Vec<u8>,
        priority: bool,
    ) -> Result<SendReceipt, SendError> {
        let mut flags = MessageFlags::empty();
        if priority {
            flags |= MessageFlags::PRIORITY;
        }
        let sequence = self.shared.next_sequence();
        self.shared
            .originate(
                destination,
                message_type,
                payload,
                flags,
                self.shared.config.routing.default_ttl,
                sequence,
            )
            .await
    }

    /// Send a reliable `data` message and wait for its `data-ack`.
    ///
    /// Each retransmission carries a fresh sequence number; the wait for
    /// every attempt ends after `ack_timeout`.
    pub async fn send_reliable(
        &self,
        destination: PeerId,
        payload: Vec<u8>,
    ) -> Result<ReliableOutcome, SendError> {
        let shared = &self.shared;
        let attempts = shared.config.node.max_retransmissions + 1;

        for attempt in 1..=attempts {
            let sequence = shared.next_sequence();
            // Register first so an immediate ack is not missed
            let ack = shared.acks.register(sequence, destination);

            if let Err(e) = shared
                .originate(
                    Some(destination),
                    MessageType::Data,
                    payload.clone(),
                    MessageFlags::RELIABLE,
                    shared.config.routing.default_ttl,
                    sequence,
                )
                .await
            {
                shared.acks.cancel(sequence);
                return Err(e);
            }

            match tokio::time::timeout(shared.config.node.ack_timeout(), ack).await {
                Ok(Ok(())) => {
                    debug!("{} acknowledged #{} on attempt {}", destination, sequence, attempt);
                    return Ok(ReliableOutcome::Acknowledged { attempts: attempt });
                }
                _ => {
                    shared.acks.cancel(sequence);
                    debug!(
                        "No ack for #{} from {} (attempt {}/{})",
                        sequence, destination, attempt, attempts
                    );
                }
            }
        }

        warn!("{} never acknowledged after {} attempts", destination, attempts);
        Ok(ReliableOutcome::Unacknowledged { attempts })
    }

    /// Broadcast a presence beacon to direct neighbours now
    pub async fn announce(&self) -> Vec<TransportType> {
        self.shared.announce().await
    }

    /// Tell direct neighbours what this node offers
    pub async fn advertise_capabilities(&self) -> Vec<TransportType> {
        self.shared.advertise_capabilities().await
    }

    /// Live neighbour by id
    pub fn peer(&self, peer_id: &PeerId) -> Result<Peer, MeshError> {
        let now = Instant::now();
        match self.shared.registry.get(peer_id) {
            Some(peer) if self.shared.registry.is_live(peer_id, now) => Ok(peer),
            _ => Err(MeshError::PeerUnavailable(*peer_id)),
        }
    }

    /// Snapshot of known neighbours, ordered by id
    pub fn peers(&self) -> Vec<Peer> {
        self.shared.registry.list_peers()
    }

    pub fn local_id(&self) -> PeerId {
        self.shared.local_id
    }

    pub fn config(&self) -> &MeshConfig {
        &self.shared.config
    }

    pub fn transport_priority(&self) -> Vec<TransportType> {
        self.shared.selector.priority()
    }

    pub fn pending_acks(&self) -> usize {
        self.shared.acks.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for MeshNode {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LocalMedium, LocalTransport};
    use std::time::Duration;

    fn id(b: u8) -> PeerId {
        PeerId::from_bytes([b; 8])
    }

    fn key() -> MeshKey {
        MeshKey::from_bytes([7; 32])
    }

    fn quiet_config() -> MeshConfig {
        let mut config = MeshConfig::default();
        config.node.announce_interval_secs = 0;
        config.node.ack_timeout_ms = 200;
        config.node.max_retransmissions = 1;
        config
    }

    fn node(
        medium: &LocalMedium,
        b: u8,
        config: MeshConfig,
    ) -> (MeshNode, Arc<LocalTransport>, mpsc::Receiver<NodeEvent>) {
        let transport = Arc::new(medium.transport(id(b)));
        let (node, rx) = MeshNode::new(
            config,
            id(b),
            key(),
            vec![transport.clone() as Arc<dyn MeshTransport>],
        )
        .unwrap();
        (node, transport, rx)
    }

    async fn next_matching<F>(rx: &mut mpsc::Receiver<NodeEvent>, mut pred: F) -> NodeEvent
    where
        F: FnMut(&NodeEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let medium = LocalMedium::new();
        let mut config = MeshConfig::default();
        config.routing.dedup_capacity = 0;
        let transport: Arc<dyn MeshTransport> = Arc::new(medium.transport(id(1)));

        assert!(matches!(
            MeshNode::new(config, id(1), key(), vec![transport]),
            Err(MeshError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unicast_delivery_between_neighbours() {
        let medium = LocalMedium::new();
        let (a, _ta, mut rx_a) = node(&medium, 1, quiet_config());
        let (b, _tb, mut rx_b) = node(&medium, 2, quiet_config());
        medium.link(id(1), id(2));
        a.start().await;
        b.start().await;

        next_matching(&mut rx_a, |e| *e == NodeEvent::PeerDiscovered(id(2))).await;

        let receipt = a
            .send(Some(id(2)), MessageType::Data, b"hello".to_vec(), true)
            .await
            .unwrap();
        assert_eq!(receipt.sent_to, vec![(id(2), TransportType::Local)]);

        let event = next_matching(&mut rx_b, |e| matches!(e, NodeEvent::Delivered(_))).await;
        let NodeEvent::Delivered(delivery) = event else {
            unreachable!()
        };
        assert_eq!(delivery.source_id, id(1));
        assert_eq!(delivery.payload, b"hello");
        assert!(delivery.priority);
        assert_eq!(delivery.sequence, receipt.key.sequence);
    }

    #[tokio::test]
    async fn test_send_without_neighbours_is_no_route() {
        let medium = LocalMedium::new();
        let (a, _ta, _rx) = node(&medium, 1, quiet_config());
        a.start().await;

        assert_eq!(
            a.send(None, MessageType::Data, b"x".to_vec(), false).await,
            Err(SendError::NoRoute(LinkTarget::Broadcast))
        );
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected_before_sending() {
        let medium = LocalMedium::new();
        let mut config = quiet_config();
        config.codec.max_fragments = 2;
        let (a, _ta, mut rx_a) = node(&medium, 1, config);
        let (_b, _tb, _rx_b) = node(&medium, 2, quiet_config());
        medium.link(id(1), id(2));
        a.start().await;
        next_matching(&mut rx_a, |e| *e == NodeEvent::PeerDiscovered(id(2))).await;

        let result = a
            .send(Some(id(2)), MessageType::Data, vec![0; 4096], false)
            .await;
        assert!(matches!(
            result,
            Err(SendError::MessageTooLarge(CodecError::MessageTooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn test_reliable_send_is_acknowledged() {
        let medium = LocalMedium::new();
        let (a, _ta, mut rx_a) = node(&medium, 1, quiet_config());
        let (b, _tb, mut rx_b) = node(&medium, 2, quiet_config());
        medium.link(id(1), id(2));
        a.start().await;
        b.start().await;
        next_matching(&mut rx_a, |e| *e == NodeEvent::PeerDiscovered(id(2))).await;
        next_matching(&mut rx_b, |e| *e == NodeEvent::PeerDiscovered(id(1))).await;

        let outcome = a.send_reliable(id(2), b"important".to_vec()).await.unwrap();
        assert_eq!(outcome, ReliableOutcome::Acknowledged { attempts: 1 });
        assert_eq!(a.pending_acks(), 0);
    }

    #[tokio::test]
    async fn test_reliable_send_gives_up() {
        let medium = LocalMedium::new();
        let (a, _ta, mut rx_a) = node(&medium, 1, quiet_config());
        // Peer radio exists but its node never runs, so nothing acks
        let _silent = medium.transport(id(2));
        medium.link(id(1), id(2));
        a.start().await;
        next_matching(&mut rx_a, |e| *e == NodeEvent::PeerDiscovered(id(2))).await;

        let outcome = a.send_reliable(id(2), b"lost".to_vec()).await.unwrap();
        assert_eq!(outcome, ReliableOutcome::Unacknowledged { attempts: 2 });
        assert_eq!(a.pending_acks(), 0);
    }

    #[tokio::test]
    async fn test_leave_removes_peer() {
        let medium = LocalMedium::new();
        let (a, _ta, mut rx_a) = node(&medium, 1, quiet_config());
        let (b, _tb, mut rx_b) = node(&medium, 2, quiet_config());
        medium.link(id(1), id(2));
        a.start().await;
        b.start().await;
        next_matching(&mut rx_a, |e| *e == NodeEvent::PeerDiscovered(id(2))).await;
        next_matching(&mut rx_b, |e| *e == NodeEvent::PeerDiscovered(id(1))).await;
        assert!(a.peer(&id(2)).is_ok());

        b.shutdown().await;
        next_matching(&mut rx_a, |e| *e == NodeEvent::PeerLost(id(2))).await;
        assert!(matches!(
            a.peer(&id(2)),
            Err(MeshError::PeerUnavailable(_))
        ));
        assert!(!b.is_running());
    }

    #[tokio::test]
    async fn test_concurrent_start_spawns_once() {
        let medium = LocalMedium::new();
        let (a, _ta, _rx) = node(&medium, 1, quiet_config());

        tokio::join!(a.start(), a.start());
        // inbound, discovery, maintenance
        assert_eq!(a.tasks.lock().len(), 3);
        assert!(a.is_running());

        a.start().await;
        assert_eq!(a.tasks.lock().len(), 3);

        a.shutdown().await;
        assert!(!a.is_running());
        assert!(a.tasks.lock().is_empty());

        // Restartable after shutdown
        a.start().await;
        assert_eq!(a.tasks.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_capabilities_reach_neighbour() {
        let medium = LocalMedium::new();
        let mut config = quiet_config();
        config.node.capabilities = vec!["relay".into(), "storage".into()];
        let (a, _ta, mut rx_a) = node(&medium, 1, config);
        let (b, _tb, mut rx_b) = node(&medium, 2, quiet_config());
        medium.link(id(1), id(2));
        a.start().await;
        b.start().await;
        next_matching(&mut rx_a, |e| *e == NodeEvent::PeerDiscovered(id(2))).await;
        next_matching(&mut rx_b, |e| *e == NodeEvent::PeerDiscovered(id(1))).await;

        assert_eq!(a.advertise_capabilities().await, vec![TransportType::Local]);
        let event = next_matching(&mut rx_b, |e| {
            matches!(e, NodeEvent::Delivered(d) if d.message_type == MessageType::CapabilityAdvertise)
        })
        .await;
        assert!(matches!(event, NodeEvent::Delivered(_)));
        assert_eq!(
            b.peer(&id(1)).unwrap().capabilities,
            vec!["relay".to_string(), "storage".to_string()]
        );
    }
}
