// Node tasks: inbound frames, discovery, maintenance and announce
//
// Inbound order per frame:
//   decode -> open (auth) -> replay screen -> route -> deliver / forward
// The engine lock covers only the replay screen and the routing decision.

use super::acks::{decode_ack, encode_ack};
use super::{Delivery, NodeEvent, NodeShared, LINK_LOCAL_TTL};
use crate::crypto::SecurityError;
use crate::identity::PeerId;
use crate::message::{Message, MessageFlags, MessageType, WireCodec};
use crate::peers::{LinkInfo, PeerEvent};
use crate::transport::{DiscoveryEvent, DiscoveryStream, FrameStream, InboundFrame, TransportType};
use crate::MeshError;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Signal assumed for a neighbour learned from its announce rather than a sighting
const ANNOUNCED_SIGNAL: i32 = -80;

pub(super) async fn run_inbound(shared: Arc<NodeShared>, kind: TransportType, mut frames: FrameStream) {
    let mut codec = WireCodec::new(shared.config.codec.clone());
    let mut sweep = interval(shared.config.node.maintenance_interval());
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(frame) => shared.handle_frame(kind, &mut codec, frame).await,
                None => {
                    info!("{} receive stream ended", kind);
                    break;
                }
            },
            _ = sweep.tick() => {
                for key in codec.expire(Instant::now()) {
                    debug!("{} on {}", MeshError::IncompleteMessage(key), kind);
                }
            }
        }
    }
}

pub(super) async fn run_discovery(shared: Arc<NodeShared>, kind: TransportType, mut events: DiscoveryStream) {
    while let Some(event) = events.next().await {
        shared.handle_discovery(kind, event);
    }
    info!("{} discovery stream ended", kind);
}

pub(super) async fn run_maintenance(shared: Arc<NodeShared>) {
    let mut ticker = interval(shared.config.node.maintenance_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let now = Instant::now();

        shared.emit_peer_events(shared.registry.evict_stale(now));

        let pruned = shared.engine.lock().prune(now);
        if pruned > 0 {
            debug!("Pruned {} dedup entries", pruned);
        }
    }
}

pub(super) async fn run_announce(shared: Arc<NodeShared>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let carried = shared.announce().await;
        if carried.is_empty() {
            debug!("Announce not carried by any transport");
        }
    }
}

impl NodeShared {
    async fn handle_frame(&self, kind: TransportType, codec: &mut WireCodec, frame: InboundFrame) {
        let now = Instant::now();
        self.registry.touch(&frame.from, now);

        let message = match codec.decode(&frame.data, now) {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(e) => {
                debug!("Dropping frame from {} on {}: {}", frame.from, kind, e);
                return;
            }
        };

        if message.source_id == self.local_id {
            debug!("Dropping echo of own {}", message.key());
            return;
        }

        let plaintext = match self.envelope.open_message(&message) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                debug!("Dropping {} from {}: {}", message.key(), frame.from, e);
                return;
            }
        };

        let neighbours = self.registry.live_peers(now);
        let decision = {
            let mut engine = self.engine.lock();
            if engine.has_seen(&message.key(), now) {
                debug!("{}", SecurityError::Replay(message.key()));
                return;
            }
            engine.route(&message, Some(frame.from), &neighbours, now)
        };

        if decision.delivers() {
            self.handle_local(kind, frame.from, &message, plaintext).await;
        }

        if let Some(forward) = decision.forward() {
            debug!(
                "Forwarding {} (ttl {}) to {} peers by {:?}",
                forward.message.key(),
                forward.message.ttl,
                forward.targets.len(),
                forward.strategy
            );
            let (sent, _) = self.dispatch(&forward.message, &forward.targets).await;
            if sent.len() < forward.targets.len() {
                debug!(
                    "Forwarded {} to {} of {} peers",
                    forward.message.key(),
                    sent.len(),
                    forward.targets.len()
                );
            }
        }
    }

    /// Act on a message addressed to this node (or broadcast)
    async fn handle_local(
        &self,
        kind: TransportType,
        from: PeerId,
        message: &Message,
        plaintext: Vec<u8>,
    ) {
        let source = message.source_id;

        match message.message_type {
            MessageType::Announce => {
                self.learn_neighbour(kind, from, message);
                let sequence = self.next_sequence();
                if let Err(e) = self
                    .originate(
                        Some(source),
                        MessageType::AnnounceAck,
                        Vec::new(),
                        MessageFlags::empty(),
                        LINK_LOCAL_TTL,
                        sequence,
                    )
                    .await
                {
                    debug!("Announce-ack to {} not sent: {}", source, e);
                }
            }
            MessageType::AnnounceAck => {
                debug!("Announce-ack from {}", source);
                self.learn_neighbour(kind, from, message);
            }
            MessageType::Leave => {
                self.emit_peer_events(self.registry.on_lost(&source).into_iter().collect());
            }
            MessageType::DataAck => match decode_ack(&plaintext) {
                Some(sequence) => {
                    if self.acks.resolve(source, sequence) {
                        debug!("{} acknowledged #{}", source, sequence);
                    }
                }
                None => debug!("Malformed data-ack from {}", source),
            },
            MessageType::CapabilityAdvertise => {
                match bincode::deserialize::<Vec<String>>(&plaintext) {
                    Ok(capabilities) => {
                        if !self.registry.update_capabilities(&source, capabilities) {
                            debug!("Capabilities from non-neighbour {}", source);
                        }
                    }
                    Err(e) => debug!("Malformed capability advertisement from {}: {}", source, e),
                }
                self.deliver(message, plaintext);
            }
            MessageType::Data => {
                let wants_ack =
                    message.is_reliable() && message.destination_id == Some(self.local_id);
                self.deliver(message, plaintext);
                if wants_ack {
                    self.acknowledge(message).await;
                }
            }
            MessageType::RouteRequest | MessageType::RouteReply | MessageType::TopologyInfo => {
                self.deliver(message, plaintext);
            }
        }
    }

    /// Re-admit a direct neighbour the registry no longer knows, e.g. after a
    /// liveness eviction while its radio link stayed up.
    fn learn_neighbour(&self, kind: TransportType, from: PeerId, message: &Message) {
        if message.source_id != from || message.ttl != LINK_LOCAL_TTL {
            return;
        }
        if self.registry.get(&from).is_some() {
            return;
        }
        let link = LinkInfo::new(format!("{}:{}", kind, from), ANNOUNCED_SIGNAL);
        debug!("{} re-admitted {} from its announce", kind, from);
        self.emit_peer_events(self.registry.on_discovered(from, link, Instant::now()));
    }

    fn emit_peer_events(&self, events: Vec<PeerEvent>) {
        for event in events {
            match event {
                PeerEvent::Discovered(peer) => self.emit(NodeEvent::PeerDiscovered(peer.peer_id)),
                PeerEvent::Lost(peer_id) => self.emit(NodeEvent::PeerLost(peer_id)),
            }
        }
    }

    async fn acknowledge(&self, message: &Message) {
        let sequence = self.next_sequence();
        let result = self
            .originate(
                Some(message.source_id),
                MessageType::DataAck,
                encode_ack(message.sequence),
                MessageFlags::empty(),
                self.config.routing.default_ttl,
                sequence,
            )
            .await;
        if let Err(e) = result {
            warn!("Could not acknowledge {}: {}", message.key(), e);
        }
    }

    fn deliver(&self, message: &Message, payload: Vec<u8>) {
        self.emit(NodeEvent::Delivered(Delivery {
            source_id: message.source_id,
            destination_id: message.destination_id,
            message_type: message.message_type,
            sequence: message.sequence,
            ttl: message.ttl,
            priority: message.flags.contains(MessageFlags::PRIORITY),
            payload,
        }));
    }

    fn handle_discovery(&self, kind: TransportType, event: DiscoveryEvent) {
        let now = Instant::now();
        match event {
            DiscoveryEvent::Sighted {
                peer_id,
                link_address,
                signal_strength,
            } => {
                let link = LinkInfo::new(link_address, signal_strength);
                let events = self.registry.on_discovered(peer_id, link, now);
                if !events.is_empty() {
                    debug!("{} sighted new peer {}", kind, peer_id);
                }
                self.emit_peer_events(events);
            }
            DiscoveryEvent::LinkQuality {
                peer_id,
                signal_strength,
                queue_depth,
            } => {
                if self
                    .registry
                    .update_link_quality(&peer_id, signal_strength, queue_depth)
                {
                    self.registry.touch(&peer_id, now);
                } else {
                    debug!("Link quality for unknown peer {} on {}", peer_id, kind);
                }
            }
            DiscoveryEvent::Lost { peer_id } => {
                let still_reachable = self
                    .selector
                    .transports()
                    .iter()
                    .any(|t| t.can_reach(&peer_id));
                if still_reachable {
                    debug!("{} lost {}, still reachable elsewhere", kind, peer_id);
                    return;
                }
                self.emit_peer_events(self.registry.on_lost(&peer_id).into_iter().collect());
            }
        }
    }
}
