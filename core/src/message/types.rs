// Message types: the logical unit the mesh moves between nodes

use crate::identity::PeerId;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::CodecError;

/// Current wire protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// What kind of message this is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Presence beacon sent to direct neighbours (0x01)
    Announce = 0x01,
    /// Reply to an announce (0x02)
    AnnounceAck = 0x02,
    /// Node is leaving the mesh (0x03)
    Leave = 0x03,
    /// Ask the mesh for a path to a destination (0x10)
    RouteRequest = 0x10,
    /// Answer to a route request (0x11)
    RouteReply = 0x11,
    /// Application payload (0x20)
    Data = 0x20,
    /// Acknowledgment of a reliable data message (0x21)
    DataAck = 0x21,
    /// Neighbourhood topology summary (0x30)
    TopologyInfo = 0x30,
    /// Services a node offers (0x31)
    CapabilityAdvertise = 0x31,
}

impl MessageType {
    /// Convert from the wire code
    pub fn from_u8(value: u8) -> Result<Self, CodecError> {
        match value {
            0x01 => Ok(MessageType::Announce),
            0x02 => Ok(MessageType::AnnounceAck),
            0x03 => Ok(MessageType::Leave),
            0x10 => Ok(MessageType::RouteRequest),
            0x11 => Ok(MessageType::RouteReply),
            0x20 => Ok(MessageType::Data),
            0x21 => Ok(MessageType::DataAck),
            0x30 => Ok(MessageType::TopologyInfo),
            0x31 => Ok(MessageType::CapabilityAdvertise),
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }

    /// Convert to the wire code
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Announce => "announce",
            MessageType::AnnounceAck => "announce-ack",
            MessageType::Leave => "leave",
            MessageType::RouteRequest => "route-request",
            MessageType::RouteReply => "route-reply",
            MessageType::Data => "data",
            MessageType::DataAck => "data-ack",
            MessageType::TopologyInfo => "topology-info",
            MessageType::CapabilityAdvertise => "capability-advertise",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Header flag bits. Bits 4-7 are reserved: written as zero, ignored on read.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MessageFlags: u8 {
        const ENCRYPTED = 0b0000_0001;
        const BROADCAST = 0b0000_0010;
        const PRIORITY  = 0b0000_0100;
        const RELIABLE  = 0b0000_1000;
    }
}

/// A complete (reassembled) mesh message.
///
/// `payload` is whatever travels on the wire: ciphertext when
/// `MessageFlags::ENCRYPTED` is set, plaintext otherwise. Per-fragment
/// fields live on [`super::Frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub version: u8,
    pub message_type: MessageType,
    /// Remaining hop budget
    pub ttl: u8,
    pub flags: MessageFlags,
    /// Per-source sequence number, wraps at u16::MAX
    pub sequence: u16,
    pub source_id: PeerId,
    /// `None` means broadcast
    pub destination_id: Option<PeerId>,
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a message addressed to every node in the mesh
    pub fn broadcast(
        message_type: MessageType,
        source_id: PeerId,
        sequence: u16,
        ttl: u8,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            ttl,
            flags: MessageFlags::BROADCAST,
            sequence,
            source_id,
            destination_id: None,
            payload,
        }
    }

    /// Create a message addressed to a single node
    pub fn unicast(
        message_type: MessageType,
        source_id: PeerId,
        destination_id: PeerId,
        sequence: u16,
        ttl: u8,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            ttl,
            flags: MessageFlags::empty(),
            sequence,
            source_id,
            destination_id: Some(destination_id),
            payload,
        }
    }

    /// Add flags (builder style)
    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination_id.is_none()
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags.contains(MessageFlags::ENCRYPTED)
    }

    pub fn is_reliable(&self) -> bool {
        self.flags.contains(MessageFlags::RELIABLE)
    }

    /// Dedup / reassembly key
    pub fn key(&self) -> MessageKey {
        MessageKey {
            source_id: self.source_id,
            sequence: self.sequence,
        }
    }
}

/// `(source_id, sequence)`: identifies one message across the whole mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKey {
    pub source_id: PeerId,
    pub sequence: u16,
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.source_id, self.sequence)
    }
}
