//! Frame header and address block
//!
//! Every frame on the wire is:
//!
//! ```text
//! [1] version  [1] type  [1] ttl  [1] flags  [2 BE] sequence  [1] fragment_index  [1] fragment_total
//! [8] source_id
//! [8] destination_id   (zeros when BROADCAST is set)
//! [N] payload chunk    (length implied by the radio delivery)
//! ```

use super::types::{MessageFlags, MessageType, PROTOCOL_VERSION};
use super::CodecError;
use crate::identity::{PeerId, PEER_ID_LEN};

/// Size of the fixed header in bytes
pub const HEADER_SIZE: usize = 8;

/// Size of the source/destination address block in bytes
pub const ADDRESS_BLOCK_SIZE: usize = 2 * PEER_ID_LEN;

/// Bytes of every frame that are not payload
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + ADDRESS_BLOCK_SIZE;

/// The fixed 8-byte header preceding every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub message_type: MessageType,
    pub ttl: u8,
    pub flags: MessageFlags,
    pub sequence: u16,
    pub fragment_index: u8,
    pub fragment_total: u8,
}

impl FrameHeader {
    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let seq = self.sequence.to_be_bytes();
        [
            self.version,
            self.message_type.as_u8(),
            self.ttl,
            self.flags.bits(),
            seq[0],
            seq[1],
            self.fragment_index,
            self.fragment_total,
        ]
    }

    /// Deserialize from bytes, validating version, type and fragment bounds
    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < HEADER_SIZE {
            return Err(CodecError::FrameTooShort {
                need: HEADER_SIZE,
                got: data.len(),
            });
        }

        let version = data[0];
        if version != PROTOCOL_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }

        let message_type = MessageType::from_u8(data[1])?;
        let fragment_index = data[6];
        let fragment_total = data[7];
        if fragment_total == 0 || fragment_index >= fragment_total {
            return Err(CodecError::InvalidFragment {
                index: fragment_index,
                total: fragment_total,
            });
        }

        Ok(Self {
            version,
            message_type,
            ttl: data[2],
            flags: MessageFlags::from_bits_truncate(data[3]),
            sequence: u16::from_be_bytes([data[4], data[5]]),
            fragment_index,
            fragment_total,
        })
    }
}

/// One frame: header, addresses and a payload chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub source_id: PeerId,
    pub destination_id: Option<PeerId>,
    pub chunk: Vec<u8>,
}

impl Frame {
    /// Serialize frame to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_OVERHEAD + self.chunk.len());
        buf.extend_from_slice(&self.header.to_bytes());
        buf.extend_from_slice(self.source_id.as_bytes());
        match self.destination_id {
            Some(dest) => buf.extend_from_slice(dest.as_bytes()),
            None => buf.extend_from_slice(&[0u8; PEER_ID_LEN]),
        }
        buf.extend_from_slice(&self.chunk);
        buf
    }

    /// Deserialize a frame.
    ///
    /// `data` must already be cut to the length the transport reported;
    /// everything after the address block is taken as payload.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        let header = FrameHeader::from_bytes(data)?;
        if data.len() < FRAME_OVERHEAD {
            return Err(CodecError::FrameTooShort {
                need: FRAME_OVERHEAD,
                got: data.len(),
            });
        }

        let source_id = PeerId::from_slice(&data[HEADER_SIZE..HEADER_SIZE + PEER_ID_LEN])
            .map_err(|_| CodecError::FrameTooShort {
                need: FRAME_OVERHEAD,
                got: data.len(),
            })?;
        let destination_id = if header.flags.contains(MessageFlags::BROADCAST) {
            None
        } else {
            let start = HEADER_SIZE + PEER_ID_LEN;
            Some(
                PeerId::from_slice(&data[start..FRAME_OVERHEAD]).map_err(|_| {
                    CodecError::FrameTooShort {
                        need: FRAME_OVERHEAD,
                        got: data.len(),
                    }
                })?,
            )
        };

        Ok(Self {
            header,
            source_id,
            destination_id,
            chunk: data[FRAME_OVERHEAD..].to_vec(),
        })
    }
}
