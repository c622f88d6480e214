//! Wire codec: framing, fragmentation and reassembly
//!
//! Layers, outermost first:
//! 1. Frame: fixed 8-byte header + 16-byte address block + payload chunk
//! 2. Reassembly: fragment sets keyed by (source_id, sequence)
//! 3. Message: the complete logical unit handed to the security envelope

pub mod codec;
pub mod header;
pub mod reassembly;
pub mod types;

pub use codec::{encode_frames, WireCodec};
pub use header::{Frame, FrameHeader, ADDRESS_BLOCK_SIZE, FRAME_OVERHEAD, HEADER_SIZE};
pub use reassembly::Reassembler;
pub use types::{Message, MessageFlags, MessageKey, MessageType, PROTOCOL_VERSION};

use thiserror::Error;

/// Wire codec errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Message too large: {payload_len} bytes need {fragments} fragments (max {max_fragments})")]
    MessageTooLarge {
        payload_len: usize,
        fragments: usize,
        max_fragments: u8,
    },

    #[error("MTU of {0} bytes cannot carry a frame")]
    MtuTooSmall(usize),

    #[error("Frame too short: need {need} bytes, got {got}")]
    FrameTooShort { need: usize, got: usize },

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    #[error("Invalid fragment {index} of {total}")]
    InvalidFragment { index: u8, total: u8 },
}
