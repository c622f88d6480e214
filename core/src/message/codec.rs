// Wire codec: fragmentation on the way out, reassembly on the way in

use super::header::{Frame, FrameHeader, FRAME_OVERHEAD};
use super::reassembly::Reassembler;
use super::types::{Message, MessageFlags, MessageKey};
use super::CodecError;
use crate::config::CodecConfig;
use std::time::Instant;

/// Split a message into encoded frames that each fit `mtu` bytes.
///
/// All frames are built before anything is returned, so a message that needs
/// more than `max_fragments` chunks fails without producing a partial set.
pub fn encode_frames(
    message: &Message,
    mtu: usize,
    max_fragments: u8,
) -> Result<Vec<Vec<u8>>, CodecError> {
    if mtu <= FRAME_OVERHEAD {
        return Err(CodecError::MtuTooSmall(mtu));
    }
    let chunk_size = mtu - FRAME_OVERHEAD;

    let needed = if message.payload.is_empty() {
        1
    } else {
        (message.payload.len() + chunk_size - 1) / chunk_size
    };
    if needed > max_fragments as usize {
        return Err(CodecError::MessageTooLarge {
            payload_len: message.payload.len(),
            fragments: needed,
            max_fragments,
        });
    }
    let total = needed as u8;

    // Keep BROADCAST consistent with the destination field
    let mut flags = message.flags;
    flags.set(MessageFlags::BROADCAST, message.destination_id.is_none());

    let header = |index: u8| FrameHeader {
        version: message.version,
        message_type: message.message_type,
        ttl: message.ttl,
        flags,
        sequence: message.sequence,
        fragment_index: index,
        fragment_total: total,
    };

    if message.payload.is_empty() {
        let frame = Frame {
            header: header(0),
            source_id: message.source_id,
            destination_id: message.destination_id,
            chunk: Vec::new(),
        };
        return Ok(vec![frame.to_bytes()]);
    }

    Ok(message
        .payload
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, chunk)| {
            Frame {
                header: header(index as u8),
                source_id: message.source_id,
                destination_id: message.destination_id,
                chunk: chunk.to_vec(),
            }
            .to_bytes()
        })
        .collect())
}

/// Stateful codec for one inbound pipeline.
///
/// Owns the reassembly buffers; encoding is stateless and shared with
/// [`encode_frames`].
#[derive(Debug)]
pub struct WireCodec {
    config: CodecConfig,
    reassembler: Reassembler,
}

impl WireCodec {
    pub fn new(config: CodecConfig) -> Self {
        let reassembler = Reassembler::new(
            config.reassembly_timeout(),
            config.max_pending_reassemblies,
        );
        Self {
            config,
            reassembler,
        }
    }

    /// Encode for a transport advertising `mtu`, honouring the configured clamp
    pub fn encode(&self, message: &Message, mtu: usize) -> Result<Vec<Vec<u8>>, CodecError> {
        encode_frames(message, self.config.effective_mtu(mtu), self.config.max_fragments)
    }

    /// Decode one delivered frame.
    ///
    /// `frame` must be exactly the bytes the transport reported as valid.
    /// Returns `Ok(None)` while fragments are still missing.
    pub fn decode(&mut self, frame: &[u8], now: Instant) -> Result<Option<Message>, CodecError> {
        let frame = Frame::from_bytes(frame)?;
        if frame.header.fragment_total == 1 {
            let header = frame.header;
            return Ok(Some(Message {
                version: header.version,
                message_type: header.message_type,
                ttl: header.ttl,
                flags: header.flags,
                sequence: header.sequence,
                source_id: frame.source_id,
                destination_id: frame.destination_id,
                payload: frame.chunk,
            }));
        }
        Ok(self.reassembler.push(frame, now))
    }

    /// Reclaim reassembly buffers that timed out
    pub fn expire(&mut self, now: Instant) -> Vec<MessageKey> {
        self.reassembler.expire(now)
    }

    pub fn pending_reassemblies(&self) -> usize {
        self.reassembler.pending_count()
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerId;
    use crate::message::types::MessageType;
    use std::time::Duration;

    fn codec() -> WireCodec {
        WireCodec::new(CodecConfig::default())
    }

    fn message(payload: Vec<u8>) -> Message {
        Message::unicast(
            MessageType::Data,
            PeerId::from_bytes([1; 8]),
            PeerId::from_bytes([2; 8]),
            42,
            5,
            payload,
        )
    }

    #[test]
    fn test_single_frame_round_trip() {
        let mut c = codec();
        let msg = message(b"hello".to_vec());
        let frames = c.encode(&msg, 100).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), FRAME_OVERHEAD + 5);
        let decoded = c.decode(&frames[0], Instant::now()).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_empty_payload_is_one_frame() {
        let mut c = codec();
        let msg = message(Vec::new());
        let frames = c.encode(&msg, 64).unwrap();
        assert_eq!(frames.len(), 1);
        let decoded = c.decode(&frames[0], Instant::now()).unwrap().unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_fragments_fit_mtu() {
        let msg = message(vec![0xAB; 1000]);
        let frames = encode_frames(&msg, 64, 32).unwrap();
        // 64 - 24 = 40 bytes per chunk
        assert_eq!(frames.len(), 25);
        assert!(frames.iter().all(|f| f.len() <= 64));
    }

    #[test]
    fn test_reverse_order_reassembly() {
        let mut c = codec();
        let msg = message((0..=255u8).cycle().take(700).collect());
        let mut frames = c.encode(&msg, 100).unwrap();
        frames.reverse();
        let now = Instant::now();
        let mut out = None;
        for f in &frames {
            out = c.decode(f, now).unwrap();
        }
        assert_eq!(out.unwrap(), msg);
        assert_eq!(c.pending_reassemblies(), 0);
    }

    #[test]
    fn test_message_too_large_is_rejected() {
        let msg = message(vec![0; 41]);
        // 41 bytes need 2 chunks of 40, cap is 1
        let err = encode_frames(&msg, 64, 1).unwrap_err();
        assert!(matches!(
            err,
            CodecError::MessageTooLarge { fragments: 2, max_fragments: 1, .. }
        ));
    }

    #[test]
    fn test_mtu_too_small() {
        let msg = message(vec![1]);
        assert!(matches!(
            encode_frames(&msg, FRAME_OVERHEAD, 8),
            Err(CodecError::MtuTooSmall(_))
        ));
    }

    #[test]
    fn test_configured_frame_size_clamps_mtu() {
        let config = CodecConfig {
            max_frame_size: Some(64),
            ..CodecConfig::default()
        };
        let c = WireCodec::new(config);
        let frames = c.encode(&message(vec![7; 100]), 4096).unwrap();
        assert_eq!(frames.len(), 3);
    }

    #[test]
    fn test_trailing_padding_must_be_cut_by_transport() {
        let mut c = codec();
        let msg = message(b"abc".to_vec());
        let frame = c.encode(&msg, 100).unwrap().remove(0);
        let valid_len = frame.len();
        let mut padded = frame.clone();
        padded.extend_from_slice(&[0u8; 16]);
        let decoded = c
            .decode(&padded[..valid_len], Instant::now())
            .unwrap()
            .unwrap();
        assert_eq!(decoded.payload, b"abc");
    }

    #[test]
    fn test_expired_reassembly_starts_fresh() {
        let mut c = codec();
        let msg = message(vec![9; 120]);
        let frames = c.encode(&msg, 64).unwrap();
        assert_eq!(frames.len(), 3);

        let start = Instant::now();
        assert!(c.decode(&frames[0], start).unwrap().is_none());
        let expired = c.expire(start + Duration::from_secs(60));
        assert_eq!(expired, vec![msg.key()]);

        let later = start + Duration::from_secs(61);
        assert!(c.decode(&frames[1], later).unwrap().is_none());
        assert!(c.decode(&frames[2], later).unwrap().is_none());
        assert!(c.decode(&frames[0], later).unwrap().is_some());
    }

    #[test]
    fn test_broadcast_flag_follows_destination() {
        let mut c = codec();
        let mut msg = Message::broadcast(MessageType::Data, PeerId::from_bytes([3; 8]), 1, 2, vec![1]);
        msg.flags = MessageFlags::empty();
        let frames = c.encode(&msg, 64).unwrap();
        let decoded = c.decode(&frames[0], Instant::now()).unwrap().unwrap();
        assert!(decoded.flags.contains(MessageFlags::BROADCAST));
        assert!(decoded.destination_id.is_none());
    }
}
