//! Framing: length-prefix (4 bytes LE) + bincode payload. One frame per datagram.

use crate::protocol::Message;

const LEN_SIZE: usize = 4;
/// Fits in a single UDP datagram on any LAN.
pub const MAX_FRAME_LEN: u32 = 8 * 1024;

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a message into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::Truncated);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::Truncated);
    }
    let msg: Message =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((msg, LEN_SIZE + len))
}

/// Error decoding a frame (short datagram, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("truncated frame")]
    Truncated,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::protocol::{PROTOCOL_VERSION, SERVICE_TYPE, UUID_PROPERTY};

    #[test]
    fn roundtrip_resolve_response() {
        let mut properties = BTreeMap::new();
        properties.insert(
            UUID_PROPERTY.to_string(),
            "6f1c2c1e-5d8e-4a8e-9a43-2f0b6a9b1f10".to_string(),
        );
        let msg = Message::resolve_response("kitchen", 45700, properties);
        let frame = encode_frame(&msg).unwrap();
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, msg);
        assert!(decoded.is_ours());
    }

    #[test]
    fn short_datagram_is_truncated() {
        let frame = encode_frame(&Message::announce("a", 1)).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::Truncated)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::Truncated)
        ));
    }

    #[test]
    fn oversized_length_rejected() {
        let mut frame = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        frame.extend_from_slice(&[0u8; 16]);
        assert!(matches!(decode_frame(&frame), Err(FrameDecodeError::TooLarge)));
        let huge = Message::announce(&"x".repeat(MAX_FRAME_LEN as usize), 1);
        assert!(matches!(encode_frame(&huge), Err(FrameEncodeError::TooLarge)));
    }

    #[test]
    fn foreign_service_is_not_ours() {
        let msg = Message::Goodbye {
            protocol_version: PROTOCOL_VERSION,
            service_type: "_other._tcp".into(),
            name: "x".into(),
        };
        assert!(!msg.is_ours());
        let old = Message::Query {
            protocol_version: PROTOCOL_VERSION + 1,
            service_type: SERVICE_TYPE.into(),
        };
        assert!(!old.is_ours());
    }
}
