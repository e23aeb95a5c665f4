//! Codec for encoding/decoding gateway messages

use crate::messages::GatewayMessage;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Gateway message codec
///
/// Format: `[length: u32 BE][payload: bincode serialized message]`
pub struct GatewayCodec;

impl GatewayCodec {
    /// Maximum message size (16MB)
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

    /// Encode a gateway message to bytes
    pub fn encode(msg: &GatewayMessage) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a gateway message from the front of `buf`.
    ///
    /// Returns `Ok(Some(message))` if a complete message was decoded,
    /// `Ok(None)` if more data is needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<GatewayMessage>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let msg_bytes = buf.split_to(length);
        let msg: GatewayMessage = bincode::deserialize(&msg_bytes)?;

        Ok(Some(msg))
    }

    /// Decode every complete message currently buffered.
    pub fn decode_all(buf: &mut BytesMut) -> Result<Vec<GatewayMessage>, CodecError> {
        let mut messages = Vec::new();

        while let Some(msg) = Self::decode(buf)? {
            messages.push(msg);
        }

        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let msg = GatewayMessage::Ping { timestamp: 12345 };

        let encoded = GatewayCodec::encode(&msg).unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());

        let decoded = GatewayCodec::decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(msg));
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_decode_incomplete() {
        let msg = GatewayMessage::Welcome;
        let encoded = GatewayCodec::encode(&msg).unwrap();

        // Only provide the length header
        let mut buf = BytesMut::from(&encoded[..4]);
        let result = GatewayCodec::decode(&mut buf).unwrap();
        assert_eq!(result, None);

        // Provide the rest of the message
        buf.extend_from_slice(&encoded[4..]);
        let result = GatewayCodec::decode(&mut buf).unwrap();
        assert_eq!(result, Some(msg));
    }

    #[test]
    fn test_decode_multiple() {
        let msg1 = GatewayMessage::Ping { timestamp: 111 };
        let msg2 = GatewayMessage::Pong { timestamp: 222 };

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&GatewayCodec::encode(&msg1).unwrap());
        buf.extend_from_slice(&GatewayCodec::encode(&msg2).unwrap());

        let messages = GatewayCodec::decode_all(&mut buf).unwrap();
        assert_eq!(messages, vec![msg1, msg2]);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_stream_data_round_trip() {
        let msg = GatewayMessage::StreamData {
            stream_id: 42,
            data: vec![1, 2, 3, 4, 5, 6, 7, 8],
        };

        let encoded = GatewayCodec::encode(&msg).unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());

        match GatewayCodec::decode(&mut buf).unwrap() {
            Some(GatewayMessage::StreamData { stream_id, data }) => {
                assert_eq!(stream_id, 42);
                assert_eq!(data, vec![1, 2, 3, 4, 5, 6, 7, 8]);
            }
            other => panic!("Expected StreamData, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(u32::MAX).to_be_bytes());
        buf.extend_from_slice(&[0u8; 16]);

        assert!(matches!(
            GatewayCodec::decode(&mut buf),
            Err(CodecError::MessageTooLarge(_))
        ));
    }
}
