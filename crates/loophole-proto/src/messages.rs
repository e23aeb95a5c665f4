//! Protocol message types

use serde::{Deserialize, Serialize};

/// Stream identifier, allocated by the gateway per public connection.
pub type StreamId = u32;

/// Stream id reserved for control messages.
pub const CONTROL_STREAM_ID: StreamId = 0;

/// Main gateway protocol message enum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum GatewayMessage {
    // Handshake (client → gateway → client)
    Hello {
        site_id: String,
        public_key: String,
    },
    Challenge {
        #[serde(with = "serde_bytes")]
        nonce: Vec<u8>,
    },
    Authenticate {
        #[serde(with = "serde_bytes")]
        signature: Vec<u8>,
    },
    Welcome,
    Denied {
        reason: String,
    },

    // Remote listener management
    ListenRequest {
        /// Gateway-side bind address. Meaningful to the gateway only: it
        /// maps public hostname traffic onto this logical listener.
        bind_addr: String,
    },
    ListenOk,
    ListenError {
        reason: String,
    },

    // Logical streams (one per accepted public connection)
    StreamOpen {
        stream_id: StreamId,
    },
    StreamData {
        stream_id: StreamId,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    StreamClose {
        stream_id: StreamId,
    },

    // Keepalive
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
}

impl GatewayMessage {
    /// Stream this message belongs to (control messages map to stream 0).
    pub fn stream_id(&self) -> StreamId {
        match self {
            GatewayMessage::StreamOpen { stream_id }
            | GatewayMessage::StreamData { stream_id, .. }
            | GatewayMessage::StreamClose { stream_id } => *stream_id,
            _ => CONTROL_STREAM_ID,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_messages_map_to_the_control_stream() {
        assert_eq!(GatewayMessage::Welcome.stream_id(), CONTROL_STREAM_ID);
        assert_eq!(
            GatewayMessage::Ping { timestamp: 1 }.stream_id(),
            CONTROL_STREAM_ID
        );
        assert_eq!(GatewayMessage::StreamClose { stream_id: 7 }.stream_id(), 7);
    }
}
