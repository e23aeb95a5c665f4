//! Wire protocol spoken between the loophole client and the gateway.
//!
//! The session carries length-prefixed bincode messages over the encrypted
//! transport. Control messages (handshake, listener management, keepalive)
//! and per-stream data share one framing layer; streams are identified by a
//! `StreamId` allocated by the gateway when a public connection arrives.

mod codec;
mod messages;

pub use codec::{CodecError, GatewayCodec};
pub use messages::{GatewayMessage, StreamId, CONTROL_STREAM_ID};
