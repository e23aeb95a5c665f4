//! Authenticated encrypted transport session to the loophole gateway.
//!
//! The client dials the gateway over TLS, proves ownership of its site by
//! signing a server-issued nonce with the identity key, then asks the
//! gateway to open a remote listener. Public connections accepted on the
//! gateway side arrive here as logical streams multiplexed over the single
//! TLS connection.

mod credential;
mod session;
mod tls;

pub use credential::Credential;
pub use session::{
    dial_with_retry, AcceptError, GatewaySession, RemoteListener, RemoteStream,
    RemoteStreamReader, RemoteStreamWriter, SessionError, DIAL_ATTEMPTS, DIAL_RETRY_DELAY,
};
