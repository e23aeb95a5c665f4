//! Loophole exposes a locally-running HTTP service to the public internet
//! through an outbound-initiated, end-to-end TLS-encrypted tunnel.

pub mod acceptor;
pub mod config;
pub mod identity;
pub mod proxy;
pub mod register;
pub mod supervisor;
pub mod terminal;
