//! Access/refresh token persistence and the OAuth flows that feed it.
//!
//! Tokens live in `~/.loophole/tokens.json`. The registration client reads
//! the access token on demand and asks for a refresh when the API answers
//! 401; the `login` command runs the device-authorization grant to mint the
//! initial pair.

mod oauth;
mod store;

pub use oauth::{poll_for_token, register_device, DeviceCodeGrant};
pub use store::{AuthError, TokenPair, TokenStore};
