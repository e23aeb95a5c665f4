//! TLS certificates for the public hostname.
//!
//! Certificates come from an ACME issuer on demand: the first TLS handshake
//! for the whitelisted host triggers an order validated over the
//! `acme-tls/1` ALPN, and the result is cached on disk under the per-user
//! certificate directory until it nears expiry.

mod acme;
mod provider;
mod store;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

pub use acme::{AcmeClient, AcmeError, ACME_TLS_ALPN_NAME};
pub use provider::{CertError, CertificateProvider, ChallengeSlot};
pub use store::{CertMetadata, CertStore, StoreError};

/// A parsed certificate chain with its private key.
pub struct Certificate {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}
