//! Lazy certificate provider for the public hostname.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use rustls::crypto::ring;
use rustls::ServerConfig;
use thiserror::Error;
use tracing::info;

use crate::acme::AcmeClient;
use crate::store::CertStore;
use crate::{AcmeError, Certificate, StoreError};

/// Certificate provider errors
#[derive(Debug, Error)]
pub enum CertError {
    #[error("ACME error: {0}")]
    Acme(#[from] AcmeError),

    #[error("Certificate store error: {0}")]
    Store(#[from] StoreError),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Hand-off point for the TLS-ALPN-01 challenge: the ACME order publishes a
/// handshake config here and the local TLS server serves it to `acme-tls/1`
/// connections while validation is in flight.
#[derive(Default)]
pub struct ChallengeSlot {
    inner: RwLock<Option<Arc<ServerConfig>>>,
}

impl ChallengeSlot {
    pub fn publish(&self, config: Arc<ServerConfig>) {
        *self.inner.write().unwrap() = Some(config);
    }

    pub fn clear(&self) {
        *self.inner.write().unwrap() = None;
    }

    pub fn current(&self) -> Option<Arc<ServerConfig>> {
        self.inner.read().unwrap().clone()
    }
}

/// Serves TLS configurations for exactly one whitelisted hostname, acquiring
/// the certificate on first use and caching it on disk afterwards.
///
/// Acquisition may block the first request; later handshakes reuse the
/// cached certificate until it enters the renewal window.
pub struct CertificateProvider {
    domain: String,
    contact_email: String,
    store: CertStore,
    challenge: ChallengeSlot,
    current: RwLock<Option<Arc<ServerConfig>>>,
    acquiring: tokio::sync::Mutex<()>,
}

impl CertificateProvider {
    /// Provider for `<site>.<gateway_domain>` with cache under `cache_dir`.
    pub fn new(site_id: &str, gateway_domain: &str, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            domain: format!("{}.{}", site_id, gateway_domain),
            contact_email: format!("{}@loophole.main.dev", site_id),
            store: CertStore::new(cache_dir),
            challenge: ChallengeSlot::default(),
            current: RwLock::new(None),
            acquiring: tokio::sync::Mutex::new(()),
        }
    }

    /// Provider pinned to an existing configuration. The ACME path and the
    /// disk cache are never touched.
    pub fn with_preloaded(domain: impl Into<String>, config: Arc<ServerConfig>) -> Self {
        Self {
            domain: domain.into(),
            contact_email: String::new(),
            store: CertStore::new(PathBuf::new()),
            challenge: ChallengeSlot::default(),
            current: RwLock::new(Some(config)),
            acquiring: tokio::sync::Mutex::new(()),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn contact_email(&self) -> &str {
        &self.contact_email
    }

    /// Only the assigned public hostname is served.
    pub fn is_whitelisted(&self, host: &str) -> bool {
        self.domain.eq_ignore_ascii_case(host)
    }

    /// Challenge handshake config, when an ACME validation is in flight.
    pub fn challenge_config(&self) -> Option<Arc<ServerConfig>> {
        self.challenge.current()
    }

    /// TLS configuration for the whitelisted host, acquiring the certificate
    /// first when the cache is empty or due for renewal.
    pub async fn server_config(&self) -> Result<Arc<ServerConfig>, CertError> {
        if let Some(config) = self.current.read().unwrap().clone() {
            return Ok(config);
        }

        // Single-flight: concurrent first connections wait for one order.
        let _guard = self.acquiring.lock().await;
        if let Some(config) = self.current.read().unwrap().clone() {
            return Ok(config);
        }

        if let Some((certificate, metadata)) = self.store.load(&self.domain).await? {
            if !metadata.needs_renewal() {
                let config = server_config_from(certificate)?;
                *self.current.write().unwrap() = Some(config.clone());
                return Ok(config);
            }
            info!(
                "Cached certificate for {} is due for renewal ({} days to expiry)",
                self.domain,
                metadata.days_until_expiry()
            );
        }

        let mut acme = AcmeClient::new(
            self.contact_email.clone(),
            false,
            self.store.dir().to_path_buf(),
        );
        acme.init().await?;

        let (cert_pem, key_pem) = acme.order_certificate(&self.domain, &self.challenge).await?;

        // ACME issuers hand out 90-day certificates.
        let expires_at = Utc::now() + chrono::Duration::days(90);
        let certificate = self
            .store
            .save(&self.domain, &cert_pem, &key_pem, expires_at)
            .await?;

        let config = server_config_from(certificate)?;
        *self.current.write().unwrap() = Some(config.clone());
        Ok(config)
    }
}

fn server_config_from(certificate: Certificate) -> Result<Arc<ServerConfig>, CertError> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(CertError::Tls)?
        .with_no_client_auth()
        .with_single_cert(certificate.cert_chain, certificate.private_key)
        .map_err(CertError::Tls)?;

    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preloaded_config() -> Arc<ServerConfig> {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let params =
            rcgen::CertificateParams::new(vec!["abc123.loophole.site".to_string()]).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        let key = rustls::pki_types::PrivateKeyDer::try_from(key_pair.serialize_der()).unwrap();
        let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert.der().clone()], key)
            .unwrap();

        Arc::new(config)
    }

    #[test]
    fn whitelist_is_exactly_the_assigned_hostname() {
        let provider = CertificateProvider::new("abc123", "loophole.site", "/tmp/unused");

        assert_eq!(provider.domain(), "abc123.loophole.site");
        assert_eq!(provider.contact_email(), "abc123@loophole.main.dev");
        assert!(provider.is_whitelisted("abc123.loophole.site"));
        assert!(provider.is_whitelisted("ABC123.loophole.site"));
        assert!(!provider.is_whitelisted("other.loophole.site"));
        assert!(!provider.is_whitelisted("loophole.site"));
    }

    #[tokio::test]
    async fn preloaded_config_skips_acquisition() {
        let config = preloaded_config();
        let provider = CertificateProvider::with_preloaded("abc123.loophole.site", config.clone());

        let served = provider.server_config().await.unwrap();
        assert!(Arc::ptr_eq(&served, &config));
    }

    #[test]
    fn challenge_slot_publish_and_clear() {
        let slot = ChallengeSlot::default();
        assert!(slot.current().is_none());

        slot.publish(preloaded_config());
        assert!(slot.current().is_some());

        slot.clear();
        assert!(slot.current().is_none());
    }
}
