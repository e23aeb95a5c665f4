//! On-disk certificate cache

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::Certificate;

/// Certificate cache errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Failed to parse certificate material: {0}")]
    Parse(String),
}

/// Sidecar document describing a cached certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertMetadata {
    pub domain: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl CertMetadata {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Within 30 days of expiry.
    pub fn needs_renewal(&self) -> bool {
        Utc::now() > self.expires_at - chrono::Duration::days(30)
    }

    pub fn days_until_expiry(&self) -> i64 {
        (self.expires_at - Utc::now()).num_days()
    }
}

/// Long-lived certificate material under the per-user cache directory:
/// `<domain>.crt`, `<domain>.key` and a `<domain>.json` metadata sidecar.
/// The ACME account credentials (`account.json`) live alongside.
pub struct CertStore {
    dir: PathBuf,
}

impl CertStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn paths(&self, domain: &str) -> (PathBuf, PathBuf, PathBuf) {
        (
            self.dir.join(format!("{}.crt", domain)),
            self.dir.join(format!("{}.key", domain)),
            self.dir.join(format!("{}.json", domain)),
        )
    }

    /// Load a cached certificate, or `None` when any piece is missing.
    pub async fn load(&self, domain: &str) -> Result<Option<(Certificate, CertMetadata)>, StoreError> {
        let (cert_path, key_path, meta_path) = self.paths(domain);

        let meta_raw = match fs::read(&meta_path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let metadata: CertMetadata = serde_json::from_slice(&meta_raw)?;

        let cert_pem = match fs::read(&cert_path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let key_pem = match fs::read(&key_path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let certificate = parse_pem_pair(&cert_pem, &key_pem)?;
        debug!(
            "Loaded cached certificate for {} ({} days to expiry)",
            domain,
            metadata.days_until_expiry()
        );

        Ok(Some((certificate, metadata)))
    }

    /// Persist freshly issued PEM material plus its metadata sidecar.
    pub async fn save(
        &self,
        domain: &str,
        cert_pem: &str,
        key_pem: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Certificate, StoreError> {
        fs::create_dir_all(&self.dir).await?;

        let (cert_path, key_path, meta_path) = self.paths(domain);
        fs::write(&cert_path, cert_pem).await?;
        fs::write(&key_path, key_pem).await?;

        let metadata = CertMetadata {
            domain: domain.to_string(),
            expires_at,
            created_at: Utc::now(),
        };
        fs::write(&meta_path, serde_json::to_vec(&metadata)?).await?;

        debug!("Certificate for {} saved to {}", domain, self.dir.display());

        parse_pem_pair(cert_pem.as_bytes(), key_pem.as_bytes())
    }
}

fn parse_pem_pair(cert_pem: &[u8], key_pem: &[u8]) -> Result<Certificate, StoreError> {
    let cert_chain = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StoreError::Parse(format!("certificate chain: {}", e)))?;

    if cert_chain.is_empty() {
        return Err(StoreError::Parse("no certificates in file".to_string()));
    }

    let private_key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| StoreError::Parse(format!("private key: {}", e)))?
        .ok_or_else(|| StoreError::Parse("no private key in file".to_string()))?;

    Ok(Certificate {
        cert_chain,
        private_key,
    })
}
