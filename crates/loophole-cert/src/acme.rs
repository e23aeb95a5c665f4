//! ACME client: orders validated over the `acme-tls/1` ALPN.
//!
//! The validation connection arrives like any other public connection,
//! relayed through the gateway to the local TLS listener, which answers the
//! `acme-tls/1` handshake with a throwaway certificate carrying the ACME
//! identifier extension.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus, RetryPolicy,
};
use rustls::crypto::ring;
use rustls::pki_types::PrivateKeyDer;
use rustls::ServerConfig;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

use crate::provider::ChallengeSlot;

/// ALPN protocol name for the TLS-ALPN-01 challenge.
pub const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";

/// ACME errors
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("Account creation failed: {0}")]
    AccountCreationFailed(String),

    #[error("Order creation failed: {0}")]
    OrderCreationFailed(String),

    #[error("Challenge failed: {0}")]
    ChallengeFailed(String),

    #[error("Certificate finalization failed: {0}")]
    FinalizationFailed(String),

    #[error("TLS-ALPN-01 challenge not offered for domain: {0}")]
    TlsAlpnNotSupported(String),

    #[error("Authorization not found for domain: {0}")]
    AuthorizationNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Certificate generation error: {0}")]
    CertGen(String),

    #[error("Account not initialized")]
    AccountNotInitialized,
}

/// ACME client bound to one issuer directory and one account file.
pub struct AcmeClient {
    contact_email: String,
    use_staging: bool,
    cert_dir: PathBuf,
    account: Option<Account>,
}

impl AcmeClient {
    pub fn new(contact_email: String, use_staging: bool, cert_dir: PathBuf) -> Self {
        Self {
            contact_email,
            use_staging,
            cert_dir,
            account: None,
        }
    }

    /// Create or load the ACME account; credentials persist as
    /// `account.json` in the certificate directory.
    pub async fn init(&mut self) -> Result<(), AcmeError> {
        fs::create_dir_all(&self.cert_dir).await?;

        let account_path = self.cert_dir.join("account.json");

        let account = match fs::read_to_string(&account_path).await {
            Ok(creds_json) => {
                let creds: AccountCredentials = serde_json::from_str(&creds_json).map_err(|e| {
                    AcmeError::AccountCreationFailed(format!(
                        "Failed to parse account credentials: {}",
                        e
                    ))
                })?;

                let account = Account::builder()
                    .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?
                    .from_credentials(creds)
                    .await
                    .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?;

                debug!("ACME account loaded from {}", account_path.display());
                account
            }
            Err(_) => {
                let directory_url = if self.use_staging {
                    info!("Using the ACME staging environment");
                    LetsEncrypt::Staging.url().to_string()
                } else {
                    LetsEncrypt::Production.url().to_string()
                };

                let (account, creds) = Account::builder()
                    .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?
                    .create(
                        &NewAccount {
                            contact: &[&format!("mailto:{}", self.contact_email)],
                            terms_of_service_agreed: true,
                            only_return_existing: false,
                        },
                        directory_url,
                        None,
                    )
                    .await
                    .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?;

                let creds_json = serde_json::to_string_pretty(&creds).map_err(|e| {
                    AcmeError::AccountCreationFailed(format!(
                        "Failed to serialize account credentials: {}",
                        e
                    ))
                })?;
                fs::write(&account_path, creds_json).await?;

                info!("ACME account created and saved to {}", account_path.display());
                account
            }
        };

        self.account = Some(account);
        Ok(())
    }

    /// Order a certificate for `domain`, publishing the challenge handshake
    /// configuration into `slot` while the issuer validates.
    ///
    /// Returns `(certificate_chain_pem, private_key_pem)`.
    pub async fn order_certificate(
        &self,
        domain: &str,
        slot: &ChallengeSlot,
    ) -> Result<(String, String), AcmeError> {
        let account = self.account.as_ref().ok_or(AcmeError::AccountNotInitialized)?;

        info!("Requesting certificate for {}", domain);

        let identifiers = [Identifier::Dns(domain.to_string())];
        let new_order = NewOrder::new(&identifiers);
        let mut order = account
            .new_order(&new_order)
            .await
            .map_err(|e| AcmeError::OrderCreationFailed(e.to_string()))?;

        {
            let mut authorizations = order.authorizations();
            let mut authz = authorizations
                .next()
                .await
                .ok_or_else(|| AcmeError::AuthorizationNotFound(domain.to_string()))?
                .map_err(|e| {
                    AcmeError::OrderCreationFailed(format!("Failed to get authorization: {}", e))
                })?;

            match authz.status {
                AuthorizationStatus::Valid => {
                    debug!("Domain {} is already authorized", domain);
                }
                AuthorizationStatus::Pending => {
                    debug!("Domain {} authorization is pending", domain);
                }
                other => {
                    return Err(AcmeError::ChallengeFailed(format!(
                        "Authorization status is {:?}",
                        other
                    )));
                }
            }

            let mut challenge = authz
                .challenge(ChallengeType::TlsAlpn01)
                .ok_or_else(|| AcmeError::TlsAlpnNotSupported(domain.to_string()))?;

            let key_auth = challenge.key_authorization();
            let digest = Sha256::digest(key_auth.as_str().as_bytes());

            slot.publish(Arc::new(tls_alpn_challenge_config(domain, digest.as_slice())?));
            debug!("Challenge certificate published for {}", domain);

            challenge.set_ready().await.map_err(|e| {
                AcmeError::ChallengeFailed(format!("Failed to set challenge ready: {}", e))
            })?;
        }

        let retry_policy = RetryPolicy::new()
            .timeout(Duration::from_secs(120))
            .initial_delay(Duration::from_secs(2));

        let status = order.poll_ready(&retry_policy).await.map_err(|e| {
            slot.clear();
            AcmeError::ChallengeFailed(format!("Challenge verification failed: {}", e))
        })?;

        slot.clear();

        match status {
            OrderStatus::Ready => {
                debug!("Order for {} is ready for finalization", domain);
            }
            OrderStatus::Invalid => {
                return Err(AcmeError::ChallengeFailed(
                    "Order became invalid, challenge verification failed".to_string(),
                ));
            }
            other => {
                return Err(AcmeError::ChallengeFailed(format!(
                    "Unexpected order status: {:?}",
                    other
                )));
            }
        }

        let private_key_pem = order
            .finalize()
            .await
            .map_err(|e| AcmeError::FinalizationFailed(format!("Failed to finalize order: {}", e)))?;

        let cert_chain_pem = order.poll_certificate(&retry_policy).await.map_err(|e| {
            AcmeError::FinalizationFailed(format!("Failed to get certificate: {}", e))
        })?;

        info!("Certificate issued for {}", domain);

        Ok((cert_chain_pem, private_key_pem))
    }
}

/// Throwaway server config answering the `acme-tls/1` validation handshake:
/// a self-signed certificate for the domain carrying the ACME identifier
/// extension (the SHA-256 of the key authorization).
pub(crate) fn tls_alpn_challenge_config(
    domain: &str,
    key_auth_digest: &[u8],
) -> Result<ServerConfig, AcmeError> {
    let mut params = rcgen::CertificateParams::new(vec![domain.to_string()])
        .map_err(|e| AcmeError::CertGen(e.to_string()))?;
    params.custom_extensions = vec![rcgen::CustomExtension::new_acme_identifier(key_auth_digest)];

    let key_pair = rcgen::KeyPair::generate().map_err(|e| AcmeError::CertGen(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| AcmeError::CertGen(e.to_string()))?;

    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| AcmeError::CertGen(e.to_string()))?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| AcmeError::CertGen(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key)
        .map_err(|e| AcmeError::CertGen(e.to_string()))?;

    config.alpn_protocols = vec![ACME_TLS_ALPN_NAME.to_vec()];

    Ok(config)
}
