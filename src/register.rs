//! Site registration against the loophole API.
//!
//! Claims (or reclaims) a public hostname bound to the current public key.
//! The result code mirrors HTTP status; 600 and 601 are produced locally
//! when no usable token is available at all.

use loophole_auth::{AuthError, TokenStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const API_URL: &str = "https://api.loophole.cloud";

const TOKEN_URL: &str = "https://owlsome.eu.auth0.com/oauth/token";
const CLIENT_ID: &str = "R569dcCOUErjw1xVZOzqc7OUCiGTYNqN";

/// Result code for "no token file exists".
pub const NOT_LOGGED_IN: i32 = 600;
/// Result code for "token file exists but is unusable".
pub const TOKEN_UNREADABLE: i32 = 601;

/// Outcome of a registration attempt.
///
/// After the first success, the site identifier is sticky: reconnects within
/// the process present the same identifier instead of re-registering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteSpecification {
    pub site_id: String,
    pub result_code: i32,
    pub message: Option<String>,
}

/// Registration transport failures. API-level rejections travel inside
/// [`SiteSpecification::result_code`] instead.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Undecodable registration response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Auth(#[from] AuthError),
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    public_key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<&'a str>,
}

#[derive(Deserialize)]
struct RegisterResponse {
    site_id: String,
    #[serde(default)]
    message: Option<String>,
}

/// Client for the registration endpoint.
pub struct RegistrationClient {
    api_url: String,
    token_url: String,
    client_id: String,
}

impl RegistrationClient {
    pub fn new() -> Self {
        Self::with_endpoints(API_URL, TOKEN_URL, CLIENT_ID)
    }

    pub fn with_endpoints(api_url: &str, token_url: &str, client_id: &str) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            token_url: token_url.to_string(),
            client_id: client_id.to_string(),
        }
    }

    /// Register `public_key` (optionally under a requested hostname).
    ///
    /// On 401 the access token is refreshed exactly once and the call
    /// retried exactly once; a second 401 is returned to the caller.
    pub async fn register(
        &self,
        tokens: &TokenStore,
        public_key: &str,
        requested_site_id: Option<&str>,
    ) -> Result<SiteSpecification, RegistrationError> {
        if !tokens.is_present() {
            return Ok(SiteSpecification {
                site_id: String::new(),
                result_code: NOT_LOGGED_IN,
                message: Some("no stored login".to_string()),
            });
        }

        let access_token = match tokens.access_token() {
            Ok(token) => token,
            Err(err) => {
                debug!("Stored token unusable: {}", err);
                return Ok(SiteSpecification {
                    site_id: String::new(),
                    result_code: TOKEN_UNREADABLE,
                    message: Some(err.to_string()),
                });
            }
        };

        let spec = self
            .post_registration(&access_token, public_key, requested_site_id)
            .await?;

        if spec.result_code != 401 {
            return Ok(spec);
        }

        debug!("Registration unauthorized, trying to refresh the token");
        tokens.refresh_with(&self.token_url, &self.client_id).await?;

        let access_token = tokens.access_token()?;
        self.post_registration(&access_token, public_key, requested_site_id)
            .await
    }

    async fn post_registration(
        &self,
        access_token: &str,
        public_key: &str,
        requested_site_id: Option<&str>,
    ) -> Result<SiteSpecification, RegistrationError> {
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/site", self.api_url))
            .bearer_auth(access_token)
            .json(&RegisterRequest {
                public_key,
                hostname: requested_site_id,
            })
            .send()
            .await?;

        let result_code = response.status().as_u16() as i32;
        let body = response.text().await?;

        if (200..300).contains(&result_code) {
            let parsed: RegisterResponse = serde_json::from_str(&body)?;
            debug!("Registered site {}", parsed.site_id);
            Ok(SiteSpecification {
                site_id: parsed.site_id,
                result_code,
                message: parsed.message,
            })
        } else {
            debug!("Registration rejected with status {}", result_code);
            Ok(SiteSpecification {
                site_id: String::new(),
                result_code,
                message: Some(body),
            })
        }
    }
}

impl Default for RegistrationClient {
    fn default() -> Self {
        Self::new()
    }
}
