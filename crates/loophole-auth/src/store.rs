//! On-disk token store

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::oauth::{self, OAuthErrorBody};

/// Authentication and token-store errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Failed to resolve the home directory")]
    NoHome,

    #[error("There was a problem reading the tokens file: {0}")]
    Read(std::io::Error),

    #[error("There was a problem writing the tokens file: {0}")]
    Write(std::io::Error),

    #[error("There was a problem removing the tokens file: {0}")]
    Remove(std::io::Error),

    #[error("There was a problem decoding tokens: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("The session expired, please reinitialize the login")]
    ReinitializeLogin,

    #[error("Request to the authorization server failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unexpected response from authorization server: {0}")]
    UnexpectedResponse(String),
}

/// The token document persisted at `~/.loophole/tokens.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub id_token: String,
    pub token_type: String,
    pub expires_in: u64,
}

/// Reads and rewrites the per-user token document.
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    /// Store rooted at `~/.loophole`.
    pub fn at_default_location() -> Result<Self, AuthError> {
        let home = dirs::home_dir().ok_or(AuthError::NoHome)?;
        Ok(Self::at(home.join(".loophole")))
    }

    /// Store rooted at an explicit directory.
    pub fn at(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join("tokens.json"),
        }
    }

    /// True iff the token file exists.
    pub fn is_present(&self) -> bool {
        self.path.exists()
    }

    /// Atomic overwrite: write a sibling temp file, fix its mode to 0644,
    /// then rename over the destination.
    pub fn save(&self, pair: &TokenPair) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(AuthError::Write)?;
        }

        let encoded = serde_json::to_vec(pair)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &encoded).map_err(AuthError::Write)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o644))
                .map_err(AuthError::Write)?;
        }

        std::fs::rename(&tmp, &self.path).map_err(AuthError::Write)?;
        debug!("Tokens saved to {}", self.path.display());
        Ok(())
    }

    /// Read and decode the whole document.
    pub fn read(&self) -> Result<TokenPair, AuthError> {
        let raw = std::fs::read(&self.path).map_err(AuthError::Read)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn access_token(&self) -> Result<String, AuthError> {
        Ok(self.read()?.access_token)
    }

    pub fn refresh_token(&self) -> Result<String, AuthError> {
        Ok(self.read()?.refresh_token)
    }

    /// Remove the token file. Missing files are fine; a file that exists but
    /// cannot be removed is not.
    pub fn delete(&self) -> Result<(), AuthError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AuthError::Remove(err)),
        }
    }

    /// Exchange the stored refresh token for a fresh access token at the
    /// default authorization server.
    pub async fn refresh(&self) -> Result<(), AuthError> {
        self.refresh_with(oauth::TOKEN_URL, oauth::CLIENT_ID).await
    }

    /// Refresh against an explicit token endpoint.
    ///
    /// The stored refresh token is never discarded: when the issuer omits
    /// one from the response, the previous value is carried forward.
    pub async fn refresh_with(&self, token_url: &str, client_id: &str) -> Result<(), AuthError> {
        let refresh_token = self.refresh_token()?;

        let client = reqwest::Client::new();
        let response = client
            .post(token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", client_id),
                ("refresh_token", &refresh_token),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            let mut pair: TokenPair = serde_json::from_str(&body)?;
            if pair.refresh_token.is_empty() {
                pair.refresh_token = refresh_token;
            }
            self.save(&pair)?;
            debug!("Token refresh succeeded");
            Ok(())
        } else if status.is_client_error() {
            let error: OAuthErrorBody = serde_json::from_str(&body)?;
            // The server historically spells this error token wrong; accept
            // both forms and flag the broken one when it shows up.
            if error.error == "invalid_grand" {
                warn!("Authorization server sent the misspelled 'invalid_grand' error token");
            }
            debug!(
                "Token refresh rejected: {} ({})",
                error.error, error.error_description
            );
            match error.error.as_str() {
                "expired_token" | "invalid_grand" | "invalid_grant" | "access_denied" => {
                    Err(AuthError::ReinitializeLogin)
                }
                _ => Err(AuthError::UnexpectedResponse(body)),
            }
        } else {
            Err(AuthError::UnexpectedResponse(body))
        }
    }
}
