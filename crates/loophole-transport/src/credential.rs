//! Public-key credential used to authenticate the gateway session.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use pkcs8::DecodePrivateKey;

/// Identity credential: the ed25519 signing key plus its public half in the
/// wire form the registration API and the gateway both accept.
///
/// Created exactly once per process; the supervisor owns it and lends it to
/// the session on each (re)dial.
pub struct Credential {
    signing_key: SigningKey,
    public_key: String,
}

impl Credential {
    pub fn new(signing_key: SigningKey) -> Self {
        let public_key = BASE64.encode(signing_key.verifying_key().as_bytes());
        Self {
            signing_key,
            public_key,
        }
    }

    /// Parse a PKCS#8 ed25519 key document, decrypting when a passphrase is
    /// given.
    pub fn from_pkcs8_pem(pem: &str, passphrase: Option<&str>) -> Result<Self, pkcs8::Error> {
        let signing_key = match passphrase {
            Some(passphrase) => {
                SigningKey::from_pkcs8_encrypted_pem(pem, passphrase.as_bytes())?
            }
            None => SigningKey::from_pkcs8_pem(pem)?,
        };
        Ok(Self::new(signing_key))
    }

    /// Base64 of the raw 32-byte verifying key.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Sign a gateway challenge nonce. Raw nonce bytes, no prefix and no
    /// domain separator; the gateway verifies with `verify_strict`.
    pub fn sign(&self, nonce: &[u8]) -> Vec<u8> {
        self.signing_key.sign(nonce).to_bytes().to_vec()
    }
}

// The signing key never appears in logs.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("signing_key", &"[REDACTED]")
            .field("public_key", &self.public_key)
            .finish()
    }
}
