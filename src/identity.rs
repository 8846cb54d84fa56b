//! Bearer-token identity resolution.
//!
//! The process-wide secret is stretched into an Ed25519 key once, when the
//! [`TokenAuthority`] is built, and never changes afterwards.  A token is
//! `base64url(claims) "." base64url(signature)` where `claims` is the JSON
//! object `{sub, iat, exp}` and the signature covers the raw claim bytes.

use crate::canonical::Clock;
use crate::model::Identity;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64URL, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey, SECRET_KEY_LENGTH};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const BEARER_PREFIX: &str = "Bearer ";

/// Maps a presented credential to a stable identity.
pub trait IdentityResolver: Send + Sync {
    /// Resolves an `Authorization` header value such as `Bearer <token>`.
    fn resolve(&self, authorization: &str) -> Result<Identity, AuthError>;
}

/// Authentication failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No credential was presented.
    #[error("missing authorization")]
    Missing,
    /// The header is not `Bearer <token>` or the token lacks its two parts.
    #[error("invalid token format")]
    Format,
    /// Base64 or JSON decoding failed.
    #[error("token decode error: {0}")]
    Decode(String),
    /// The signature does not match the claims.
    #[error("invalid token")]
    BadSignature,
    /// `exp` is in the past.
    #[error("token expired")]
    Expired,
    /// The subject is not a valid identity.
    #[error("token subject is not a valid identity")]
    Subject,
    /// The configured secret is unusable.
    #[error("token secret must not be empty")]
    EmptySecret,
}

/// Claims carried by a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Identity the token was issued to.
    pub sub: String,
    /// Issue time, Unix seconds.
    pub iat: i64,
    /// Expiry, Unix seconds.
    pub exp: i64,
}

/// Issues and validates bearer tokens with a key derived from one secret.
pub struct TokenAuthority {
    signing: SigningKey,
    verifying: VerifyingKey,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl TokenAuthority {
    /// Derives the signing key from `secret`.
    pub fn from_secret(
        secret: &str,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AuthError> {
        if secret.is_empty() {
            return Err(AuthError::EmptySecret);
        }
        let signing = SigningKey::from_bytes(&derive_key_from_secret(secret));
        let verifying = signing.verifying_key();
        Ok(Self {
            signing,
            verifying,
            ttl,
            clock,
        })
    }

    /// Lifetime stamped into newly issued tokens.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mints a token for `identity`, valid for the configured lifetime.
    pub fn issue(&self, identity: &Identity) -> Result<String, AuthError> {
        let iat = self.clock.unix_now();
        let claims = TokenClaims {
            sub: identity.as_str().to_string(),
            iat,
            exp: iat.saturating_add(self.ttl.as_secs() as i64),
        };
        let payload =
            serde_json::to_vec(&claims).map_err(|err| AuthError::Decode(err.to_string()))?;
        let signature = self.signing.sign(&payload);
        Ok(format!(
            "{}.{}",
            B64URL.encode(&payload),
            B64URL.encode(signature.to_bytes())
        ))
    }

    /// Checks signature, expiry and subject of a bare token.
    pub fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let (claims_b64, signature_b64) = token.split_once('.').ok_or(AuthError::Format)?;
        if claims_b64.is_empty() || signature_b64.is_empty() || signature_b64.contains('.') {
            return Err(AuthError::Format);
        }
        let payload = B64URL
            .decode(claims_b64)
            .map_err(|err| AuthError::Decode(err.to_string()))?;
        let signature_bytes = B64URL
            .decode(signature_b64)
            .map_err(|err| AuthError::Decode(err.to_string()))?;
        let signature =
            Signature::from_slice(&signature_bytes).map_err(|_| AuthError::BadSignature)?;
        self.verifying
            .verify_strict(&payload, &signature)
            .map_err(|_| AuthError::BadSignature)?;

        let claims: TokenClaims =
            serde_json::from_slice(&payload).map_err(|err| AuthError::Decode(err.to_string()))?;
        if self.clock.unix_now() >= claims.exp {
            return Err(AuthError::Expired);
        }
        Identity::parse(&claims.sub).map_err(|_| AuthError::Subject)
    }
}

impl IdentityResolver for TokenAuthority {
    fn resolve(&self, authorization: &str) -> Result<Identity, AuthError> {
        let header = authorization.trim();
        if header.is_empty() {
            return Err(AuthError::Missing);
        }
        let token = header
            .strip_prefix(BEARER_PREFIX)
            .ok_or(AuthError::Format)?
            .trim();
        self.validate(token)
    }
}

fn derive_key_from_secret(secret: &str) -> [u8; SECRET_KEY_LENGTH] {
    let mut hasher = Sha512::new();
    hasher.update(b"answer-signer-token-v1");
    hasher.update(secret.as_bytes());
    let digest = hasher.finalize();
    let mut key = [0u8; SECRET_KEY_LENGTH];
    key.copy_from_slice(&digest[..SECRET_KEY_LENGTH]);
    key
}
