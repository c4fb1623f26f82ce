//! Bearer-token authentication for the blobs API.
//!
//! Requests carry an RSA-signed JWT; the daemon only verifies signatures
//! against a configured public key. Token issuance lives in the `blob-token`
//! CLI, which signs with the matching private key.

use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default token lifetime used by the `blob-token` CLI.
pub const DEFAULT_TOKEN_TTL_HOURS: i64 = 72;

/// Claims carried by an API token. `sub` identifies the caller and is
/// recorded as `created_by`/`updated_by` on mutated blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub admin: bool,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing Authorization bearer token")]
    MissingToken,
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("invalid RSA key: {0}")]
    InvalidKey(String),
}

/// Verifies bearer JWTs against a single RSA public key.
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Builds a verifier from a PEM-encoded RSA public key.
    pub fn from_rsa_pem(pem: &[u8]) -> Result<Self, AuthError> {
        let key =
            DecodingKey::from_rsa_pem(pem).map_err(|err| AuthError::InvalidKey(err.to_string()))?;
        let mut validation = Validation::new(Algorithm::RS512);
        validation.algorithms = vec![Algorithm::RS256, Algorithm::RS512];
        Ok(Self { key, validation })
    }

    /// Decodes and validates a token, returning its claims.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|_| AuthError::InvalidToken)
    }
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier").finish_non_exhaustive()
    }
}

/// Signs a token with a PEM-encoded RSA private key. Shared by the
/// `blob-token` CLI and the test suite.
pub fn sign_token(
    private_pem: &[u8],
    subject: &str,
    name: &str,
    admin: bool,
    ttl: ChronoDuration,
) -> Result<String, AuthError> {
    let key = EncodingKey::from_rsa_pem(private_pem)
        .map_err(|err| AuthError::InvalidKey(err.to_string()))?;
    let now = Utc::now();
    let claims = Claims {
        sub: subject.to_string(),
        name: name.to_string(),
        admin,
        iat: now.timestamp(),
        exp: (now + ttl).timestamp(),
    };
    encode(&Header::new(Algorithm::RS512), &claims, &key)
        .map_err(|err| AuthError::InvalidKey(err.to_string()))
}
