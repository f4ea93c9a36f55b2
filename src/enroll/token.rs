//! Enrollment bearer tokens (HS256 JWT keyed by the controller secret).
//!
//! Only HS256 is accepted on verification; a token signed with any other
//! algorithm (including `none`) is rejected before its signature is looked at.

use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Token failures.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// No secret configured, or the TTL is unusable.
    #[error("Token configuration error: {0}")]
    Config(String),

    /// Wrong secret or a signing algorithm other than HS256.
    #[error("Token signature invalid")]
    InvalidSignature,

    /// `exp` is in the past.
    #[error("Token expired")]
    Expired,

    /// Not a JWT, or its claims are unreadable.
    #[error("Malformed token: {0}")]
    Malformed(String),
}

/// Claims carried by an enrollment token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentClaims {
    /// `enroll-<UTC yyyymmddTHHMMSS>`
    pub jti: String,
    /// Issued at, seconds since the epoch.
    pub iat: i64,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
}

impl EnrollmentClaims {
    /// Expiry as a timestamp.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

/// A freshly issued token.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// Compact JWT.
    pub token: String,
    /// When it stops verifying.
    pub expires_at: DateTime<Utc>,
}

/// Sign a token valid for `ttl` from now.
pub fn issue_token(secret: &[u8], ttl: Duration) -> Result<IssuedToken, TokenError> {
    if secret.is_empty() {
        return Err(TokenError::Config("empty enrollment secret".into()));
    }
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| TokenError::Config(format!("ttl out of range: {e}")))?;

    let now = Utc::now();
    let expires_at = now
        .checked_add_signed(ttl)
        .ok_or_else(|| TokenError::Config("ttl out of range".into()))?;
    let claims = EnrollmentClaims {
        jti: format!("enroll-{}", now.format("%Y%m%dT%H%M%S")),
        iat: now.timestamp(),
        exp: expires_at.timestamp(),
    };

    let token = jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(|e| TokenError::Config(format!("signing failed: {e}")))?;

    telemetry_metrics::counter!("vertera_enroll_tokens_issued_total").increment(1);
    debug!(jti = %claims.jti, exp = claims.exp, "Issued enrollment token");
    Ok(IssuedToken { token, expires_at })
}

/// Check signature, algorithm and expiry; return the claims.
pub fn verify_token(secret: &[u8], token: &str) -> Result<EnrollmentClaims, TokenError> {
    if secret.is_empty() {
        return Err(TokenError::Config("empty enrollment secret".into()));
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;

    jsonwebtoken::decode::<EnrollmentClaims>(token, &DecodingKey::from_secret(secret), &validation)
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => TokenError::Expired,
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                TokenError::InvalidSignature
            }
            _ => TokenError::Malformed(e.to_string()),
        })
}
