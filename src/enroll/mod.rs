//! Token-gated certificate enrollment.
//!
//! The controller hands out short-lived HS256 tokens ([`token`]). An agent
//! without an identity generates a key locally, sends a CSR plus a token
//! to the controller ([`client`]) and receives a client certificate signed
//! by the CA. The private key never leaves the agent.
//!
//! A token is not bound to the CSR or to a common name: any holder can
//! enroll any name until the token expires.

pub mod client;
pub mod token;

use serde::{Deserialize, Serialize};

pub use client::{EnrollmentRequest, enroll_agent};
pub use token::{EnrollmentClaims, IssuedToken, TokenError, issue_token, verify_token};

/// Path of the CSR signing endpoint below the controller base URL.
pub const CSR_ENDPOINT: &str = "/api/v1/agents/enroll/csr";

/// Body of `POST /agents/enroll/token`. An empty body uses the default TTL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenRequestBody {
    /// Go-style duration such as `15m` or `2h`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

/// Reply to a token request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponseBody {
    /// The bearer token.
    pub token: String,
    /// RFC 3339 expiry.
    pub expires_at: String,
}

/// Body of `POST /agents/enroll/csr`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrRequestBody {
    /// Enrollment token.
    pub token: String,
    /// PKCS#10 request, PEM encoded.
    pub csr_pem: String,
}

/// Reply to a CSR request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrResponseBody {
    /// Signed client certificate, PEM encoded.
    pub cert_pem: String,
}
