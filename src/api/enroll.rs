//! Enrollment endpoints: token issuance and CSR signing.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use chrono::SecondsFormat;
use tracing::info;

use super::{ApiError, ApiState};
use crate::config::parse_duration;
use crate::enroll::{
    CsrRequestBody, CsrResponseBody, TokenError, TokenRequestBody, TokenResponseBody, issue_token,
    verify_token,
};
use crate::pki::{PkiError, Role, sign_csr as sign_request};

fn disabled() -> ApiError {
    ApiError::forbidden("enrollment disabled: VERTERA_ENROLL_JWT_SECRET not set")
}

fn is_blank(body: &[u8]) -> bool {
    body.iter().all(u8::is_ascii_whitespace)
}

/// POST /agents/enroll/token
pub(super) async fn create_token(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<Json<TokenResponseBody>, ApiError> {
    let secret = state.enroll_secret.as_deref().ok_or_else(disabled)?;

    let req: TokenRequestBody = if is_blank(&body) {
        TokenRequestBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid request body: {e}")))?
    };

    let ttl = match req.ttl.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => parse_duration(raw).map_err(ApiError::bad_request)?,
        None => state.default_token_ttl,
    };
    if ttl.is_zero() {
        return Err(ApiError::bad_request("ttl must be positive"));
    }

    let issued = issue_token(secret, ttl).map_err(|e| match e {
        TokenError::Config(msg) => ApiError::bad_request(msg),
        other => ApiError::internal(format!("failed to issue token: {other}")),
    })?;
    info!(ttl_secs = ttl.as_secs(), "Enrollment token issued");

    Ok(Json(TokenResponseBody {
        token: issued.token,
        expires_at: issued.expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    }))
}

/// POST /agents/enroll/csr
pub(super) async fn sign_csr(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<Json<CsrResponseBody>, ApiError> {
    let secret = state.enroll_secret.as_deref().ok_or_else(disabled)?;

    let req: CsrRequestBody = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid request: {e}")))?;
    if req.token.is_empty() || req.csr_pem.is_empty() {
        return Err(ApiError::bad_request("token and csr_pem are required"));
    }

    let claims = verify_token(secret, &req.token)
        .map_err(|e| ApiError::unauthorized(format!("invalid token: {e}")))?;

    let ca = state
        .signer
        .as_deref()
        .ok_or_else(|| ApiError::internal("no certificate authority available for signing"))?;

    let cert_pem =
        sign_request(ca, &req.csr_pem, Role::Client, state.cert_validity).map_err(|e| match e {
            PkiError::InvalidCsr(_) | PkiError::SignatureInvalid(_) | PkiError::InvalidName(_) => {
                ApiError::bad_request(format!("sign CSR failed: {e}"))
            }
            other => ApiError::internal(format!("sign CSR failed: {other}")),
        })?;

    info!(jti = %claims.jti, "Agent certificate signed");
    Ok(Json(CsrResponseBody { cert_pem }))
}
