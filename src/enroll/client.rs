//! Agent-side enrollment: CSR out, signed certificate back.

use std::path::Path;

use reqwest::Client;
use tracing::{debug, info};

use super::{CSR_ENDPOINT, CsrRequestBody, CsrResponseBody};
use crate::pki::{self, PkiPaths};
use crate::{Error, Result};

/// What an agent needs to enroll.
#[derive(Debug, Clone)]
pub struct EnrollmentRequest<'a> {
    /// Controller HTTP base URL, e.g. `http://localhost:8080`.
    pub controller_http: &'a str,
    /// Enrollment token issued by the controller.
    pub token: &'a str,
    /// Becomes the certificate common name and the `agent-{id}` file stem.
    pub agent_id: &'a str,
    /// Requested as the SAN.
    pub hostname: &'a str,
    /// Where `agent-{id}.pem` / `agent-{id}.key` are written.
    pub pki_dir: &'a Path,
}

/// Enroll and store the signed identity. Nothing is written unless the
/// controller returns a certificate.
pub async fn enroll_agent(http: &Client, request: &EnrollmentRequest<'_>) -> Result<PkiPaths> {
    pki::ensure_dir(request.pki_dir)?;

    let hostnames: Vec<String> = if request.hostname.is_empty() {
        Vec::new()
    } else {
        vec![request.hostname.to_string()]
    };
    let bundle = pki::create_csr(request.agent_id, &hostnames)?;

    let url = format!(
        "{}{}",
        request.controller_http.trim_end_matches('/'),
        CSR_ENDPOINT
    );
    debug!(url = %url, agent_id = request.agent_id, "Submitting CSR");

    let response = http
        .post(&url)
        .json(&CsrRequestBody {
            token: request.token.to_string(),
            csr_pem: bundle.csr_pem,
        })
        .send()
        .await
        .map_err(|e| Error::Enrollment(format!("CSR request to {url} failed: {e}")))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Enrollment(format!(
            "CSR signing rejected: HTTP {status} - {body}"
        )));
    }

    let signed: CsrResponseBody = response
        .json()
        .await
        .map_err(|e| Error::Enrollment(format!("Failed to parse CSR response: {e}")))?;
    if signed.cert_pem.trim().is_empty() {
        return Err(Error::Enrollment("controller returned an empty certificate".into()));
    }

    let paths = pki::paths(request.pki_dir, &pki::agent_identity_name(request.agent_id));
    pki::write_identity(&paths.cert, &paths.key, &signed.cert_pem, &bundle.key_pem)?;

    info!(agent_id = request.agent_id, cert = %paths.cert.display(), "Agent enrolled");
    Ok(paths)
}
