//! Where the agent's client certificate comes from.
//!
//! Precedence: a complete bring-your-own set, then an identity already on
//! disk, then token enrollment, then local issuance from a CA in the
//! shared PKI directory (development setups where agent and controller
//! share `pki_dir`).

use std::path::PathBuf;

use tracing::{info, warn};

use crate::Result;
use crate::config::Config;
use crate::enroll::{EnrollmentRequest, enroll_agent};
use crate::pki::{
    self, CertificateAuthority, DEFAULT_CA_COMMON_NAME, IssueRequest, Role, issue_certificate,
};

const HOSTNAME_FILE: &str = "/proc/sys/kernel/hostname";

/// How the identity was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    /// All three files were configured.
    Provided,
    /// `agent-{id}.pem` was already present in the PKI directory.
    Existing,
    /// Signed by the controller through the enrollment endpoint.
    Enrolled,
    /// Issued locally from the shared CA.
    LocalDev,
}

/// TLS files for the agent's session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    /// CA used to verify the controller.
    pub ca_cert: PathBuf,
    /// Client certificate.
    pub cert: PathBuf,
    /// Client key.
    pub key: PathBuf,
    /// Where it came from.
    pub source: IdentitySource,
}

/// Configured hostname, else the kernel's, else `HOSTNAME`, else `localhost`.
pub fn resolve_hostname(config: &Config) -> String {
    if let Some(h) = config.hostname.as_deref() {
        return h.to_string();
    }
    std::fs::read_to_string(HOSTNAME_FILE)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "localhost".to_string())
}

/// Configured agent id, or the hostname.
pub fn resolve_agent_id(config: &Config, hostname: &str) -> String {
    config
        .agent_id
        .clone()
        .unwrap_or_else(|| hostname.to_string())
}

/// Find or create the agent's client identity.
pub async fn resolve_identity(
    config: &Config,
    http: &reqwest::Client,
    agent_id: &str,
    hostname: &str,
) -> Result<AgentIdentity> {
    if let Some(byo) = config.byo_client_identity() {
        info!(cert = %byo.cert.display(), "Using provided client identity");
        return Ok(AgentIdentity {
            ca_cert: byo.ca_cert,
            cert: byo.cert,
            key: byo.key,
            source: IdentitySource::Provided,
        });
    }

    let name = pki::agent_identity_name(agent_id);
    let paths = pki::paths(&config.pki_dir, &name);
    let ca_cert = config.ca_cert.clone().unwrap_or_else(|| paths.ca_cert.clone());

    if paths.cert.exists() && paths.key.exists() {
        info!(cert = %paths.cert.display(), "Reusing client identity on disk");
        return Ok(AgentIdentity {
            ca_cert,
            cert: paths.cert,
            key: paths.key,
            source: IdentitySource::Existing,
        });
    }

    if let Some(token) = config.enroll_token.as_deref() {
        let request = EnrollmentRequest {
            controller_http: &config.controller_http,
            token,
            agent_id,
            hostname,
            pki_dir: &config.pki_dir,
        };
        match enroll_agent(http, &request).await {
            Ok(enrolled) => {
                return Ok(AgentIdentity {
                    ca_cert,
                    cert: enrolled.cert,
                    key: enrolled.key,
                    source: IdentitySource::Enrolled,
                });
            }
            Err(e) => warn!(error = %e, "Agent auto-enroll failed, falling back to local issuance"),
        }
    }

    let ca = CertificateAuthority::ensure(&config.pki_dir, DEFAULT_CA_COMMON_NAME, config.ca_validity)?;
    let hostnames = vec![hostname.to_string()];
    let issued = issue_certificate(
        &config.pki_dir,
        &ca,
        &IssueRequest {
            name: &name,
            common_name: agent_id,
            role: Role::Client,
            validity: config.cert_validity,
            hostnames: &hostnames,
        },
    )?;
    info!(cert = %issued.cert_path.display(), "Issued local client identity");

    Ok(AgentIdentity {
        ca_cert: ca.cert_path().to_path_buf(),
        cert: issued.cert_path,
        key: issued.key_path,
        source: IdentitySource::LocalDev,
    })
}
