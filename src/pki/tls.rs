//! Mutual-TLS configuration for the agent session channel.
//!
//! Both roles pin the Vertera CA as the only trust anchor and require the
//! peer to present a certificate it signed. TLS 1.2 is the floor.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use tracing::debug;

/// Server name agents expect on the controller certificate by default.
pub const DEFAULT_SERVER_NAME: &str = "vertera-controller";

static PROTOCOL_VERSIONS: &[&SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Errors building a TLS configuration.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// A certificate or key file is unreadable, empty or malformed.
    #[error("Cannot load '{}': {reason}", path.display())]
    Load {
        /// Offending file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// The CA file could not be turned into a trust store.
    #[error("Trust store error for '{}': {reason}", path.display())]
    TrustStore {
        /// CA file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// rustls rejected the assembled configuration (e.g. cert/key mismatch).
    #[error("TLS config error: {0}")]
    Config(String),
}

/// Client-side TLS material plus the name the controller certificate
/// must carry.
#[derive(Clone)]
pub struct ClientTls {
    /// rustls client configuration.
    pub config: Arc<ClientConfig>,
    /// Expected server identity.
    pub server_name: ServerName<'static>,
}

impl std::fmt::Debug for ClientTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTls")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config builders
// ─────────────────────────────────────────────────────────────────────────────

/// Controller-side config: present `cert`/`key`, require a client
/// certificate chaining to `ca`.
pub fn server_tls_config(ca: &Path, cert: &Path, key: &Path) -> Result<ServerConfig, TlsError> {
    let certs = load_certs(cert)?;
    let key_der = load_private_key(key)?;
    let roots = load_trust_store(ca)?;
    let provider = provider();

    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| TlsError::TrustStore {
            path: ca.to_path_buf(),
            reason: e.to_string(),
        })?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(PROTOCOL_VERSIONS)
        .map_err(|e| TlsError::Config(e.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key_der)
        .map_err(|e| TlsError::Config(format!("cert/key mismatch? {e}")))?;

    debug!(cert = %cert.display(), ca = %ca.display(), "Server mTLS config built");
    Ok(config)
}

/// Agent-side config: present `cert`/`key`, trust only `ca`, and expect
/// `server_name` on the controller certificate.
pub fn client_tls_config(
    ca: &Path,
    cert: &Path,
    key: &Path,
    server_name: &str,
) -> Result<ClientTls, TlsError> {
    let certs = load_certs(cert)?;
    let key_der = load_private_key(key)?;
    let roots = load_trust_store(ca)?;

    let name = if server_name.is_empty() {
        DEFAULT_SERVER_NAME
    } else {
        server_name
    };
    let server_name = ServerName::try_from(name.to_owned())
        .map_err(|e| TlsError::Config(format!("invalid server name '{name}': {e}")))?;

    let config = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(PROTOCOL_VERSIONS)
        .map_err(|e| TlsError::Config(e.to_string()))?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key_der)
        .map_err(|e| TlsError::Config(format!("cert/key mismatch? {e}")))?;

    debug!(cert = %cert.display(), ca = %ca.display(), server_name = name, "Client mTLS config built");
    Ok(ClientTls {
        config: Arc::new(config),
        server_name,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// PEM loading
// ─────────────────────────────────────────────────────────────────────────────

/// Load all certificates from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = read_file(path)?;
    let certs = CertificateDer::pem_slice_iter(&pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| load_error(path, e))?;

    if certs.is_empty() {
        return Err(load_error(path, "no certificates found"));
    }
    Ok(certs)
}

/// Load the first private key (PKCS#8, SEC1 or PKCS#1) from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = read_file(path)?;
    PrivateKeyDer::from_pem_slice(&pem).map_err(|e| load_error(path, e))
}

fn load_trust_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let pem = read_file(path)?;
    let trust_error = |reason: String| TlsError::TrustStore {
        path: path.to_path_buf(),
        reason,
    };

    let certs = CertificateDer::pem_slice_iter(&pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| trust_error(e.to_string()))?;

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots.add(cert).map_err(|e| trust_error(e.to_string()))?;
    }
    if roots.is_empty() {
        return Err(trust_error("no CA certificates found".to_string()));
    }
    Ok(roots)
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|e| load_error(path, e))
}

fn load_error(path: &Path, reason: impl std::fmt::Display) -> TlsError {
    TlsError::Load {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
