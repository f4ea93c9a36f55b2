//! Certificate authority, identity issuance and mutual-TLS material.
//!
//! # Layout
//!
//! Everything lives under one PKI directory (one trust domain):
//!
//! ```text
//! {pki_dir}/ca.pem            root certificate (0644)
//! {pki_dir}/ca.key            root private key (0600)
//! {pki_dir}/controller.pem    controller identity
//! {pki_dir}/agent-{id}.pem    agent identities
//! ```
//!
//! # Modules
//!
//! - [`authority`]: create-or-load the root CA ([`CertificateAuthority`])
//! - [`issuer`]: sign leaf identities, either locally generated or from a CSR
//! - [`identity`]: X.509 field extraction for issued or peer certificates
//! - [`tls`]: rustls server/client configs built from the material above

pub mod authority;
pub mod identity;
pub mod issuer;
pub mod tls;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::RngExt;
use rcgen::{ExtendedKeyUsagePurpose, KeyPair, SerialNumber};
use tempfile::NamedTempFile;
use time::OffsetDateTime;

pub use authority::CertificateAuthority;
pub use identity::CertIdentity;
pub use issuer::{CsrBundle, IssueRequest, IssuedIdentity, create_csr, issue_certificate, sign_csr};

/// Subject organisation stamped on every certificate we create.
pub const ORGANIZATION: &str = "Vertera";

/// Common name of the managed root CA.
pub const DEFAULT_CA_COMMON_NAME: &str = "Vertera Root CA";

/// How far `not_before` is back-dated to tolerate clock skew between hosts.
pub const CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);

/// Errors raised while creating, loading or using PKI material.
#[derive(Debug, thiserror::Error)]
pub enum PkiError {
    /// The PKI directory or one of its files could not be created, read or written.
    #[error("PKI storage error at '{}': {source}", path.display())]
    Storage {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Key pair generation (or parsing of a stored key) failed.
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// The CSR PEM block was missing, mistyped or unparsable.
    #[error("Invalid CSR: {0}")]
    InvalidCsr(String),

    /// The CSR self-signature does not verify against its public key.
    #[error("CSR signature invalid: {0}")]
    SignatureInvalid(String),

    /// A stored root certificate is not usable as a CA.
    #[error("Invalid CA at '{}': {reason}", path.display())]
    InvalidCa {
        /// CA certificate path.
        path: PathBuf,
        /// What check failed.
        reason: String,
    },

    /// A certificate could not be parsed.
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    /// A requested SAN could not be encoded.
    #[error("Invalid name '{0}' for a subject alternative name")]
    InvalidName(String),

    /// Building or signing the certificate failed.
    #[error("Certificate signing failed: {0}")]
    Signing(String),
}

impl PkiError {
    fn storage(path: &Path, source: io::Error) -> Self {
        Self::Storage {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Which side of a mutual-TLS connection an identity authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// `serverAuth` extended key usage.
    Server,
    /// `clientAuth` extended key usage.
    Client,
}

impl Role {
    fn extended_key_usage(self) -> ExtendedKeyUsagePurpose {
        match self {
            Self::Server => ExtendedKeyUsagePurpose::ServerAuth,
            Self::Client => ExtendedKeyUsagePurpose::ClientAuth,
        }
    }
}

/// File paths for the CA and for identity `name` inside `dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkiPaths {
    /// `ca.pem`
    pub ca_cert: PathBuf,
    /// `ca.key`
    pub ca_key: PathBuf,
    /// `{name}.pem`
    pub cert: PathBuf,
    /// `{name}.key`
    pub key: PathBuf,
}

/// Default file locations for a PKI directory and identity name.
#[must_use]
pub fn paths(dir: &Path, name: &str) -> PkiPaths {
    PkiPaths {
        ca_cert: dir.join("ca.pem"),
        ca_key: dir.join("ca.key"),
        cert: dir.join(format!("{name}.pem")),
        key: dir.join(format!("{name}.key")),
    }
}

/// Identity file stem for an agent.
#[must_use]
pub fn agent_identity_name(agent_id: &str) -> String {
    format!("agent-{agent_id}")
}

/// Create `dir` (owner-only on unix) if missing.
pub fn ensure_dir(dir: &Path) -> Result<(), PkiError> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir).map_err(|e| PkiError::storage(dir, e))
}

/// Generate the key pair used for every CA and leaf identity.
///
/// ECDSA P-384 gives 192-bit security, above the RSA-4096 floor.
pub(crate) fn generate_key_pair() -> Result<KeyPair, PkiError> {
    KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
        .map_err(|e| PkiError::KeyGeneration(e.to_string()))
}

/// Random positive 128-bit serial number.
pub(crate) fn random_serial() -> SerialNumber {
    let mut bytes: [u8; 16] = rand::rng().random();
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

/// `[now - CLOCK_SKEW, now + validity]`.
pub(crate) fn validity_window(
    validity: Duration,
) -> Result<(OffsetDateTime, OffsetDateTime), PkiError> {
    let now = OffsetDateTime::now_utc();
    let skew = time::Duration::try_from(CLOCK_SKEW)
        .map_err(|e| PkiError::Signing(format!("clock skew out of range: {e}")))?;
    let span = time::Duration::try_from(validity)
        .map_err(|e| PkiError::Signing(format!("validity out of range: {e}")))?;
    let not_before = now
        .checked_sub(skew)
        .ok_or_else(|| PkiError::Signing("not_before out of range".to_string()))?;
    let not_after = now
        .checked_add(span)
        .ok_or_else(|| PkiError::Signing("not_after out of range".to_string()))?;
    Ok((not_before, not_after))
}

/// Persist a certificate and key. The key is written first, owner-only;
/// the certificate, whose presence marks the identity as existing, last.
pub(crate) fn write_identity(
    cert_path: &Path,
    key_path: &Path,
    cert_pem: &str,
    key_pem: &str,
) -> Result<(), PkiError> {
    write_atomic(key_path, key_pem.as_bytes(), 0o600)?;
    write_atomic(cert_path, cert_pem.as_bytes(), 0o644)
}

/// Write to a unique sibling temp file and rename over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<(), PkiError> {
    staged(path, contents, mode)?
        .persist(path)
        .map(drop)
        .map_err(|e| PkiError::storage(path, e.error))
}

/// Like [`write_atomic`], but never replaces an existing file.
///
/// Returns `false` when `path` already existed; its contents are untouched.
pub(crate) fn publish_new(path: &Path, contents: &[u8], mode: u32) -> Result<bool, PkiError> {
    match staged(path, contents, mode)?.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(PkiError::storage(path, e.error)),
    }
}

fn staged(path: &Path, contents: &[u8], mode: u32) -> Result<NamedTempFile, PkiError> {
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| PkiError::storage(dir, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(mode))
            .map_err(|e| PkiError::storage(tmp.path(), e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    tmp.write_all(contents)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| PkiError::storage(tmp.path(), e))?;
    Ok(tmp)
}

/// Whether `cert_path` and `key_path` both exist and hold a matching pair.
pub(crate) fn identity_is_usable(cert_path: &Path, key_path: &Path) -> bool {
    let (Ok(cert_pem), Ok(key_pem)) = (fs::read_to_string(cert_path), fs::read_to_string(key_path))
    else {
        return false;
    };
    let Ok(key) = KeyPair::from_pem(&key_pem) else {
        return false;
    };
    x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .ok()
        .and_then(|(_, pem)| {
            pem.parse_x509()
                .ok()
                .map(|cert| cert.public_key().raw == key.public_key_der().as_slice())
        })
        .unwrap_or(false)
}
