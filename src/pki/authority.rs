//! Root certificate authority: create once, reuse thereafter.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use tracing::{debug, info};
use x509_parser::prelude::{FromDer, X509Certificate};

use super::{
    ORGANIZATION, PkiError, ensure_dir, generate_key_pair, paths, publish_new, random_serial,
    validity_window,
};

/// A loaded root CA able to sign leaf certificates.
pub struct CertificateAuthority {
    cert_pem: String,
    key_pair: KeyPair,
    issuer: Certificate,
    cert_path: PathBuf,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_path", &self.cert_path)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Load `dir/ca.pem` + `dir/ca.key`, creating both on first use.
    ///
    /// An existing certificate is never regenerated: once `ca.pem` exists the
    /// call only reads and validates it. Concurrent first-time callers agree
    /// on one pair: the key is published without replacing an existing one
    /// and every caller self-signs with whatever key won, then `ca.pem` is
    /// published the same way and losers load the winner's certificate.
    pub fn ensure(dir: &Path, common_name: &str, validity: Duration) -> Result<Self, PkiError> {
        ensure_dir(dir)?;
        let p = paths(dir, "ca");

        if p.ca_cert.exists() {
            debug!(path = %p.ca_cert.display(), "Reusing existing CA");
            return Self::load(&p.ca_cert, &p.ca_key);
        }

        let fresh = generate_key_pair()?;
        if !publish_new(&p.ca_key, fresh.serialize_pem().as_bytes(), 0o600)? {
            debug!(path = %p.ca_key.display(), "CA key already present, adopting it");
        }
        let key_pem =
            fs::read_to_string(&p.ca_key).map_err(|e| PkiError::storage(&p.ca_key, e))?;
        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| {
            PkiError::KeyGeneration(format!("cannot parse '{}': {e}", p.ca_key.display()))
        })?;

        let (not_before, not_after) = validity_window(validity)?;
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, ORGANIZATION);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.serial_number = Some(random_serial());
        params.not_before = not_before;
        params.not_after = not_after;

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| PkiError::Signing(format!("CA self-sign failed: {e}")))?;
        let cert_pem = cert.pem();

        if !publish_new(&p.ca_cert, cert_pem.as_bytes(), 0o644)? {
            debug!(path = %p.ca_cert.display(), "CA created concurrently, loading it");
            return Self::load(&p.ca_cert, &p.ca_key);
        }
        info!(path = %p.ca_cert.display(), common_name, "Created root CA");

        Ok(Self {
            cert_pem,
            key_pair,
            issuer: cert,
            cert_path: p.ca_cert,
        })
    }

    /// Load an operator-supplied CA certificate and key.
    ///
    /// The certificate must be a self-signed CA allowed to sign certificates,
    /// and the key must match its public key.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, PkiError> {
        let cert_pem =
            fs::read_to_string(cert_path).map_err(|e| PkiError::storage(cert_path, e))?;
        let key_pem = fs::read_to_string(key_path).map_err(|e| PkiError::storage(key_path, e))?;

        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| {
            PkiError::KeyGeneration(format!("cannot parse '{}': {e}", key_path.display()))
        })?;

        validate_ca(cert_path, &cert_pem, &key_pair)?;

        let invalid = |reason: String| PkiError::InvalidCa {
            path: cert_path.to_path_buf(),
            reason,
        };
        let params =
            CertificateParams::from_ca_cert_pem(&cert_pem).map_err(|e| invalid(e.to_string()))?;
        let issuer = params
            .self_signed(&key_pair)
            .map_err(|e| invalid(format!("cannot rebuild issuer: {e}")))?;

        Ok(Self {
            cert_pem,
            key_pair,
            issuer,
            cert_path: cert_path.to_path_buf(),
        })
    }

    /// PEM of the root certificate, as distributed to peers.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Where the root certificate lives on disk.
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub(crate) fn issuer(&self) -> &Certificate {
        &self.issuer
    }

    pub(crate) fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }
}

fn validate_ca(path: &Path, cert_pem: &str, key_pair: &KeyPair) -> Result<(), PkiError> {
    let invalid = |reason: &str| PkiError::InvalidCa {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|_| invalid("no PEM block"))?;
    if pem.label != "CERTIFICATE" {
        return Err(invalid("PEM block is not a certificate"));
    }
    let (_, cert) =
        X509Certificate::from_der(&pem.contents).map_err(|_| invalid("malformed certificate"))?;

    let is_ca = cert
        .basic_constraints()
        .ok()
        .flatten()
        .is_some_and(|bc| bc.value.ca);
    if !is_ca {
        return Err(invalid("basic constraints do not mark it as a CA"));
    }

    let Some(usage) = cert.key_usage().ok().flatten() else {
        return Err(invalid("key usage extension missing"));
    };
    if !usage.value.key_cert_sign() {
        return Err(invalid("key usage lacks keyCertSign"));
    }
    if !usage.value.crl_sign() {
        return Err(invalid("key usage lacks cRLSign"));
    }

    if cert.public_key().raw != key_pair.public_key_der().as_slice() {
        return Err(invalid("private key does not match certificate"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const YEAR: Duration = Duration::from_secs(365 * 24 * 3600);

    fn parse(pem: &str) -> (Vec<u8>, String) {
        let (_, pem) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).unwrap();
        (pem.contents, pem.label)
    }

    #[test]
    fn ensure_creates_ca_files() {
        // GIVEN: an empty directory
        let dir = tempfile::tempdir().unwrap();

        // WHEN: the CA is ensured
        let ca = CertificateAuthority::ensure(dir.path(), "Test Root", YEAR).unwrap();

        // THEN: a self-signed CA certificate and its key are on disk
        assert!(dir.path().join("ca.pem").exists());
        assert!(dir.path().join("ca.key").exists());
        let (der, label) = parse(ca.cert_pem());
        assert_eq!(label, "CERTIFICATE");
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        assert!(cert.is_ca());
        assert_eq!(cert.subject(), cert.issuer());
        let cn = cert.subject().iter_common_name().next().unwrap();
        assert_eq!(cn.as_str().unwrap(), "Test Root");
        cert.verify_signature(None).unwrap();
    }

    #[test]
    fn ensure_reuses_existing_ca() {
        // GIVEN: a CA that has already been created
        let dir = tempfile::tempdir().unwrap();
        let first = CertificateAuthority::ensure(dir.path(), "Test Root", YEAR).unwrap();

        // WHEN: ensured a second time
        let second = CertificateAuthority::ensure(dir.path(), "Other Name", YEAR).unwrap();

        // THEN: the same certificate is returned
        assert_eq!(first.cert_pem(), second.cert_pem());
    }

    #[test]
    fn load_rejects_mismatched_key() {
        // GIVEN: two independent CAs
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        CertificateAuthority::ensure(a.path(), "A", YEAR).unwrap();
        CertificateAuthority::ensure(b.path(), "B", YEAR).unwrap();

        // WHEN: A's cert is loaded with B's key
        let err = CertificateAuthority::load(&a.path().join("ca.pem"), &b.path().join("ca.key"))
            .unwrap_err();

        // THEN
        assert!(matches!(err, PkiError::InvalidCa { .. }), "{err}");
    }

    #[test]
    fn load_missing_file_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CertificateAuthority::load(&dir.path().join("nope.pem"), &dir.path().join("nope.key"))
            .unwrap_err();
        assert!(matches!(err, PkiError::Storage { .. }));
    }

    #[test]
    fn load_rejects_ca_without_crl_sign() {
        // GIVEN: a self-signed CA whose key usage has keyCertSign only
        let dir = tempfile::tempdir().unwrap();
        let key = generate_key_pair().unwrap();
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, "No CRL Root");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign];
        let cert = params.self_signed(&key).unwrap();
        let cert_path = dir.path().join("ca.pem");
        let key_path = dir.path().join("ca.key");
        fs::write(&cert_path, cert.pem()).unwrap();
        fs::write(&key_path, key.serialize_pem()).unwrap();

        // WHEN
        let err = CertificateAuthority::load(&cert_path, &key_path).unwrap_err();

        // THEN
        assert!(
            matches!(&err, PkiError::InvalidCa { reason, .. } if reason.contains("cRLSign")),
            "{err}"
        );
    }

    #[test]
    fn ensure_adopts_orphaned_key() {
        // GIVEN: a key left behind without a certificate
        let dir = tempfile::tempdir().unwrap();
        let orphan = generate_key_pair().unwrap();
        fs::write(dir.path().join("ca.key"), orphan.serialize_pem()).unwrap();

        // WHEN
        let ca = CertificateAuthority::ensure(dir.path(), "Test Root", YEAR).unwrap();

        // THEN: the certificate is built on that key and loads cleanly
        assert_eq!(ca.key_pair().public_key_der(), orphan.public_key_der());
        CertificateAuthority::load(&dir.path().join("ca.pem"), &dir.path().join("ca.key")).unwrap();
    }

    #[test]
    fn concurrent_ensure_agrees_on_one_ca() {
        for _ in 0..20 {
            // GIVEN: several callers racing on an empty directory
            let dir = tempfile::tempdir().unwrap();
            let barrier = std::sync::Barrier::new(6);

            // WHEN: all of them ensure the CA at once
            let pems: Vec<String> = std::thread::scope(|scope| {
                let handles: Vec<_> = (0..6)
                    .map(|_| {
                        scope.spawn(|| {
                            barrier.wait();
                            CertificateAuthority::ensure(dir.path(), "Race Root", YEAR)
                                .unwrap()
                                .cert_pem()
                                .to_string()
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            // THEN: every caller got the certificate that is on disk, and it
            // matches the key on disk
            let on_disk =
                CertificateAuthority::load(&dir.path().join("ca.pem"), &dir.path().join("ca.key"))
                    .unwrap();
            assert!(pems.iter().all(|pem| pem == on_disk.cert_pem()));
        }
    }
}
