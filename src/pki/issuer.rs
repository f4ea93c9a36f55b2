//! Leaf certificate issuance.
//!
//! Two entry points:
//! - [`issue_certificate`] generates the key locally and writes both files
//!   (controller identity, dev-mode agents)
//! - [`sign_csr`] signs a remote public key; the private key never reaches us

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rcgen::{
    CertificateParams, CertificateSigningRequestParams, DistinguishedName, DnType, Ia5String,
    IsCa, KeyUsagePurpose, SanType,
};
use tracing::{debug, info, warn};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

use super::{
    CertificateAuthority, ORGANIZATION, PkiError, Role, ensure_dir, generate_key_pair,
    identity_is_usable, paths, random_serial, validity_window, write_identity,
};

/// Parameters for a locally generated identity.
#[derive(Debug, Clone)]
pub struct IssueRequest<'a> {
    /// File stem: the identity is written to `{name}.pem` / `{name}.key`.
    pub name: &'a str,
    /// Subject common name.
    pub common_name: &'a str,
    /// Server or client authentication.
    pub role: Role,
    /// Lifetime from now.
    pub validity: Duration,
    /// SAN entries; IP literals become IP SANs, everything else DNS SANs.
    pub hostnames: &'a [String],
}

/// Paths of an identity on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedIdentity {
    /// Leaf certificate PEM.
    pub cert_path: PathBuf,
    /// Private key PEM.
    pub key_path: PathBuf,
    /// `true` when an existing certificate was returned untouched.
    pub reused: bool,
}

/// Issue `{name}.pem` / `{name}.key` in `dir`, signed by `ca`.
///
/// Idempotent: if `{name}.pem` and `{name}.key` already hold a matching pair
/// nothing is written and the existing paths are returned, regardless of the
/// requested parameters. A certificate whose key is missing or does not match
/// is re-issued.
pub fn issue_certificate(
    dir: &Path,
    ca: &CertificateAuthority,
    request: &IssueRequest<'_>,
) -> Result<IssuedIdentity, PkiError> {
    ensure_dir(dir)?;
    let p = paths(dir, request.name);

    if identity_is_usable(&p.cert, &p.key) {
        debug!(name = request.name, "Identity already issued, reusing");
        return Ok(IssuedIdentity {
            cert_path: p.cert,
            key_path: p.key,
            reused: true,
        });
    }
    if p.cert.exists() {
        warn!(name = request.name, "Identity on disk has no matching key, re-issuing");
    }

    let key_pair = generate_key_pair()?;
    let mut params = leaf_params(request.role, request.validity)?;
    params.distinguished_name = subject(request.common_name);
    params.subject_alt_names = classify_hostnames(request.hostnames)?;

    let cert = params
        .signed_by(&key_pair, ca.issuer(), ca.key_pair())
        .map_err(|e| PkiError::Signing(e.to_string()))?;

    write_identity(&p.cert, &p.key, &cert.pem(), &key_pair.serialize_pem())?;
    telemetry_metrics::counter!("vertera_certificates_signed_total", "source" => "local")
        .increment(1);
    info!(
        name = request.name,
        common_name = request.common_name,
        role = ?request.role,
        "Issued certificate"
    );

    Ok(IssuedIdentity {
        cert_path: p.cert,
        key_path: p.key,
        reused: false,
    })
}

/// Sign a PEM-encoded PKCS#10 request and return the leaf certificate PEM.
///
/// The CSR must carry a valid self-signature. Subject and requested SANs are
/// kept; key usage, extended key usage, validity and serial are ours.
pub fn sign_csr(
    ca: &CertificateAuthority,
    csr_pem: &str,
    role: Role,
    validity: Duration,
) -> Result<String, PkiError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(csr_pem.as_bytes())
        .map_err(|e| PkiError::InvalidCsr(format!("no PEM block: {e}")))?;
    if pem.label != "CERTIFICATE REQUEST" {
        return Err(PkiError::InvalidCsr(format!(
            "expected CERTIFICATE REQUEST block, got {}",
            pem.label
        )));
    }

    let (_, csr) = X509CertificationRequest::from_der(&pem.contents)
        .map_err(|e| PkiError::InvalidCsr(format!("malformed request: {e}")))?;
    csr.verify_signature()
        .map_err(|e| PkiError::SignatureInvalid(e.to_string()))?;
    let sans = requested_sans(&csr);

    let mut request = CertificateSigningRequestParams::from_pem(csr_pem)
        .map_err(|e| PkiError::InvalidCsr(e.to_string()))?;
    let subject = request.params.distinguished_name.clone();
    request.params = leaf_params(role, validity)?;
    request.params.distinguished_name = subject;
    request.params.subject_alt_names = sans;

    let cert = request
        .signed_by(ca.issuer(), ca.key_pair())
        .map_err(|e| PkiError::Signing(e.to_string()))?;

    telemetry_metrics::counter!("vertera_certificates_signed_total", "source" => "csr")
        .increment(1);
    debug!(role = ?role, "Signed CSR");
    Ok(cert.pem())
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// A locally generated key pair and the PKCS#10 request for it.
#[derive(Debug, Clone)]
pub struct CsrBundle {
    /// `CERTIFICATE REQUEST` PEM.
    pub csr_pem: String,
    /// Private key PEM; stays on the requesting host.
    pub key_pem: String,
}

/// Generate a key and a CSR for `common_name`, requesting `hostnames` as SANs.
pub fn create_csr(common_name: &str, hostnames: &[String]) -> Result<CsrBundle, PkiError> {
    let key = generate_key_pair()?;
    let mut params = CertificateParams::default();
    params.distinguished_name = subject(common_name);
    params.subject_alt_names = classify_hostnames(hostnames)?;

    let csr_pem = params
        .serialize_request(&key)
        .and_then(|csr| csr.pem())
        .map_err(|e| PkiError::Signing(format!("CSR: {e}")))?;
    Ok(CsrBundle {
        csr_pem,
        key_pem: key.serialize_pem(),
    })
}

fn leaf_params(role: Role, validity: Duration) -> Result<CertificateParams, PkiError> {
    let (not_before, not_after) = validity_window(validity)?;
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![role.extended_key_usage()];
    params.serial_number = Some(random_serial());
    params.not_before = not_before;
    params.not_after = not_after;
    params.use_authority_key_identifier_extension = true;
    Ok(params)
}

fn subject(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, ORGANIZATION);
    dn
}

fn classify_hostnames(hostnames: &[String]) -> Result<Vec<SanType>, PkiError> {
    hostnames
        .iter()
        .map(|h| h.trim())
        .filter(|h| !h.is_empty())
        .map(|h| match h.parse::<IpAddr>() {
            Ok(ip) => Ok(SanType::IpAddress(ip)),
            Err(_) => Ia5String::try_from(h)
                .map(SanType::DnsName)
                .map_err(|_| PkiError::InvalidName(h.to_string())),
        })
        .collect()
}

fn requested_sans(csr: &X509CertificationRequest<'_>) -> Vec<SanType> {
    let mut sans = Vec::new();
    let Some(extensions) = csr.requested_extensions() else {
        return sans;
    };
    for ext in extensions {
        let ParsedExtension::SubjectAlternativeName(san) = ext else {
            continue;
        };
        for name in &san.general_names {
            match name {
                GeneralName::DNSName(dns) => {
                    if let Ok(v) = Ia5String::try_from(*dns) {
                        sans.push(SanType::DnsName(v));
                    }
                }
                GeneralName::IPAddress(raw) => {
                    if let Some(ip) = ip_from_bytes(raw) {
                        sans.push(SanType::IpAddress(ip));
                    }
                }
                _ => {}
            }
        }
    }
    sans
}

fn ip_from_bytes(raw: &[u8]) -> Option<IpAddr> {
    if let Ok(v4) = <[u8; 4]>::try_from(raw) {
        return Some(IpAddr::V4(Ipv4Addr::from(v4)));
    }
    <[u8; 16]>::try_from(raw)
        .ok()
        .map(|v6| IpAddr::V6(Ipv6Addr::from(v6)))
}
