//! Certificate identity extraction.
//!
//! Parses an X.509 DER certificate into the fields the control plane cares
//! about: who it names (CN, SANs) and what it may authenticate (EKU).

use std::net::IpAddr;

use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use super::PkiError;

// ─────────────────────────────────────────────────────────────────────────────
// Certificate identity
// ─────────────────────────────────────────────────────────────────────────────

/// Identity fields of an issued or peer certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertIdentity {
    /// Certificate Common Name (CN).
    pub common_name: Option<String>,

    /// First Organisation (O) in the subject.
    pub organization: Option<String>,

    /// Subject Alternative Name, DNS entries.
    pub san_dns_names: Vec<String>,

    /// Subject Alternative Name, IP entries.
    pub san_ips: Vec<IpAddr>,

    /// Carries the `serverAuth` extended key usage.
    pub server_auth: bool,

    /// Carries the `clientAuth` extended key usage.
    pub client_auth: bool,

    /// Pre-computed label for logs.
    pub display_name: String,
}

impl CertIdentity {
    /// Parse a DER-encoded certificate and extract its identity fields.
    pub fn from_der(der: &[u8]) -> Result<Self, PkiError> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::InvalidCertificate(e.to_string()))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_owned);
        let organization = cert
            .subject()
            .iter_organization()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_owned);
        let (san_dns_names, san_ips) = extract_sans(&cert);
        let (server_auth, client_auth) = cert
            .extended_key_usage()
            .ok()
            .flatten()
            .map_or((false, false), |eku| {
                (eku.value.server_auth, eku.value.client_auth)
            });

        let display_name = common_name
            .clone()
            .or_else(|| san_dns_names.first().cloned())
            .unwrap_or_else(|| "<unknown>".to_owned());

        Ok(Self {
            common_name,
            organization,
            san_dns_names,
            san_ips,
            server_auth,
            client_auth,
            display_name,
        })
    }
}

fn extract_sans(cert: &X509Certificate<'_>) -> (Vec<String>, Vec<IpAddr>) {
    let mut dns_names = Vec::new();
    let mut ips = Vec::new();

    if let Ok(Some(san_ext)) = cert.subject_alternative_name() {
        for name in &san_ext.value.general_names {
            match name {
                GeneralName::DNSName(dns) => dns_names.push((*dns).to_owned()),
                GeneralName::IPAddress(raw) => {
                    if let Ok(v4) = <[u8; 4]>::try_from(*raw) {
                        ips.push(IpAddr::from(v4));
                    } else if let Ok(v6) = <[u8; 16]>::try_from(*raw) {
                        ips.push(IpAddr::from(v6));
                    }
                }
                _ => {}
            }
        }
    }

    (dns_names, ips)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DistinguishedName, DnType, Ia5String, KeyPair, SanType};

    fn self_signed(cn: Option<&str>, sans: Vec<SanType>) -> Vec<u8> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        if let Some(cn) = cn {
            dn.push(DnType::CommonName, cn);
        }
        dn.push(DnType::OrganizationName, "Vertera");
        params.distinguished_name = dn;
        params.subject_alt_names = sans;
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().der().to_vec()
    }

    #[test]
    fn extracts_cn_org_and_sans() {
        let der = self_signed(
            Some("agent-7"),
            vec![
                SanType::DnsName(Ia5String::try_from("node7.lab").unwrap()),
                SanType::IpAddress("10.1.2.3".parse().unwrap()),
            ],
        );
        let id = CertIdentity::from_der(&der).unwrap();
        assert_eq!(id.common_name.as_deref(), Some("agent-7"));
        assert_eq!(id.organization.as_deref(), Some("Vertera"));
        assert_eq!(id.san_dns_names, vec!["node7.lab"]);
        assert_eq!(id.san_ips, vec!["10.1.2.3".parse::<IpAddr>().unwrap()]);
        assert_eq!(id.display_name, "agent-7");
        assert!(!id.server_auth && !id.client_auth);
    }

    #[test]
    fn display_name_falls_back_to_dns_san() {
        let der = self_signed(
            None,
            vec![SanType::DnsName(Ia5String::try_from("node9.lab").unwrap())],
        );
        let id = CertIdentity::from_der(&der).unwrap();
        assert_eq!(id.display_name, "node9.lab");
    }

    #[test]
    fn garbage_der_is_rejected() {
        assert!(CertIdentity::from_der(b"\x30\x03junk").is_err());
    }
}
