//! Self-signed certificate issuance for local-like hosts and for the
//! fallback path when ACME is unavailable.

use anyhow::{Context, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_RSA_SHA256};
use time::{Duration, OffsetDateTime};

/// Leaf validity; comfortably past a year so local certs rarely churn
const VALIDITY_DAYS: i64 = 397;

/// A freshly generated certificate and its private key, both PEM
pub struct IssuedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Generate an RSA-2048 / SHA-256 self-signed certificate with the given
/// subject common name and DNS SANs. Wildcard names are accepted.
pub fn issue(common_name: &str, alt_names: &[String]) -> Result<IssuedCert> {
    let mut params = CertificateParams::new(alt_names.to_vec())
        .with_context(|| format!("invalid SAN set for '{common_name}'"))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::minutes(5);
    params.not_after = now + Duration::days(VALIDITY_DAYS);

    let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)
        .context("failed to generate RSA-2048 key pair")?;
    let cert = params
        .self_signed(&key_pair)
        .with_context(|| format!("failed to self-sign certificate for '{common_name}'"))?;

    Ok(IssuedCert {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert_store;

    #[test]
    fn issues_pem_pair() {
        let issued = issue("unit.test", &["unit.test".to_string()]).unwrap();
        assert!(issued.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(issued.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn subject_and_sans_match_request() {
        let sans = vec![
            "unit.test".to_string(),
            "alt.unit.test".to_string(),
            "*.unit.test".to_string(),
        ];
        let issued = issue("unit.test", &sans).unwrap();
        let info = cert_store::parse_cert(&issued.cert_pem).unwrap();
        assert_eq!(info.subject_cn.as_deref(), Some("unit.test"));
        for san in &sans {
            assert!(info.san_dns_names.contains(san), "missing SAN {san}");
        }
    }

    #[test]
    fn cn_can_differ_from_sans() {
        let issued = issue("local-gateway", &["a.local".to_string()]).unwrap();
        let info = cert_store::parse_cert(&issued.cert_pem).unwrap();
        assert_eq!(info.subject_cn.as_deref(), Some("local-gateway"));
        assert_eq!(info.san_dns_names, vec!["a.local".to_string()]);
    }
}
