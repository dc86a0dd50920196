//! On-disk certificate storage
//!
//! Two naming schemes coexist under the storage directory: per-host
//! `<hostname>.crt`/`.key` pairs for public (ACME) certificates and the
//! canonical `local-gateway.crt`/`.key` pair for the combined local
//! certificate. Self-signed fallbacks additionally keep a
//! `<hostname>_selfsigned.json` cache blob so a fallback survives
//! restarts without regenerating the key pair.
//!
//! All writes go through write-to-temp + rename, key before cert, so a
//! reader never observes a certificate without its matching key.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;
use x509_parser::extensions::GeneralName;

/// Resolved file locations for one certificate record
#[derive(Debug, Clone)]
pub struct CertPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Identity fields extracted from a certificate
#[derive(Debug, Clone, PartialEq)]
pub struct CertInfo {
    /// Subject common name, if present
    pub subject_cn: Option<String>,
    /// DNS SANs, lowercased; empty when the extension is absent
    pub san_dns_names: Vec<String>,
    /// Whether subject and issuer are identical (self-signed)
    pub self_issued: bool,
}

#[derive(Serialize, Deserialize)]
struct SelfSignedBlob {
    cert: String,
    key: String,
}

/// Certificate file store rooted at the ACME config directory
pub struct CertStore {
    dir: PathBuf,
}

impl CertStore {
    /// Open (creating if needed) the storage directory. Failure here is
    /// fatal to the process: nothing downstream can issue or serve
    /// certificates without it.
    pub fn open(dir: &Path) -> Result<Self> {
        if dir.to_string_lossy().contains("..") {
            anyhow::bail!("certificate directory path must not contain '..'");
        }
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create certificate directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn paths(&self, name: &str) -> CertPaths {
        CertPaths {
            cert_path: self.dir.join(format!("{name}.crt")),
            key_path: self.dir.join(format!("{name}.key")),
        }
    }

    /// Read a cert/key pair. Returns `None` unless both files exist and
    /// are readable; a half-present record counts as missing.
    pub fn read(&self, name: &str) -> Option<(String, String)> {
        let paths = self.paths(name);
        let cert = std::fs::read_to_string(&paths.cert_path).ok()?;
        let key = std::fs::read_to_string(&paths.key_path).ok()?;
        Some((cert, key))
    }

    /// Atomically replace a cert/key pair. The key lands first so a
    /// visible certificate always has its key on disk.
    pub fn write(&self, name: &str, cert_pem: &str, key_pem: &str) -> Result<CertPaths> {
        let paths = self.paths(name);
        write_atomic(&paths.key_path, key_pem.as_bytes(), true)?;
        write_atomic(&paths.cert_path, cert_pem.as_bytes(), false)?;
        debug!(name, path = %paths.cert_path.display(), "Certificate record written");
        Ok(paths)
    }

    pub fn read_selfsigned_blob(&self, host: &str) -> Option<(String, String)> {
        let path = self.blob_path(host);
        let raw = std::fs::read_to_string(path).ok()?;
        let blob: SelfSignedBlob = serde_json::from_str(&raw).ok()?;
        Some((blob.cert, blob.key))
    }

    pub fn write_selfsigned_blob(&self, host: &str, cert_pem: &str, key_pem: &str) -> Result<()> {
        let blob = SelfSignedBlob {
            cert: cert_pem.to_string(),
            key: key_pem.to_string(),
        };
        let contents = serde_json::to_string(&blob).context("failed to serialize cert blob")?;
        write_atomic(&self.blob_path(host), contents.as_bytes(), true)
    }

    fn blob_path(&self, host: &str) -> PathBuf {
        self.dir.join(format!("{host}_selfsigned.json"))
    }
}

fn write_atomic(path: &Path, contents: &[u8], restrict: bool) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents).with_context(|| format!("failed to write {}", tmp.display()))?;

    // Private keys are not for other users
    #[cfg(unix)]
    if restrict {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to set permissions on {}", tmp.display()))?;
    }
    #[cfg(not(unix))]
    let _ = restrict;

    std::fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Parse subject CN and DNS SANs out of a PEM certificate. Returns
/// `None` for anything that does not parse; a missing SAN extension
/// yields an empty SAN list, not an error.
pub fn parse_cert(pem: &str) -> Option<CertInfo> {
    let (_, doc) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).ok()?;
    let cert = doc.parse_x509().ok()?;

    let subject_cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(truncate_cn);

    let mut san_dns_names = Vec::new();
    if let Ok(Some(ext)) = cert.subject_alternative_name() {
        for name in &ext.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                san_dns_names.push(dns.to_lowercase());
            }
        }
    }

    let self_issued = cert.subject() == cert.issuer();

    Some(CertInfo {
        subject_cn,
        san_dns_names,
        self_issued,
    })
}

/// `notAfter` of a PEM certificate as a Unix timestamp
pub fn parse_not_after_unix(pem: &str) -> Option<i64> {
    let (_, doc) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).ok()?;
    let cert = doc.parse_x509().ok()?;
    Some(cert.validity().not_after.timestamp())
}

/// CN values occasionally arrive as a full subject line; keep only the
/// leading component.
fn truncate_cn(cn: &str) -> String {
    let end = cn
        .find(|c| c == ',' || c == '\n' || c == '/')
        .unwrap_or(cn.len());
    cn[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selfsigned;

    #[test]
    fn read_returns_none_for_partial_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("half.crt"), "not a cert").unwrap();
        assert!(store.read("half").is_none());
    }

    #[test]
    fn write_then_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertStore::open(dir.path()).unwrap();
        let paths = store.write("example.com", "CERT", "KEY").unwrap();
        assert!(paths.cert_path.ends_with("example.com.crt"));
        assert_eq!(
            store.read("example.com"),
            Some(("CERT".to_string(), "KEY".to_string()))
        );
    }

    #[test]
    fn open_rejects_traversal() {
        assert!(CertStore::open(Path::new("/tmp/../etc/certs")).is_err());
    }

    #[test]
    fn parse_cert_extracts_cn_and_sans() {
        let issued = selfsigned::issue(
            "gateway.test",
            &["gateway.test".to_string(), "*.gateway.test".to_string()],
        )
        .unwrap();
        let info = parse_cert(&issued.cert_pem).unwrap();
        assert_eq!(info.subject_cn.as_deref(), Some("gateway.test"));
        assert!(info
            .san_dns_names
            .contains(&"gateway.test".to_string()));
        assert!(info
            .san_dns_names
            .contains(&"*.gateway.test".to_string()));
        assert!(info.self_issued);
    }

    #[test]
    fn parse_cert_tolerates_garbage() {
        assert!(parse_cert("not a pem").is_none());
        assert!(parse_cert("-----BEGIN CERTIFICATE-----\naGk=\n-----END CERTIFICATE-----\n").is_none());
    }

    #[test]
    fn not_after_is_in_the_future_for_fresh_cert() {
        let issued = selfsigned::issue("fresh.test", &["fresh.test".to_string()]).unwrap();
        let not_after = parse_not_after_unix(&issued.cert_pem).unwrap();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        // Fresh self-signed certs are valid for more than a year
        assert!(not_after - now > 360 * 24 * 60 * 60);
    }

    #[test]
    fn selfsigned_blob_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertStore::open(dir.path()).unwrap();
        assert!(store.read_selfsigned_blob("api.example.com").is_none());
        store
            .write_selfsigned_blob("api.example.com", "CERT", "KEY")
            .unwrap();
        assert_eq!(
            store.read_selfsigned_blob("api.example.com"),
            Some(("CERT".to_string(), "KEY".to_string()))
        );
    }

    #[test]
    fn truncate_cn_cuts_at_separators() {
        assert_eq!(truncate_cn("example.com"), "example.com");
        assert_eq!(truncate_cn("example.com, O=Acme"), "example.com");
        assert_eq!(truncate_cn("example.com/emailAddress=x"), "example.com");
        assert_eq!(truncate_cn("example.com\nrest"), "example.com");
    }
}
