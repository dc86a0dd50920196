//! Certificate orchestration and SNI context cache
//!
//! Per-hostname policy:
//!
//! - **Local-like** hostnames share one combined self-signed record
//!   named `local-gateway` whose SAN set unions every configured
//!   local-like host plus wildcard SANs for their two-label bases.
//! - **Public** hostnames get ACME HTTP-01 certificates, reused while
//!   more than ten days of validity remain, with a self-signed
//!   fallback when issuance fails.
//!
//! `get_context` is the SNI entry point: it resolves a hostname to a
//! ready `rustls::ServerConfig`, caching parsed contexts for 24 hours
//! with an hourly expiry sweep and LRU-by-expiry eviction at overflow.

use crate::acme::AcmeClient;
use crate::cert_store::{self, CertStore};
use crate::events::{Event, EventBus, EventKind, SubscriptionGuard};
use crate::router::HostRouter;
use crate::selfsigned;
use anyhow::{Context, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use std::collections::{BTreeSet, HashMap};
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Canonical name of the combined local certificate record
pub const COMBINED_CERT_NAME: &str = "local-gateway";

const CONTEXT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const MAX_CONTEXTS: usize = 100;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const PUBLIC_REUSE_MIN_SECS: i64 = 10 * 24 * 60 * 60;

/// Whether a hostname is served by the combined local certificate.
///
/// TODO: anchor these matches to label boundaries once existing on-disk
/// SAN sets have migrated; plain substring matching also catches names
/// like `mylocal.com`.
pub fn is_local_like(hostname: &str) -> bool {
    let h = hostname.to_lowercase();
    h.contains(".local") || h.contains("local.") || h.contains("localhost") || h.contains(".console")
}

/// Wildcard SAN covering the two-label base of `name`, when it has one
pub fn wildcard_base(name: &str) -> Option<String> {
    let name = name.to_lowercase();
    if name == "localhost" {
        return None;
    }
    let labels: Vec<&str> = name.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() < 2 {
        return None;
    }
    Some(format!(
        "*.{}.{}",
        labels[labels.len() - 2],
        labels[labels.len() - 1]
    ))
}

/// Result of `ensure_cert`: PEM material plus its on-disk locations
pub struct EnsuredCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

struct CachedContext {
    config: Arc<ServerConfig>,
    expires_at: Instant,
}

/// Orchestrates certificate issuance and caches TLS contexts per SNI name
pub struct CertManager {
    store: Arc<CertStore>,
    acme: Arc<AcmeClient>,
    router: Arc<HostRouter>,
    contexts: Mutex<HashMap<String, CachedContext>>,
    issue_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl CertManager {
    pub fn new(store: Arc<CertStore>, acme: Arc<AcmeClient>, router: Arc<HostRouter>) -> Arc<Self> {
        Arc::new(Self {
            store,
            acme,
            router,
            contexts: Mutex::new(HashMap::new()),
            issue_locks: DashMap::new(),
        })
    }

    fn issue_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.issue_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Make sure a valid certificate for `hostname` exists on disk and
    /// return it. Concurrent calls for the same record are serialized;
    /// different hostnames proceed in parallel.
    pub async fn ensure_cert(&self, hostname: &str) -> Result<EnsuredCert> {
        let hostname = hostname.to_lowercase();
        if is_local_like(&hostname) {
            let lock = self.issue_lock(COMBINED_CERT_NAME);
            let _guard = lock.lock().await;
            self.ensure_combined(&hostname)
        } else {
            let lock = self.issue_lock(&hostname);
            let _guard = lock.lock().await;
            self.ensure_public(&hostname).await
        }
    }

    /// SAN set the combined record must cover for `requesting`: the
    /// requesting hostname, every configured local-like host and alt
    /// name, and a wildcard for each two-label base.
    pub fn target_san_set(&self, requesting: &str) -> BTreeSet<String> {
        let mut set = BTreeSet::new();
        set.insert(requesting.to_lowercase());
        for app in self.router.apps_snapshot() {
            for name in std::iter::once(&app.host).chain(app.alt_names.iter()) {
                let name = name.to_lowercase();
                if is_local_like(&name) {
                    set.insert(name);
                }
            }
        }
        let wildcards: Vec<String> = set.iter().filter_map(|n| wildcard_base(n)).collect();
        set.extend(wildcards);
        set
    }

    fn ensure_combined(&self, requesting: &str) -> Result<EnsuredCert> {
        let target = self.target_san_set(requesting);

        let existing = self.store.read(COMBINED_CERT_NAME);
        if let Some((cert_pem, key_pem)) = &existing {
            if let Some(info) = cert_store::parse_cert(cert_pem) {
                let sans: BTreeSet<String> = info.san_dns_names.iter().cloned().collect();
                if info.subject_cn.as_deref() == Some(COMBINED_CERT_NAME)
                    && target.is_subset(&sans)
                {
                    debug!(host = requesting, "Reusing combined local certificate");
                    let paths = self.store.paths(COMBINED_CERT_NAME);
                    return Ok(EnsuredCert {
                        cert_pem: cert_pem.clone(),
                        key_pem: key_pem.clone(),
                        cert_path: paths.cert_path,
                        key_path: paths.key_path,
                    });
                }
            }
        }

        // Regenerate with the union of the target set and any SANs the
        // previous record carried: coverage never shrinks on rewrite.
        let mut san_set = target;
        if let Some((old_cert, _)) = &existing {
            if let Some(info) = cert_store::parse_cert(old_cert) {
                san_set.extend(info.san_dns_names);
            }
        }
        let sans: Vec<String> = san_set.into_iter().collect();
        info!(host = requesting, sans = ?sans, "Issuing combined local certificate");
        let issued = selfsigned::issue(COMBINED_CERT_NAME, &sans)?;
        let paths = self
            .store
            .write(COMBINED_CERT_NAME, &issued.cert_pem, &issued.key_pem)?;
        self.invalidate_local_contexts();

        Ok(EnsuredCert {
            cert_pem: issued.cert_pem,
            key_pem: issued.key_pem,
            cert_path: paths.cert_path,
            key_path: paths.key_path,
        })
    }

    async fn ensure_public(&self, hostname: &str) -> Result<EnsuredCert> {
        if let Some((cert_pem, key_pem)) = self.store.read(hostname) {
            let info = cert_store::parse_cert(&cert_pem);
            let not_after = cert_store::parse_not_after_unix(&cert_pem);
            let now = unix_now();
            // A self-signed record is a previous fallback; retry ACME
            // instead of treating it as a real certificate.
            let acme_issued = info.map_or(false, |i| !i.self_issued);
            if acme_issued {
                match not_after {
                    Some(exp) if exp - now > PUBLIC_REUSE_MIN_SECS => {
                        debug!(host = hostname, "Reusing certificate on disk");
                        let paths = self.store.paths(hostname);
                        return Ok(EnsuredCert {
                            cert_pem,
                            key_pem,
                            cert_path: paths.cert_path,
                            key_path: paths.key_path,
                        });
                    }
                    Some(_) => {
                        info!(host = hostname, "Certificate expires within 10 days, reissuing")
                    }
                    None => warn!(host = hostname, "Unreadable certificate on disk, reissuing"),
                }
            }
        }

        let alt_names = self
            .router
            .get(hostname)
            .map(|a| a.alt_names.clone())
            .unwrap_or_default();

        match self.acme.issue(hostname, &alt_names).await {
            Ok((cert_pem, key_pem)) => {
                let paths = self.store.paths(hostname);
                Ok(EnsuredCert {
                    cert_pem,
                    key_pem,
                    cert_path: paths.cert_path,
                    key_path: paths.key_path,
                })
            }
            Err(e) => {
                warn!(host = hostname, error = %e, "ACME issuance failed, falling back to self-signed certificate");
                self.selfsigned_fallback(hostname)
            }
        }
    }

    fn selfsigned_fallback(&self, hostname: &str) -> Result<EnsuredCert> {
        if let Some((cert_pem, key_pem)) = self.store.read_selfsigned_blob(hostname) {
            let still_good = cert_store::parse_cert(&cert_pem)
                .map_or(false, |i| i.subject_cn.as_deref() == Some(hostname));
            if still_good {
                debug!(host = hostname, "Reusing cached self-signed fallback");
                let paths = self.store.write(hostname, &cert_pem, &key_pem)?;
                return Ok(EnsuredCert {
                    cert_pem,
                    key_pem,
                    cert_path: paths.cert_path,
                    key_path: paths.key_path,
                });
            }
        }

        let issued = selfsigned::issue(hostname, &[hostname.to_string()])?;
        self.store
            .write_selfsigned_blob(hostname, &issued.cert_pem, &issued.key_pem)?;
        let paths = self
            .store
            .write(hostname, &issued.cert_pem, &issued.key_pem)?;
        Ok(EnsuredCert {
            cert_pem: issued.cert_pem,
            key_pem: issued.key_pem,
            cert_path: paths.cert_path,
            key_path: paths.key_path,
        })
    }

    /// SNI entry point: resolve a servername to a TLS context, going
    /// through the TTL cache.
    pub async fn get_context(&self, servername: &str) -> Result<Arc<ServerConfig>> {
        let key = servername.to_lowercase();

        if let Some(config) = {
            let cache = self.contexts.lock();
            cache
                .get(&key)
                .filter(|entry| entry.expires_at > Instant::now())
                .map(|entry| Arc::clone(&entry.config))
        } {
            return Ok(config);
        }

        let ensured = self.ensure_cert(&key).await?;
        let config = build_server_config(&ensured.cert_pem, &ensured.key_pem)
            .with_context(|| format!("failed to build TLS context for '{key}'"))?;

        let mut cache = self.contexts.lock();
        if cache.len() >= MAX_CONTEXTS {
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(k, _)| k.clone())
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(
            key,
            CachedContext {
                config: Arc::clone(&config),
                expires_at: Instant::now() + CONTEXT_TTL,
            },
        );
        Ok(config)
    }

    /// Fallback context for connections without a usable SNI name
    pub async fn default_context(&self) -> Result<Arc<ServerConfig>> {
        self.get_context("localhost").await
    }

    fn invalidate_local_contexts(&self) {
        let mut cache = self.contexts.lock();
        cache.retain(|name, _| !is_local_like(name));
    }

    /// Hourly expiry sweep over the context cache
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                        let now = Instant::now();
                        let mut cache = manager.contexts.lock();
                        let before = cache.len();
                        cache.retain(|_, entry| entry.expires_at > now);
                        let evicted = before - cache.len();
                        if evicted > 0 {
                            debug!(evicted, "Swept expired TLS contexts");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Proactively regenerate the combined certificate when a
    /// local-like host appears, so its SAN set covers the new host
    /// before the first TLS handshake.
    pub fn watch_events(self: &Arc<Self>, bus: &EventBus) -> SubscriptionGuard {
        let manager = Arc::clone(self);
        bus.subscribe_kinds(&[EventKind::AppAdded, EventKind::AppStart], move |event| {
            let host = match event {
                Event::AppAdded { host } | Event::AppStart { host, .. } => host,
                _ => return,
            };
            if !is_local_like(&host) {
                return;
            }
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                if let Err(e) = manager.ensure_cert(&host).await {
                    warn!(host = %host, error = %e, "Failed to pre-issue combined certificate");
                }
            });
        })
    }
}

/// Build a rustls server config from PEM material. Fails when the key
/// does not match the certificate, so a cached context is always valid
/// for termination at the moment of insertion.
pub(crate) fn build_server_config(cert_pem: &str, key_pem: &str) -> Result<Arc<ServerConfig>> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_bytes()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to parse certificate PEM")?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in PEM");
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_bytes()))
        .context("failed to parse private key PEM")?
        .ok_or_else(|| anyhow::anyhow!("no private key found in PEM"))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("certificate/key mismatch")?;
    Ok(Arc::new(config))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::ChallengeTable;
    use crate::config::App;

    fn init_crypto() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }

    fn local_app(host: &str) -> App {
        App {
            host: host.to_string(),
            alt_names: Vec::new(),
            preserve_host: false,
            upstream: None,
            port: Some(3000),
            static_dir: None,
            cwd: None,
            start: None,
            health_url: None,
            health_interval_ms: None,
            disabled: false,
            auto_restart: None,
            auto_install: None,
        }
    }

    fn manager_with_apps(dir: &std::path::Path, hosts: &[&str]) -> Arc<CertManager> {
        let store = Arc::new(CertStore::open(dir).unwrap());
        let challenges = ChallengeTable::new();
        // Unreachable directory: every ACME attempt fails fast
        let acme = Arc::new(AcmeClient::new(
            "http://127.0.0.1:9/acme/directory".to_string(),
            Some("ops@example.com".to_string()),
            true,
            Arc::clone(&store),
            challenges,
        ));
        let router = HostRouter::new();
        let apps: Vec<App> = hosts.iter().map(|h| local_app(h)).collect();
        router.replace_all(&apps);
        CertManager::new(store, acme, router)
    }

    #[test]
    fn local_like_classification() {
        assert!(is_local_like("app.local.console"));
        assert!(is_local_like("LOCALHOST"));
        assert!(is_local_like("myhost.local"));
        assert!(is_local_like("local.dev.example"));
        // Known quirk of the substring heuristic
        assert!(is_local_like("mylocal.com"));
        assert!(!is_local_like("example.com"));
        assert!(!is_local_like("api.example.com"));
    }

    #[test]
    fn wildcard_base_rules() {
        assert_eq!(
            wildcard_base("api.local.console").as_deref(),
            Some("*.local.console")
        );
        assert_eq!(
            wildcard_base("local.console").as_deref(),
            Some("*.local.console")
        );
        assert_eq!(wildcard_base("localhost"), None);
        assert_eq!(wildcard_base("single"), None);
    }

    #[test]
    fn san_union_covers_all_local_apps() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_apps(
            dir.path(),
            &["local.console", "app.local.console", "api.local.console", "public.example.com"],
        );
        let set = manager.target_san_set("api.local.console");
        for expected in [
            "local.console",
            "app.local.console",
            "api.local.console",
            "*.local.console",
        ] {
            assert!(set.contains(expected), "missing {expected}");
        }
        assert!(!set.contains("public.example.com"));
    }

    #[tokio::test]
    async fn combined_cert_issued_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_apps(
            dir.path(),
            &["local.console", "app.local.console", "api.local.console"],
        );

        let first = manager.ensure_cert("api.local.console").await.unwrap();
        let info = cert_store::parse_cert(&first.cert_pem).unwrap();
        assert_eq!(info.subject_cn.as_deref(), Some(COMBINED_CERT_NAME));
        for san in ["local.console", "app.local.console", "api.local.console", "*.local.console"] {
            assert!(info.san_dns_names.contains(&san.to_string()), "missing {san}");
        }

        // Second lookup for a covered host reuses the record
        let second = manager.ensure_cert("app.local.console").await.unwrap();
        assert_eq!(first.cert_pem, second.cert_pem);
    }

    #[tokio::test]
    async fn adding_a_host_triggers_reissue_with_superset() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_apps(dir.path(), &["local.console", "app.local.console"]);
        let first = manager.ensure_cert("app.local.console").await.unwrap();

        // A new local-like app appears
        let apps: Vec<App> = ["local.console", "app.local.console", "db.local.console"]
            .iter()
            .map(|h| local_app(h))
            .collect();
        manager.router.replace_all(&apps);

        let second = manager.ensure_cert("db.local.console").await.unwrap();
        assert_ne!(first.cert_pem, second.cert_pem);

        let old = cert_store::parse_cert(&first.cert_pem).unwrap();
        let new = cert_store::parse_cert(&second.cert_pem).unwrap();
        assert!(new.san_dns_names.contains(&"db.local.console".to_string()));
        for san in &old.san_dns_names {
            assert!(new.san_dns_names.contains(san), "SAN regression: {san}");
        }
    }

    #[tokio::test]
    async fn combined_record_with_wrong_cn_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_apps(dir.path(), &["local.console"]);

        // Plant a record whose CN is not the canonical name
        let bogus = selfsigned::issue("imposter", &["local.console".to_string()]).unwrap();
        manager
            .store
            .write(COMBINED_CERT_NAME, &bogus.cert_pem, &bogus.key_pem)
            .unwrap();

        let ensured = manager.ensure_cert("local.console").await.unwrap();
        let info = cert_store::parse_cert(&ensured.cert_pem).unwrap();
        assert_eq!(info.subject_cn.as_deref(), Some(COMBINED_CERT_NAME));
    }

    #[tokio::test]
    async fn public_host_falls_back_to_selfsigned() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_apps(dir.path(), &["api.example.com"]);

        let ensured = manager.ensure_cert("api.example.com").await.unwrap();
        let info = cert_store::parse_cert(&ensured.cert_pem).unwrap();
        assert_eq!(info.subject_cn.as_deref(), Some("api.example.com"));
        assert_eq!(info.san_dns_names, vec!["api.example.com".to_string()]);
        assert!(info.self_issued);

        // The fallback is cached in the blob and reused
        let again = manager.ensure_cert("api.example.com").await.unwrap();
        assert_eq!(ensured.cert_pem, again.cert_pem);
        assert!(manager.store.read_selfsigned_blob("api.example.com").is_some());
    }

    #[tokio::test]
    async fn context_cache_returns_same_config() {
        init_crypto();
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_apps(dir.path(), &["local.console"]);

        let a = manager.get_context("LOCAL.CONSOLE").await.unwrap();
        let b = manager.get_context("local.console").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn default_context_is_localhost() {
        init_crypto();
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_apps(dir.path(), &[]);
        assert!(manager.default_context().await.is_ok());
    }
}
