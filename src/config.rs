use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default plain-HTTP listener port (`GATEWAY_HTTP_PORT` overrides)
pub const DEFAULT_HTTP_PORT: u16 = 8080;
/// Default TLS listener port (`GATEWAY_HTTPS_PORT` overrides)
pub const DEFAULT_HTTPS_PORT: u16 = 4443;

const DEFAULT_HEALTH_INTERVAL_MS: u64 = 15_000;

/// Global configuration, loaded from a JSON file on start.
///
/// Top-level keys other than `apps` are preserved verbatim across
/// rewrites: the modeled fields round-trip through serde and anything
/// unknown is carried in `extra`.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Contact email for ACME account registration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Whether the operator agreed to the CA's terms of service
    #[serde(default)]
    pub agree_to_terms: bool,

    /// Bearer token for the admin collaborator (`GATEWAY_ADMIN_TOKEN` overrides)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,

    #[serde(default)]
    pub acme: AcmeSettings,

    #[serde(default)]
    pub apps: Vec<App>,

    /// Unknown top-level keys, preserved verbatim when the file is rewritten
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AcmeSettings {
    /// ACME directory URL
    #[serde(default = "default_directory_url")]
    pub directory_url: String,

    /// Directory holding certificates, keys and the ACME account
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
}

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            directory_url: default_directory_url(),
            config_dir: default_config_dir(),
        }
    }
}

fn default_directory_url() -> String {
    "https://acme-v02.api.letsencrypt.org/directory".to_string()
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("./certs")
}

/// Upstream scheme for an explicit backend address
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamScheme {
    Http,
    Https,
}

impl fmt::Display for UpstreamScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamScheme::Http => write!(f, "http"),
            UpstreamScheme::Https => write!(f, "https"),
        }
    }
}

/// Explicit backend address for a proxied app
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Upstream {
    pub scheme: UpstreamScheme,
    pub host: String,
    pub port: u16,

    /// For HTTPS upstreams: verify the upstream certificate (default true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_unauthorized: Option<bool>,
}

impl Upstream {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn loopback(port: u16) -> Self {
        Self {
            scheme: UpstreamScheme::Http,
            host: "127.0.0.1".to_string(),
            port,
            reject_unauthorized: None,
        }
    }
}

/// How an app answers requests: static files or a proxied upstream.
/// `staticDir` wins over `upstream`/`port` at request time.
#[derive(Debug, Clone)]
pub enum ServeMode {
    Static(PathBuf),
    Proxy(Upstream),
}

/// A routed (and optionally supervised) application, keyed by `host`
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct App {
    /// Canonical public hostname; immutable identifier
    pub host: String,

    /// Additional DNS names included in issued certificates as SANs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alt_names: Vec<String>,

    /// Forward the original Host header to the upstream instead of
    /// rewriting it to the upstream authority
    #[serde(default)]
    pub preserve_host: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<Upstream>,

    /// Shorthand for `http://127.0.0.1:<port>` when `upstream` is absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Serve files from this directory instead of proxying
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_dir: Option<PathBuf>,

    /// Working directory for the supervised child
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Command line for supervision; absent means externally managed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_interval_ms: Option<u64>,

    /// The supervisor refuses to start a disabled app; the router still matches it
    #[serde(default)]
    pub disabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_restart: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_install: Option<bool>,
}

impl App {
    /// Stable routing key: the lowercased hostname
    pub fn key(&self) -> String {
        self.host.to_lowercase()
    }

    pub fn auto_restart(&self) -> bool {
        self.auto_restart.unwrap_or(true)
    }

    pub fn auto_install(&self) -> bool {
        self.auto_install.unwrap_or(true)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms.unwrap_or(DEFAULT_HEALTH_INTERVAL_MS))
    }

    /// Static branch wins over proxy branch when both are configured
    pub fn serve_mode(&self) -> Option<ServeMode> {
        if let Some(dir) = &self.static_dir {
            return Some(ServeMode::Static(dir.clone()));
        }
        if let Some(upstream) = &self.upstream {
            return Some(ServeMode::Proxy(upstream.clone()));
        }
        self.port.map(|p| ServeMode::Proxy(Upstream::loopback(p)))
    }

    /// The local TCP port a supervised child is expected to own
    pub fn effective_port(&self) -> Option<u16> {
        self.port.or_else(|| self.upstream.as_ref().map(|u| u.port))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.trim().is_empty() {
            anyhow::bail!("app host must not be empty");
        }
        if !self
            .host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        {
            anyhow::bail!("invalid characters in host '{}'", self.host);
        }
        if self.port == Some(0) {
            anyhow::bail!("app '{}' has invalid port 0", self.host);
        }
        if let Some(upstream) = &self.upstream {
            if upstream.port == 0 || upstream.host.trim().is_empty() {
                anyhow::bail!("app '{}' has an invalid upstream address", self.host);
            }
        }
        Ok(())
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for app in &self.apps {
            app.validate()?;
            if !seen.insert(app.key()) {
                anyhow::bail!("duplicate host in config: {}", app.key());
            }
        }
        Ok(())
    }

    /// Rewrite the config file via write-to-temp + rename so readers
    /// never observe a partially written file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let contents = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, contents.as_bytes())
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }
}

/// Plain HTTP listener port, from `GATEWAY_HTTP_PORT` or the default
pub fn http_port() -> u16 {
    env_port("GATEWAY_HTTP_PORT", DEFAULT_HTTP_PORT)
}

/// TLS listener port, from `GATEWAY_HTTPS_PORT` or the default
pub fn https_port() -> u16 {
    env_port("GATEWAY_HTTPS_PORT", DEFAULT_HTTPS_PORT)
}

fn env_port(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_app(host: &str) -> App {
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

    #[test]
    fn parses_camel_case_fields() {
        let raw = r#"{
            "email": "ops@example.com",
            "agreeToTerms": true,
            "acme": { "directoryUrl": "https://acme.test/dir", "configDir": "/tmp/certs" },
            "apps": [
                {
                    "host": "App.Example.Com",
                    "altNames": ["www.example.com"],
                    "preserveHost": true,
                    "upstream": { "scheme": "https", "host": "10.0.0.5", "port": 8443, "rejectUnauthorized": false },
                    "healthUrl": "http://127.0.0.1:3000/healthz",
                    "healthIntervalMs": 5000
                }
            ]
        }"#;

        let config: Config = serde_json::from_str(raw).unwrap();
        assert!(config.agree_to_terms);
        assert_eq!(config.acme.directory_url, "https://acme.test/dir");

        let app = &config.apps[0];
        assert_eq!(app.key(), "app.example.com");
        assert_eq!(app.alt_names, vec!["www.example.com"]);
        assert!(app.preserve_host);
        assert_eq!(app.health_interval(), Duration::from_millis(5000));
        let upstream = app.upstream.as_ref().unwrap();
        assert_eq!(upstream.scheme, UpstreamScheme::Https);
        assert_eq!(upstream.reject_unauthorized, Some(false));
    }

    #[test]
    fn defaults_apply() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(!config.agree_to_terms);
        assert!(config.apps.is_empty());
        assert_eq!(
            config.acme.directory_url,
            "https://acme-v02.api.letsencrypt.org/directory"
        );

        let app = sample_app("a.test");
        assert!(app.auto_restart());
        assert!(app.auto_install());
        assert_eq!(app.health_interval(), Duration::from_millis(15_000));
    }

    #[test]
    fn port_shorthand_implies_loopback_upstream() {
        let app = sample_app("a.test");
        match app.serve_mode() {
            Some(ServeMode::Proxy(upstream)) => {
                assert_eq!(upstream.scheme, UpstreamScheme::Http);
                assert_eq!(upstream.host, "127.0.0.1");
                assert_eq!(upstream.port, 3000);
            }
            other => panic!("expected proxy mode, got {:?}", other.is_some()),
        }
    }

    #[test]
    fn static_dir_wins_over_port() {
        let mut app = sample_app("a.test");
        app.static_dir = Some(PathBuf::from("/srv/site"));
        assert!(matches!(app.serve_mode(), Some(ServeMode::Static(_))));
    }

    #[test]
    fn validate_rejects_duplicate_hosts() {
        let config = Config {
            email: None,
            agree_to_terms: false,
            admin_token: None,
            acme: AcmeSettings::default(),
            apps: vec![sample_app("App.Test"), sample_app("app.test")],
            extra: serde_json::Map::new(),
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate host"));
    }

    #[test]
    fn save_preserves_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        let raw = r#"{ "email": "ops@example.com", "customFlag": true, "nested": { "a": 1 }, "apps": [] }"#;
        std::fs::write(&path, raw).unwrap();

        let mut config = Config::load(&path).unwrap();
        config.apps.push(sample_app("added.test"));
        config.save(&path).unwrap();

        let reloaded: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reloaded["customFlag"], serde_json::json!(true));
        assert_eq!(reloaded["nested"]["a"], serde_json::json!(1));
        assert_eq!(reloaded["apps"][0]["host"], serde_json::json!("added.test"));
    }

    #[test]
    fn env_port_fallback() {
        // Unset in the test environment, so the defaults apply
        assert_eq!(env_port("GATEWAY_TEST_UNSET_PORT", 8080), 8080);
    }
}
