//! Case-insensitive Host header routing
//!
//! A snapshot map from lowercased hostname to [`App`], rebuilt whenever
//! the control plane mutates the app list. Request handlers read the
//! current map atomically; an in-flight request keeps the snapshot it
//! looked up.

use crate::config::App;
use crate::control::SharedConfig;
use crate::events::{EventBus, EventKind, SubscriptionGuard};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub struct HostRouter {
    apps: RwLock<HashMap<String, App>>,
}

impl HostRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            apps: RwLock::new(HashMap::new()),
        })
    }

    /// Swap in a freshly built map
    pub fn replace_all(&self, apps: &[App]) {
        let map: HashMap<String, App> = apps.iter().map(|a| (a.key(), a.clone())).collect();
        debug!(apps = map.len(), "Host map rebuilt");
        *self.apps.write() = map;
    }

    /// Exact lookup by lowercased hostname
    pub fn get(&self, host: &str) -> Option<App> {
        self.apps.read().get(&host.to_lowercase()).cloned()
    }

    /// Lookup from a raw Host header value: drops any port suffix and
    /// folds case.
    pub fn lookup(&self, host_header: &str) -> Option<App> {
        self.get(strip_port(host_header))
    }

    pub fn hosts(&self) -> Vec<String> {
        self.apps.read().keys().cloned().collect()
    }

    pub fn apps_snapshot(&self) -> Vec<App> {
        self.apps.read().values().cloned().collect()
    }

    /// Rebuild the map from the shared config whenever an app mutation
    /// is published.
    pub fn attach(self: &Arc<Self>, bus: &EventBus, config: SharedConfig) -> SubscriptionGuard {
        let router = Arc::clone(self);
        bus.subscribe_kinds(
            &[
                EventKind::AppAdded,
                EventKind::AppUpdated,
                EventKind::AppRemoved,
            ],
            move |_| {
                let apps = config.read().apps.clone();
                router.replace_all(&apps);
            },
        )
    }
}

/// Host header value without its port suffix. Handles bracketed IPv6
/// literals.
pub(crate) fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    host.split(':').next().unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(host: &str) -> App {
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
    fn lookup_is_case_insensitive() {
        let router = HostRouter::new();
        router.replace_all(&[app("App.Example.Com")]);

        assert!(router.lookup("app.example.com").is_some());
        assert!(router.lookup("APP.EXAMPLE.COM").is_some());
        assert!(router.lookup("App.Example.Com").is_some());
        assert!(router.lookup("other.example.com").is_none());
    }

    #[test]
    fn lookup_drops_port_suffix() {
        let router = HostRouter::new();
        router.replace_all(&[app("app.example.com")]);

        assert!(router.lookup("app.example.com:4443").is_some());
        assert!(router.lookup("APP.EXAMPLE.COM:8080").is_some());
    }

    #[test]
    fn strip_port_handles_ipv6() {
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("example.com:443"), "example.com");
        assert_eq!(strip_port("[::1]:443"), "::1");
        assert_eq!(strip_port("[::1]"), "::1");
    }

    #[test]
    fn replace_all_swaps_map() {
        let router = HostRouter::new();
        router.replace_all(&[app("a.test"), app("b.test")]);
        assert_eq!(router.hosts().len(), 2);

        router.replace_all(&[app("c.test")]);
        assert!(router.lookup("a.test").is_none());
        assert!(router.lookup("c.test").is_some());
    }
}
