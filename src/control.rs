//! Control-plane mutation API
//!
//! The admin collaborator drives app mutations through this surface.
//! Every committed mutation rewrites the config file atomically and
//! publishes the corresponding events; the persisted file and the
//! in-memory config are equal after every commit, and a failed write
//! rolls the in-memory change back.

use crate::config::{App, Config};
use crate::events::{Event, EventBus};
use crate::supervisor::Supervisor;
use anyhow::Result;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// The live configuration, shared with the host router
pub type SharedConfig = Arc<RwLock<Config>>;

pub struct ControlPlane {
    config: SharedConfig,
    config_path: PathBuf,
    supervisor: Arc<Supervisor>,
    bus: EventBus,
}

impl ControlPlane {
    pub fn new(
        config: Config,
        config_path: PathBuf,
        supervisor: Arc<Supervisor>,
        bus: EventBus,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
            supervisor,
            bus,
        }
    }

    pub fn shared_config(&self) -> SharedConfig {
        Arc::clone(&self.config)
    }

    /// Bearer token for the admin collaborator: environment override,
    /// then the config value, then a generated one.
    pub fn admin_token(&self) -> String {
        if let Ok(token) = std::env::var("GATEWAY_ADMIN_TOKEN") {
            if !token.is_empty() {
                return token;
            }
        }
        if let Some(token) = self.config.read().admin_token.clone() {
            return token;
        }
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin token (set adminToken to pin a fixed value)");
        token
    }

    pub fn add_app(&self, app: App) -> Result<()> {
        app.validate()?;
        let key = app.key();
        {
            let mut config = self.config.write();
            if config.apps.iter().any(|a| a.key() == key) {
                anyhow::bail!("duplicate host: {key}");
            }
            config.apps.push(app);
            if let Err(e) = config.save(&self.config_path) {
                config.apps.pop();
                return Err(e);
            }
        }
        info!(host = %key, "App added");
        self.bus.emit(Event::AppAdded { host: key });
        self.bus.emit(Event::ConfigSaved);
        Ok(())
    }

    pub fn update_app(&self, app: App) -> Result<()> {
        app.validate()?;
        let key = app.key();
        {
            let mut config = self.config.write();
            let Some(index) = config.apps.iter().position(|a| a.key() == key) else {
                anyhow::bail!("unknown host: {key}");
            };
            let previous = std::mem::replace(&mut config.apps[index], app);
            if let Err(e) = config.save(&self.config_path) {
                config.apps[index] = previous;
                return Err(e);
            }
        }
        info!(host = %key, "App updated");
        self.bus.emit(Event::AppUpdated { host: key });
        self.bus.emit(Event::ConfigSaved);
        Ok(())
    }

    /// Remove an app, forcing its child to stop first
    pub async fn remove_app(&self, host: &str) -> Result<App> {
        let key = host.to_lowercase();
        if !self.config.read().apps.iter().any(|a| a.key() == key) {
            anyhow::bail!("unknown host: {key}");
        }

        self.supervisor.remove(&key).await;

        let removed = {
            let mut config = self.config.write();
            let Some(index) = config.apps.iter().position(|a| a.key() == key) else {
                anyhow::bail!("unknown host: {key}");
            };
            let removed = config.apps.remove(index);
            if let Err(e) = config.save(&self.config_path) {
                config.apps.insert(index, removed);
                return Err(e);
            }
            removed
        };
        info!(host = %key, "App removed");
        self.bus.emit(Event::AppRemoved { host: key });
        self.bus.emit(Event::ConfigSaved);
        Ok(removed)
    }

    pub async fn start_app(&self, host: &str) -> Result<()> {
        self.supervisor.start(host).await
    }

    pub async fn stop_app(&self, host: &str) {
        self.supervisor.stop(host).await;
    }

    pub async fn restart_app(&self, host: &str) -> Result<()> {
        self.supervisor.restart(host).await
    }
}
