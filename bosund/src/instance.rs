//! Shared daemon state: configuration, the event bus, per-service
//! runtime state and the command runners. Modules receive one `Arc` of
//! this at init and keep what they need.

use crate::bus::Bus;
use crate::config::{Config, ServiceConfig};
use crate::db::Db;
use crate::http::RouteHandler;
use crate::modules::ModuleRuntime;
use crate::root::{CommandRunner, LocalRunner};
use anyhow::{Context, Result};
use bosun_common::Stat;
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// Repository identity detected from a service's working copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitState {
    pub repo: String,
    pub branch: String,
}

/// Runtime state for one configured service.
pub struct ServiceRun {
    pub config: ServiceConfig,
    /// Set by the git module once detection succeeded; `None` means the
    /// service is not watched for pushes.
    pub git: Mutex<Option<GitState>>,
    pub stats: Mutex<Vec<Stat>>,
    /// Chat message reused for stats updates, when reuse is enabled.
    pub discord_message_id: Mutex<Option<String>>,
    pub stats_timer: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceRun {
    fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            git: Mutex::new(None),
            stats: Mutex::new(Vec::new()),
            discord_message_id: Mutex::new(None),
            stats_timer: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
}

/// Host-wide runtime state, the analogue of [`ServiceRun`] for the
/// machine itself.
pub struct HostRun {
    pub hostname: String,
    pub stats: Mutex<Vec<Stat>>,
    /// Combined-mode chat message, reused across stats publishes.
    pub discord_message_id: Mutex<Option<String>>,
    pub stats_timer: Mutex<Option<JoinHandle<()>>>,
}

pub struct Instance {
    pub config: Config,
    pub bus: Bus,
    pub modules: ModuleRuntime,
    pub services: Vec<Arc<ServiceRun>>,
    pub host: HostRun,
    routes: RwLock<Vec<(String, Arc<dyn RouteHandler>)>>,
    db: OnceLock<Db>,
    root: OnceLock<Arc<dyn CommandRunner>>,
    local: Arc<dyn CommandRunner>,
}

impl Instance {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let hostname = nix::unistd::gethostname()
            .context("cannot read hostname")?
            .to_string_lossy()
            .into_owned();
        let bus = Bus::new(config.log.clone());
        let services = config
            .services
            .iter()
            .map(|service| Arc::new(ServiceRun::new(service.clone())))
            .collect();
        Ok(Arc::new(Self {
            config,
            bus,
            modules: ModuleRuntime::new(),
            services,
            host: HostRun {
                hostname,
                stats: Mutex::new(Vec::new()),
                discord_message_id: Mutex::new(None),
                stats_timer: Mutex::new(None),
            },
            routes: RwLock::new(Vec::new()),
            db: OnceLock::new(),
            root: OnceLock::new(),
            local: Arc::new(LocalRunner),
        }))
    }

    pub fn service(&self, name: &str) -> Option<Arc<ServiceRun>> {
        self.services
            .iter()
            .find(|service| service.name() == name)
            .cloned()
    }

    /// Privileged runner, present once the helper handshake completed.
    pub fn root(&self) -> Option<Arc<dyn CommandRunner>> {
        self.root.get().cloned()
    }

    pub fn set_root(&self, runner: Arc<dyn CommandRunner>) {
        let _ = self.root.set(runner);
    }

    /// Unprivileged in-process runner.
    pub fn local(&self) -> Arc<dyn CommandRunner> {
        self.local.clone()
    }

    /// Key-value store, present when the db module is active.
    pub fn db(&self) -> Option<&Db> {
        self.db.get()
    }

    pub fn set_db(&self, db: Db) {
        let _ = self.db.set(db);
    }

    pub async fn add_route(&self, path: String, handler: Arc<dyn RouteHandler>) {
        let mut routes = self.routes.write().await;
        routes.push((path, handler));
    }

    /// Exact-match lookup; first registration wins.
    pub async fn route(&self, path: &str) -> Option<Arc<dyn RouteHandler>> {
        let routes = self.routes.read().await;
        routes
            .iter()
            .find(|(route, _)| route == path)
            .map(|(_, handler)| handler.clone())
    }
}
