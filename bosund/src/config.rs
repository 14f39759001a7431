//! Daemon configuration, loaded from a TOML file at startup.
//!
//! Configuration problems are fatal: the daemon refuses to start rather
//! than run with a partial setup.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Resolved listen address for the HTTP server or the telemetry socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bind {
    Inet { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl std::fmt::Display for Bind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bind::Inet { host, port } => write!(f, "{host}:{port}"),
            Bind::Unix { path } => write!(f, "unix:{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub log: LogFlags,
    pub http: HttpConfig,
    #[serde(default)]
    pub root: RootConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub discord: Option<DiscordConfig>,
    #[serde(default = "default_modules")]
    pub modules: Vec<String>,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceConfig>,
}

/// Identity the daemon drops to after binding its sockets.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_run_user")]
    pub user: String,
    #[serde(default = "default_run_user")]
    pub group: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            user: default_run_user(),
            group: default_run_user(),
        }
    }
}

/// Per-severity gates for the event bus. A disabled severity is
/// dropped outright: neither printed nor offered to listeners.
#[derive(Debug, Clone, Deserialize)]
pub struct LogFlags {
    #[serde(default)]
    pub data: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_true")]
    pub info: bool,
    #[serde(default = "default_true")]
    pub warn: bool,
    #[serde(default = "default_true")]
    pub error: bool,
}

impl Default for LogFlags {
    fn default() -> Self {
        Self {
            data: false,
            debug: false,
            info: true,
            warn: true,
            error: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<PathBuf>,
}

impl HttpConfig {
    pub fn bind(&self) -> Result<Bind> {
        resolve_bind(&self.host, &self.port, &self.path)?
            .context("[http] needs either host and port or a socket path")
    }
}

/// Settings for the privileged helper process.
#[derive(Debug, Clone, Deserialize)]
pub struct RootConfig {
    /// Helper binary; defaults to `bosun-root` next to the daemon binary.
    pub helper: Option<PathBuf>,
    #[serde(default = "default_root_timeout")]
    pub timeout_secs: u64,
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            helper: None,
            timeout_secs: default_root_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<PathBuf>,
    #[serde(default = "default_stats_period")]
    pub period_secs: u64,
    #[serde(default)]
    pub disk: DiskConfig,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            path: None,
            period_secs: default_stats_period(),
            disk: DiskConfig::default(),
        }
    }
}

impl StatsConfig {
    /// `None` when no telemetry listener is configured at all.
    pub fn bind(&self) -> Result<Option<Bind>> {
        resolve_bind(&self.host, &self.port, &self.path)
    }
}

/// Filters for which `df` rows make it into the host disk stat.
#[derive(Debug, Clone, Deserialize)]
pub struct DiskConfig {
    #[serde(default = "default_disk_devs")]
    pub devs: Vec<String>,
    #[serde(default = "default_disk_mnts")]
    pub mnts: Vec<String>,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            devs: default_disk_devs(),
            mnts: default_disk_mnts(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DbConfig {
    pub dir: Option<PathBuf>,
}

/// Daemon-wide webhook settings; `path` prefixes every service hook.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GithubConfig {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordConfig {
    pub url: String,
    #[serde(default)]
    pub reuse_stats_message: bool,
    #[serde(default = "default_true")]
    pub greet: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    /// Working copy the git module pulls in; required when [service.git] is set.
    pub path: Option<PathBuf>,
    /// Hints for the reverse proxy in front; reported at startup, not
    /// acted on.
    pub location: Option<String>,
    pub proxy: Option<String>,
    pub git: Option<GitConfig>,
    pub github: Option<GithubHook>,
    pub discord: Option<DiscordConfig>,
    pub stats: Option<ServiceStatsConfig>,
}

/// Auto-deploy behavior for one service.
#[derive(Debug, Clone, Deserialize)]
pub struct GitConfig {
    /// Override for the detected repository name.
    pub repo: Option<String>,
    /// Override for the detected branch.
    pub branch: Option<String>,
    #[serde(default)]
    pub pull: bool,
    #[serde(default)]
    pub restart: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubHook {
    pub path: String,
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceStatsConfig {
    pub period_secs: Option<u64>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.http.bind()?;
        self.stats.bind()?;
        if self.stats.period_secs == 0 {
            bail!("[stats] period_secs must be at least 1");
        }

        let mut names = HashSet::new();
        let mut routes = HashSet::new();
        for service in &self.services {
            if service.name.is_empty() {
                bail!("every [[service]] needs a non-empty name");
            }
            if service.name == "host" {
                bail!("the service name \"host\" is reserved for host-wide stats");
            }
            if !names.insert(service.name.as_str()) {
                bail!("duplicate service name {:?}", service.name);
            }
            if service
                .stats
                .as_ref()
                .is_some_and(|stats| stats.period_secs == Some(0))
            {
                bail!(
                    "service {:?} sets a zero stats period; use at least 1 second",
                    service.name
                );
            }
            if service.git.is_some() && service.path.is_none() {
                bail!(
                    "service {:?} configures git but has no path to a working copy",
                    service.name
                );
            }
            if service.github.is_some() {
                let route = self.hook_path(service);
                if !route.starts_with('/') {
                    bail!(
                        "webhook path {:?} for service {:?} must start with '/'",
                        route,
                        service.name
                    );
                }
                if !routes.insert(route.clone()) {
                    bail!("webhook path {route:?} is used by more than one service");
                }
            }
        }
        Ok(())
    }

    /// Full HTTP route for a service's webhook: daemon-wide prefix plus
    /// the per-service path.
    pub fn hook_path(&self, service: &ServiceConfig) -> String {
        let base = self.github.path.as_deref().unwrap_or("");
        let sub = service
            .github
            .as_ref()
            .map(|hook| hook.path.as_str())
            .unwrap_or("");
        format!("{base}{sub}")
    }
}

fn resolve_bind(
    host: &Option<String>,
    port: &Option<u16>,
    path: &Option<PathBuf>,
) -> Result<Option<Bind>> {
    match (host, port, path) {
        (Some(host), Some(port), None) => Ok(Some(Bind::Inet {
            host: host.clone(),
            port: *port,
        })),
        (None, None, Some(path)) => Ok(Some(Bind::Unix { path: path.clone() })),
        (None, None, None) => Ok(None),
        _ => bail!("bind address needs either host and port or a socket path, not a mix"),
    }
}

fn default_true() -> bool {
    true
}

fn default_run_user() -> String {
    "www-data".into()
}

fn default_root_timeout() -> u64 {
    60
}

fn default_stats_period() -> u64 {
    300
}

fn default_disk_devs() -> Vec<String> {
    vec!["/dev/sda".into()]
}

fn default_disk_mnts() -> Vec<String> {
    vec!["/".into()]
}

fn default_modules() -> Vec<String> {
    ["db", "stats", "git", "github", "discord"]
        .into_iter()
        .map(String::from)
        .collect()
}
