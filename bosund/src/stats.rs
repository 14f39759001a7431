//! Telemetry module.
//!
//! Two jobs: a local stream socket where managed services push stat
//! updates (one small JSON document per connection, never answered),
//! and the publish timers that refresh the host collectors and fan out
//! `stats` lifecycle events for the notifier to pick up.

use crate::bus::Logger;
use crate::config::Bind;
use crate::hostinfo;
use crate::http::{self, BoundListener};
use crate::instance::{Instance, ServiceRun};
use crate::modules::{LifecycleEvent, LifecycleHandler, Module, StatsScope};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bosun_common::{apply_stat_update, StatUpdate, TelemetryDoc};
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::time::MissedTickBehavior;

/// Hard cap on one telemetry document.
const MAX_DOC_BYTES: usize = 10 * 1024;
/// A client gets this long between chunks before we work with what
/// arrived so far.
const IDLE_TIMEOUT: Duration = Duration::from_millis(500);

/// Telemetry addressed to this name goes into the host-wide list.
const HOST_SERVICE: &str = "host";

pub struct StatsModule {
    state: OnceLock<Arc<Instance>>,
}

impl StatsModule {
    pub fn new() -> Self {
        Self {
            state: OnceLock::new(),
        }
    }

    async fn start_service_timer(&self, instance: &Arc<Instance>, service: &Arc<ServiceRun>) {
        let period = service
            .config
            .stats
            .as_ref()
            .and_then(|stats| stats.period_secs)
            .unwrap_or(instance.config.stats.period_secs);
        let instance = instance.clone();
        let publish_target = service.clone();
        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(Duration::from_secs(period));
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first interval tick completes immediately; the
            // publish cadence starts one period in.
            ticks.tick().await;
            loop {
                ticks.tick().await;
                instance
                    .modules
                    .emit(&LifecycleEvent::Stats(StatsScope::Service(
                        publish_target.clone(),
                    )))
                    .await;
            }
        });
        let mut timer = service.stats_timer.lock().await;
        if let Some(old) = timer.replace(handle) {
            old.abort();
        }
    }

    async fn start_host_timer(&self, instance: &Arc<Instance>) {
        let period = instance.config.stats.period_secs;
        let runner = instance.clone();
        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(Duration::from_secs(period));
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                refresh_host_stats(&runner).await;
                runner
                    .modules
                    .emit(&LifecycleEvent::Stats(StatsScope::Host))
                    .await;
            }
        });
        let mut timer = instance.host.stats_timer.lock().await;
        if let Some(old) = timer.replace(handle) {
            old.abort();
        }
    }
}

impl Default for StatsModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for StatsModule {
    fn name(&self) -> &'static str {
        "stats"
    }

    async fn init(self: Arc<Self>, instance: &Arc<Instance>) -> Result<bool> {
        let logger = instance.bus.logger("Stats");
        let bind = instance.config.stats.bind()?;
        let publishes = instance.config.discord.is_some()
            || instance
                .services
                .iter()
                .any(|service| service.config.discord.is_some());
        let load = bind.is_some() || publishes;
        logger.debug(format!("Init (load: {load})")).await;
        if !load {
            return Ok(false);
        }

        if let Some(bind) = bind {
            // A failed bind deactivates this module; the daemon's own
            // HTTP listener is the only fatal one.
            let listener = http::bind(&bind)
                .await
                .with_context(|| format!("telemetry listener on {bind}"))?;
            if let Bind::Unix { path } = &bind {
                if nix::unistd::Uid::effective().is_root() {
                    http::chown_to_run_user(path, &instance.config.run)
                        .with_context(|| format!("telemetry socket {}", path.display()))?;
                }
            }
            logger.info(format!("Telemetry listener on {bind}")).await;
            tokio::spawn(accept_loop(listener, instance.clone(), logger));
        }

        if instance.config.discord.is_some() {
            self.start_host_timer(instance).await;
        }
        let _ = self.state.set(instance.clone());
        Ok(true)
    }

    fn lifecycle(self: Arc<Self>) -> Option<Arc<dyn LifecycleHandler>> {
        Some(self)
    }
}

#[async_trait]
impl LifecycleHandler for StatsModule {
    async fn on_event(&self, event: &LifecycleEvent) -> Result<()> {
        let Some(instance) = self.state.get() else {
            return Ok(());
        };
        if let LifecycleEvent::Start(service) = event {
            if service.config.discord.is_some() {
                self.start_service_timer(instance, service).await;
            }
        }
        Ok(())
    }
}

async fn accept_loop(listener: BoundListener, instance: Arc<Instance>, logger: Logger) {
    match listener {
        BoundListener::Tcp(listener) => loop {
            accept_one(&listener, &instance, &logger).await;
        },
        BoundListener::Unix(listener) => loop {
            accept_unix(&listener, &instance, &logger).await;
        },
    }
}

async fn accept_one(listener: &TcpListener, instance: &Arc<Instance>, logger: &Logger) {
    match listener.accept().await {
        Ok((stream, _peer)) => {
            let instance = instance.clone();
            let logger = logger.clone();
            tokio::spawn(async move {
                handle_connection(stream, &instance, &logger).await;
            });
        }
        Err(err) => {
            logger.warn(format!("Telemetry accept failed: {err}")).await;
        }
    }
}

async fn accept_unix(listener: &UnixListener, instance: &Arc<Instance>, logger: &Logger) {
    match listener.accept().await {
        Ok((stream, _peer)) => {
            let instance = instance.clone();
            let logger = logger.clone();
            tokio::spawn(async move {
                handle_connection(stream, &instance, &logger).await;
            });
        }
        Err(err) => {
            logger.warn(format!("Telemetry accept failed: {err}")).await;
        }
    }
}

/// Reads one document off the connection: until EOF, the idle timeout,
/// or the size cap, whichever comes first. The connection is never
/// written to.
async fn handle_connection<S>(mut stream: S, instance: &Arc<Instance>, logger: &Logger)
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match tokio::time::timeout(IDLE_TIMEOUT, stream.read(&mut chunk)).await {
            Err(_) => break,
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                if buf.len() + n > MAX_DOC_BYTES {
                    logger.warn("Dropping oversized telemetry document").await;
                    return;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            Ok(Err(err)) => {
                logger.warn(format!("Telemetry read failed: {err}")).await;
                return;
            }
        }
    }
    if buf.is_empty() {
        return;
    }
    let doc: TelemetryDoc = match serde_json::from_slice(&buf) {
        Ok(doc) => doc,
        Err(err) => {
            logger
                .warn(format!("Unparseable telemetry document: {err}"))
                .await;
            return;
        }
    };
    logger
        .data(format!("Telemetry {}", String::from_utf8_lossy(&buf)))
        .await;
    apply_doc(instance, logger, doc).await;
}

/// Upserts or deletes stats for the addressed scope. The sender never
/// hears back; unknown services are only a logged warning.
async fn apply_doc(instance: &Arc<Instance>, logger: &Logger, doc: TelemetryDoc) {
    if doc.service_name == HOST_SERVICE {
        let mut list = instance.host.stats.lock().await;
        for update in doc.stats {
            apply_stat_update(&mut list, update);
        }
    } else if let Some(service) = instance.service(&doc.service_name) {
        let mut list = service.stats.lock().await;
        for update in doc.stats {
            apply_stat_update(&mut list, update);
        }
    } else {
        logger
            .warn(format!(
                "Dropping telemetry for unknown service {:?}",
                doc.service_name
            ))
            .await;
    }
}

/// Refreshes the host-wide stat list from the collectors. A collector
/// that fails drops out of the list until it recovers.
async fn refresh_host_stats(instance: &Arc<Instance>) {
    let disk = instance.config.stats.disk.clone();
    let local = instance.local();
    let collected: [(&str, &str, Result<String>); 4] = [
        ("uptime", "Uptime", hostinfo::uptime().await),
        ("load", "Load average", hostinfo::loadavg().await),
        ("memory", "Memory", hostinfo::meminfo().await),
        ("disk", "Disk usage", hostinfo::diskinfo(local.as_ref(), &disk).await),
    ];

    let mut list = instance.host.stats.lock().await;
    for (id, description, outcome) in collected {
        let value = match outcome {
            Ok(value) => Some(Value::String(value)),
            Err(err) => {
                tracing::debug!("host collector {id} failed: {err:#}");
                None
            }
        };
        apply_stat_update(
            &mut list,
            StatUpdate {
                id: id.into(),
                description: Some(description.into()),
                value,
            },
        );
    }
}
