//! Bosun Supervisor
//!
//! Unprivileged daemon bridging inbound automation triggers (GitHub
//! webhooks, telemetry pushes) to privileged local actions (git pulls,
//! unit restarts, performed by the bosun-root helper) and to outbound
//! chat notifications. Boot order matters: the helper is spawned and
//! sockets are bound while still privileged, then the process drops to
//! the configured run user for the rest of its life.

mod bus;
mod config;
mod db;
mod discord;
mod git;
mod github;
mod hostinfo;
mod http;
mod instance;
mod modules;
mod root;
mod stats;

use crate::bus::Logger;
use crate::config::{Bind, Config, RunConfig};
use crate::instance::{Instance, ServiceRun};
use crate::modules::{LifecycleEvent, Module};
use crate::root::RootLink;
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "bosund")]
#[command(about = "Deploy and notification daemon")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "/etc/bosun/bosun.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout)
        .init();

    let config = Config::load(&cli.config)?;
    let instance = Instance::new(config)?;
    let logger = instance.bus.root_logger();

    // The helper must be up before privileges go away; without it no
    // privileged command can ever run.
    let helper = match instance.config.root.helper.clone() {
        Some(path) => path,
        None => root::sibling_helper_path()?,
    };
    let link = RootLink::spawn(
        &helper,
        Duration::from_secs(instance.config.root.timeout_secs),
    )
    .await
    .context("privileged helper failed to start")?;
    instance.set_root(Arc::new(link));
    logger
        .info(format!("Helper {} ready", helper.display()))
        .await;

    // Bind the front door while still able to claim privileged ports.
    let http_bind = instance.config.http.bind()?;
    let listener = http::bind(&http_bind).await?;

    load_modules(&instance).await?;

    if let Bind::Unix { path } = &http_bind {
        if nix::unistd::Uid::effective().is_root() {
            http::chown_to_run_user(path, &instance.config.run)
                .with_context(|| format!("http socket {}", path.display()))?;
        }
    }
    drop_privileges(&instance.config.run)?;

    logger
        .info(format!(
            "Listening on {http_bind}, modules: {}",
            instance.modules.active_names().await.join(", ")
        ))
        .await;

    let app = http::router(instance.clone());
    let serve = tokio::spawn(http::serve(listener, app));

    for service in instance.services.clone() {
        announce_service(&logger, &service).await;
        instance
            .modules
            .emit(&LifecycleEvent::Start(service))
            .await;
    }

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("cannot install SIGTERM handler")?;
    tokio::select! {
        result = serve => {
            match result {
                Ok(Err(err)) => error!("http server failed: {err}"),
                Err(err) => error!("http server task failed: {err}"),
                Ok(Ok(())) => {}
            }
            bail!("http server stopped unexpectedly");
        }
        _ = signal::ctrl_c() => info!("Received Ctrl+C; shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM; shutting down"),
    }
    Ok(())
}

/// Startup lines for one service. The location and proxy hints are for
/// whatever reverse proxy sits in front; this daemon only reports them.
async fn announce_service(logger: &Logger, service: &Arc<ServiceRun>) {
    logger
        .info(format!("Starting service {}", service.name()))
        .await;
    if service.config.location.is_some() || service.config.proxy.is_some() {
        logger
            .debug(format!(
                "Service {} at location {} behind proxy {}",
                service.name(),
                service.config.location.as_deref().unwrap_or("-"),
                service.config.proxy.as_deref().unwrap_or("-"),
            ))
            .await;
    }
}

/// Instantiates the configured module list in order. An unknown name is
/// a configuration error; a failing init only disables that module.
async fn load_modules(instance: &Arc<Instance>) -> Result<()> {
    let mut loaded: Vec<Arc<dyn Module>> = Vec::new();
    for name in &instance.config.modules {
        loaded.push(module_by_name(name).with_context(|| format!("unknown module {name:?}"))?);
    }
    instance.modules.load(instance, loaded).await;
    Ok(())
}

fn module_by_name(name: &str) -> Option<Arc<dyn Module>> {
    match name {
        "db" => Some(Arc::new(db::DbModule)),
        "stats" => Some(Arc::new(stats::StatsModule::new())),
        "git" => Some(Arc::new(git::GitModule::new())),
        "github" => Some(Arc::new(github::GithubModule::new())),
        "discord" => Some(Arc::new(discord::DiscordModule::new())),
        _ => None,
    }
}

/// Permanently drops to the configured run user: group first, then
/// user. Skipped with a warning when not started as root, so the
/// daemon stays usable in development.
fn drop_privileges(run: &RunConfig) -> Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        warn!(
            "not running as root; keeping current user instead of dropping to {}",
            run.user
        );
        return Ok(());
    }
    let user = nix::unistd::User::from_name(&run.user)
        .with_context(|| format!("cannot look up user {}", run.user))?
        .with_context(|| format!("unknown run user {}", run.user))?;
    let group = nix::unistd::Group::from_name(&run.group)
        .with_context(|| format!("cannot look up group {}", run.group))?
        .with_context(|| format!("unknown run group {}", run.group))?;
    nix::unistd::setgid(group.gid).context("setgid failed")?;
    nix::unistd::setuid(user.uid).context("setuid failed")?;
    info!("dropped privileges to {}:{}", run.user, run.group);
    Ok(())
}
