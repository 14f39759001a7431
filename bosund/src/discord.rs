//! Discord notification module.
//!
//! Posts chat messages through configured webhooks: a greeting when a
//! service comes up, renderings of issue activity heard on the bus, and
//! periodic stats messages. A stats message can be reused: the first
//! publish creates it and persists the returned id, later publishes
//! patch the same message in place. When Discord reports the message
//! gone, the id is forgotten and the next publish creates a fresh one.

use crate::bus::{format_issue, format_issue_comment, BusEvent, BusListener, Emission, Logger};
use crate::config::DiscordConfig;
use crate::db::Db;
use crate::instance::Instance;
use crate::modules::{LifecycleEvent, LifecycleHandler, Module, StatsScope};
use anyhow::Result;
use async_trait::async_trait;
use bosun_common::Stat;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;

/// Discord's "Unknown Message" error code on a PATCH whose target was
/// deleted.
const UNKNOWN_MESSAGE: i64 = 10008;

const MESSAGE_ID_KEY: &str = "statsMessageId";
const HOST_SCOPE: &str = "host";

#[derive(Debug)]
enum SendError {
    UnknownMessage,
    Other(String),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::UnknownMessage => write!(f, "message no longer exists"),
            SendError::Other(reason) => write!(f, "{reason}"),
        }
    }
}

struct DiscordCtx {
    instance: Arc<Instance>,
    logger: Logger,
    client: reqwest::Client,
}

pub struct DiscordModule {
    state: OnceLock<DiscordCtx>,
}

impl DiscordModule {
    pub fn new() -> Self {
        Self {
            state: OnceLock::new(),
        }
    }

    /// Creates or patches the stats message for one scope. `key` is the
    /// persistence scope ("host" or the service name), `slot` the
    /// in-memory copy of the message id.
    async fn publish_stats(
        &self,
        ctx: &DiscordCtx,
        key: &str,
        config: &DiscordConfig,
        slot: &Mutex<Option<String>>,
        body: Value,
    ) {
        if config.reuse_stats_message {
            let current = slot.lock().await.clone();
            if let Some(id) = current {
                match self.patch(ctx, &config.url, &id, &body).await {
                    Ok(()) => return,
                    Err(SendError::UnknownMessage) => {
                        ctx.logger
                            .warn(format!(
                                "Stats message {id} for {key} is gone; recreating on the next publish"
                            ))
                            .await;
                        *slot.lock().await = None;
                        self.persist_id(ctx, key, &Value::Null).await;
                        return;
                    }
                    Err(err) => {
                        ctx.logger
                            .error(format!("Could not update stats message for {key}: {err}"))
                            .await;
                        return;
                    }
                }
            }
        }

        match self.post(ctx, &config.url, &body).await {
            Ok(Some(id)) if config.reuse_stats_message => {
                *slot.lock().await = Some(id.clone());
                // Written right away so a restart patches instead of
                // reposting.
                self.persist_id(ctx, key, &Value::String(id)).await;
            }
            Ok(_) => {}
            Err(err) => {
                ctx.logger
                    .error(format!("Could not post stats message for {key}: {err}"))
                    .await;
            }
        }
    }

    /// POSTs a message and returns the created message's id, if Discord
    /// sent one back.
    async fn post(
        &self,
        ctx: &DiscordCtx,
        url: &str,
        body: &Value,
    ) -> Result<Option<String>, SendError> {
        let response = ctx
            .client
            .post(with_wait(url))
            .json(body)
            .send()
            .await
            .map_err(|err| SendError::Other(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SendError::Other(format!("webhook answered {status}")));
        }
        let reply: Value = response
            .json()
            .await
            .map_err(|err| SendError::Other(err.to_string()))?;
        Ok(reply["id"].as_str().map(String::from))
    }

    async fn patch(
        &self,
        ctx: &DiscordCtx,
        url: &str,
        id: &str,
        body: &Value,
    ) -> Result<(), SendError> {
        let response = ctx
            .client
            .patch(with_wait(&format!("{url}/messages/{id}")))
            .json(body)
            .send()
            .await
            .map_err(|err| SendError::Other(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND {
            let reply: Value = response.json().await.unwrap_or_default();
            if reply["code"].as_i64() == Some(UNKNOWN_MESSAGE) {
                return Err(SendError::UnknownMessage);
            }
        }
        Err(SendError::Other(format!("webhook answered {status}")))
    }

    /// Fire-and-record plain message, used for greetings and issue
    /// notifications.
    async fn post_text(&self, ctx: &DiscordCtx, url: &str, content: String) {
        if let Err(err) = self.post(ctx, url, &json!({ "content": content })).await {
            ctx.logger
                .error(format!("Could not post notification: {err}"))
                .await;
        }
    }

    async fn persist_id(&self, ctx: &DiscordCtx, key: &str, value: &Value) {
        let Some(db) = ctx.instance.db() else {
            return;
        };
        if let Err(err) = db.put(&["discord", key, MESSAGE_ID_KEY], value).await {
            ctx.logger
                .error(format!("Could not persist stats message id for {key}: {err}"))
                .await;
        }
    }

    /// Webhook for a service's notifications: its own table, falling
    /// back to the combined one.
    fn notify_config(&self, ctx: &DiscordCtx, service: &str) -> Option<DiscordConfig> {
        ctx.instance
            .service(service)
            .and_then(|run| run.config.discord.clone())
            .or_else(|| ctx.instance.config.discord.clone())
    }
}

impl Default for DiscordModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for DiscordModule {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn init(self: Arc<Self>, instance: &Arc<Instance>) -> Result<bool> {
        let logger = instance.bus.logger("Discord");
        let load = instance.config.discord.is_some()
            || instance
                .services
                .iter()
                .any(|service| service.config.discord.is_some());
        logger.debug(format!("Init (load: {load})")).await;
        if !load {
            return Ok(false);
        }

        // Restore persisted message ids before the first publish.
        if let Some(db) = instance.db() {
            for service in &instance.services {
                if service.config.discord.is_some() {
                    if let Some(id) = load_id(db, service.name()).await {
                        *service.discord_message_id.lock().await = Some(id);
                    }
                }
            }
            if instance.config.discord.is_some() {
                if let Some(id) = load_id(db, HOST_SCOPE).await {
                    *instance.host.discord_message_id.lock().await = Some(id);
                }
            }
        } else {
            logger
                .warn("No key-value store; stats message reuse will not survive restarts")
                .await;
        }

        let _ = self.state.set(DiscordCtx {
            instance: instance.clone(),
            logger: logger.clone(),
            client: reqwest::Client::new(),
        });
        logger.listen(self.clone() as Arc<dyn BusListener>).await;
        Ok(true)
    }

    fn lifecycle(self: Arc<Self>) -> Option<Arc<dyn LifecycleHandler>> {
        Some(self)
    }
}

#[async_trait]
impl LifecycleHandler for DiscordModule {
    async fn on_event(&self, event: &LifecycleEvent) -> Result<()> {
        let Some(ctx) = self.state.get() else {
            return Ok(());
        };
        match event {
            LifecycleEvent::Start(service) => {
                let Some(config) = service.config.discord.as_ref() else {
                    return Ok(());
                };
                if config.greet {
                    self.post_text(
                        ctx,
                        &config.url,
                        format!(
                            "Managing service {} @{}",
                            service.name(),
                            ctx.instance.host.hostname
                        ),
                    )
                    .await;
                }
            }
            LifecycleEvent::Stats(StatsScope::Service(service)) => {
                let Some(config) = service.config.discord.as_ref() else {
                    return Ok(());
                };
                let stats = service.stats.lock().await.clone();
                if stats.is_empty() {
                    ctx.logger
                        .debug(format!("No stats to publish for {}", service.name()))
                        .await;
                    return Ok(());
                }
                let body = json!({
                    "content": format!("Stats for {} @{}", service.name(), ctx.instance.host.hostname),
                    "embeds": [embed(service.name(), &stats)],
                });
                self.publish_stats(
                    ctx,
                    service.name(),
                    config,
                    &service.discord_message_id,
                    body,
                )
                .await;
            }
            LifecycleEvent::Stats(StatsScope::Host) => {
                let Some(config) = ctx.instance.config.discord.as_ref() else {
                    return Ok(());
                };
                let mut embeds = Vec::new();
                let host_stats = ctx.instance.host.stats.lock().await.clone();
                if !host_stats.is_empty() {
                    embeds.push(embed(&ctx.instance.host.hostname, &host_stats));
                }
                for service in &ctx.instance.services {
                    let stats = service.stats.lock().await.clone();
                    if !stats.is_empty() {
                        embeds.push(embed(service.name(), &stats));
                    }
                }
                if embeds.is_empty() {
                    ctx.logger.debug("No stats to publish for the host").await;
                    return Ok(());
                }
                let body = json!({
                    "content": format!("Stats @{}", ctx.instance.host.hostname),
                    "embeds": embeds,
                });
                self.publish_stats(
                    ctx,
                    HOST_SCOPE,
                    config,
                    &ctx.instance.host.discord_message_id,
                    body,
                )
                .await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BusListener for DiscordModule {
    async fn on_emission(&self, _source: &str, emission: &Emission) {
        let Emission::Event(event) = emission else {
            return;
        };
        let Some(ctx) = self.state.get() else {
            return;
        };
        let (service, content) = match event {
            BusEvent::Issue(issue) => (issue.service.as_str(), format_issue(issue)),
            BusEvent::IssueComment(comment) => {
                (comment.service.as_str(), format_issue_comment(comment))
            }
            // Pushes are handled by the git module and its own logging.
            BusEvent::GitPush(_) => return,
        };
        if let Some(config) = self.notify_config(ctx, service) {
            self.post_text(ctx, &config.url, content).await;
        }
    }
}

fn with_wait(url: &str) -> String {
    if url.contains('?') {
        format!("{url}&wait=true")
    } else {
        format!("{url}?wait=true")
    }
}

fn embed(title: &str, stats: &[Stat]) -> Value {
    let fields: Vec<Value> = stats
        .iter()
        .map(|stat| {
            json!({
                "name": stat.description,
                "value": stat.value,
                "inline": true,
            })
        })
        .collect();
    json!({ "title": title, "fields": fields })
}

async fn load_id(db: &Db, key: &str) -> Option<String> {
    match db.get(&["discord", key, MESSAGE_ID_KEY]).await {
        Ok(value) => value.and_then(|v| v.as_str().map(String::from)),
        Err(err) => {
            tracing::debug!("could not read stats message id for {key}: {err}");
            None
        }
    }
}
