//! GitHub webhook ingestion.
//!
//! Each service with a `[service.github]` table gets an HTTP route.
//! Inbound deliveries run through a fixed gauntlet: POST only, JSON
//! only, HMAC-SHA-256 signature when a secret is configured, then
//! dispatch by the event header. Whatever goes wrong, the route answers
//! with a status code; it never takes the daemon down.

use crate::bus::{
    format_issue, format_issue_comment, format_push, BusEvent, CommitInfo, IssueCommentEvent,
    IssueEvent, Logger, PushEvent,
};
use crate::http::{HttpReply, Inbound, RouteHandler};
use crate::instance::{Instance, ServiceRun};
use crate::modules::{LifecycleEvent, LifecycleHandler, Module};
use anyhow::Result;
use async_trait::async_trait;
use axum::http::{header, Method, StatusCode};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::{Arc, OnceLock};

type HmacSha256 = Hmac<Sha256>;

/// Event types this daemon understands; anything else is 404.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Ping,
    Push,
    Issues,
    IssueComment,
}

impl EventKind {
    fn from_header(value: &str) -> Option<Self> {
        match value {
            "ping" => Some(Self::Ping),
            "push" => Some(Self::Push),
            "issues" => Some(Self::Issues),
            "issue_comment" => Some(Self::IssueComment),
            _ => None,
        }
    }
}

struct GithubCtx {
    instance: Arc<Instance>,
    logger: Logger,
}

pub struct GithubModule {
    state: OnceLock<GithubCtx>,
}

impl GithubModule {
    pub fn new() -> Self {
        Self {
            state: OnceLock::new(),
        }
    }
}

impl Default for GithubModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for GithubModule {
    fn name(&self) -> &'static str {
        "github"
    }

    async fn init(self: Arc<Self>, instance: &Arc<Instance>) -> Result<bool> {
        let logger = instance.bus.logger("GitHub");
        let load = instance
            .services
            .iter()
            .any(|service| service.config.github.is_some());
        logger.debug(format!("Init (load: {load})")).await;
        if !load {
            return Ok(false);
        }
        let _ = self.state.set(GithubCtx {
            instance: instance.clone(),
            logger,
        });
        Ok(true)
    }

    fn lifecycle(self: Arc<Self>) -> Option<Arc<dyn LifecycleHandler>> {
        Some(self)
    }
}

#[async_trait]
impl LifecycleHandler for GithubModule {
    async fn on_event(&self, event: &LifecycleEvent) -> Result<()> {
        let Some(ctx) = self.state.get() else {
            return Ok(());
        };
        let LifecycleEvent::Start(service) = event else {
            return Ok(());
        };
        let Some(hook) = service.config.github.as_ref() else {
            return Ok(());
        };

        let path = ctx.instance.config.hook_path(&service.config);
        ctx.instance
            .add_route(
                path.clone(),
                Arc::new(GithubRoute {
                    service: service.clone(),
                    secret: hook.secret.clone(),
                    logger: ctx.logger.clone(),
                }),
            )
            .await;
        ctx.logger
            .debug(format!("Route {path} -> {}", service.name()))
            .await;
        Ok(())
    }
}

/// One registered webhook route, bound to its service.
pub struct GithubRoute {
    service: Arc<ServiceRun>,
    secret: Option<String>,
    logger: Logger,
}

impl GithubRoute {
    #[cfg(test)]
    fn for_tests(service: Arc<ServiceRun>, secret: Option<String>, logger: Logger) -> Self {
        Self {
            service,
            secret,
            logger,
        }
    }

    async fn dispatch(&self, kind: EventKind, body: &[u8]) -> Result<HttpReply> {
        match kind {
            EventKind::Ping => {
                self.logger
                    .info(format!("Ping for {}", self.service.name()))
                    .await;
                Ok(HttpReply::text(StatusCode::OK, "pong"))
            }
            EventKind::Push => {
                let payload: PushPayload = serde_json::from_slice(body)?;
                let push = normalize_push(self.service.name(), payload);
                self.logger.info(format_push(&push)).await;
                self.logger.publish(BusEvent::GitPush(push)).await;
                Ok(HttpReply::status(StatusCode::OK))
            }
            EventKind::Issues => {
                let payload: IssuesPayload = serde_json::from_slice(body)?;
                let issue = normalize_issue(self.service.name(), payload);
                self.logger.info(format_issue(&issue)).await;
                self.logger.publish(BusEvent::Issue(issue)).await;
                Ok(HttpReply::status(StatusCode::OK))
            }
            EventKind::IssueComment => {
                let payload: IssueCommentPayload = serde_json::from_slice(body)?;
                let comment = normalize_issue_comment(self.service.name(), payload);
                self.logger.info(format_issue_comment(&comment)).await;
                self.logger.publish(BusEvent::IssueComment(comment)).await;
                Ok(HttpReply::status(StatusCode::OK))
            }
        }
    }
}

#[async_trait]
impl RouteHandler for GithubRoute {
    async fn handle(&self, request: Inbound) -> HttpReply {
        if request.method != Method::POST {
            self.logger
                .warn(format!(
                    "Rejecting {} {} (method not allowed)",
                    request.method, request.path
                ))
                .await;
            return HttpReply::status(StatusCode::METHOD_NOT_ALLOWED);
        }
        if !is_json(&request) {
            self.logger
                .warn("Rejecting delivery without application/json content type")
                .await;
            return HttpReply::status(StatusCode::INTERNAL_SERVER_ERROR);
        }
        if let Some(secret) = &self.secret {
            if let Err(reason) = verify_signature(secret, &request) {
                self.logger.warn(format!("Rejecting delivery: {reason}")).await;
                return HttpReply::status(StatusCode::BAD_REQUEST);
            }
        }

        self.logger
            .data(format!("Payload {}", String::from_utf8_lossy(&request.body)))
            .await;

        let event = request
            .headers
            .get("x-github-event")
            .and_then(|value| value.to_str().ok());
        let Some(kind) = event.and_then(EventKind::from_header) else {
            self.logger
                .warn(format!("Unhandled event type {:?}", event.unwrap_or("")))
                .await;
            return HttpReply::status(StatusCode::NOT_FOUND);
        };

        match self.dispatch(kind, &request.body).await {
            Ok(reply) => reply,
            Err(err) => {
                self.logger
                    .error(format!("Webhook handler failed: {err:#}"))
                    .await;
                HttpReply::status(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

fn is_json(request: &Inbound) -> bool {
    request
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(|essence| essence.trim().eq_ignore_ascii_case("application/json"))
        .unwrap_or(false)
}

/// Checks `X-Hub-Signature-256: sha256=<hex>` against an HMAC of the
/// raw body. The mac comparison itself is constant-time.
fn verify_signature(secret: &str, request: &Inbound) -> Result<(), String> {
    let header = request
        .headers
        .get("x-hub-signature-256")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| "missing signature header".to_string())?;
    let (algo, hexsig) = header
        .split_once('=')
        .ok_or_else(|| "malformed signature header".to_string())?;
    if algo != "sha256" {
        return Err(format!("unsupported signature algorithm {algo:?}"));
    }
    let sig = hex::decode(hexsig).map_err(|_| "signature is not valid hex".to_string())?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| "unusable webhook secret".to_string())?;
    mac.update(&request.body);
    mac.verify_slice(&sig).map_err(|_| "bad signature".to_string())
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    pusher: Pusher,
    repository: Repository,
    #[serde(default)]
    commits: Vec<Commit>,
}

#[derive(Debug, Deserialize)]
struct Pusher {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Repository {
    name: String,
    full_name: Option<String>,
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Commit {
    id: String,
    message: String,
    timestamp: String,
    url: Option<String>,
    author: Author,
}

#[derive(Debug, Deserialize)]
struct Author {
    username: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IssuesPayload {
    action: String,
    issue: Issue,
    repository: Repository,
}

#[derive(Debug, Deserialize)]
struct Issue {
    number: u64,
    title: String,
    html_url: Option<String>,
    user: Option<User>,
}

#[derive(Debug, Deserialize)]
struct User {
    login: String,
}

#[derive(Debug, Deserialize)]
struct IssueCommentPayload {
    action: String,
    issue: Issue,
    comment: Comment,
    repository: Repository,
}

#[derive(Debug, Deserialize)]
struct Comment {
    body: Option<String>,
    html_url: Option<String>,
    user: Option<User>,
}

fn repo_name(repository: &Repository) -> String {
    repository
        .full_name
        .clone()
        .unwrap_or_else(|| repository.name.clone())
}

fn normalize_push(service: &str, payload: PushPayload) -> PushEvent {
    PushEvent {
        host: "GitHub".into(),
        service: service.into(),
        username: payload.pusher.name,
        repo: repo_name(&payload.repository),
        url: payload.repository.html_url.unwrap_or_default(),
        git_ref: payload.git_ref,
        commits: payload
            .commits
            .into_iter()
            .map(|commit| CommitInfo {
                message: commit.message,
                username: commit
                    .author
                    .username
                    .or(commit.author.name)
                    .unwrap_or_default(),
                timestamp: commit.timestamp,
                id: commit.id,
                url: commit.url.unwrap_or_default(),
            })
            .collect(),
    }
}

fn normalize_issue(service: &str, payload: IssuesPayload) -> IssueEvent {
    IssueEvent {
        host: "GitHub".into(),
        service: service.into(),
        repo: repo_name(&payload.repository),
        action: payload.action,
        number: payload.issue.number,
        title: payload.issue.title,
        username: payload
            .issue
            .user
            .map(|user| user.login)
            .unwrap_or_default(),
        url: payload.issue.html_url.unwrap_or_default(),
    }
}

fn normalize_issue_comment(service: &str, payload: IssueCommentPayload) -> IssueCommentEvent {
    IssueCommentEvent {
        host: "GitHub".into(),
        service: service.into(),
        repo: repo_name(&payload.repository),
        action: payload.action,
        number: payload.issue.number,
        title: payload.issue.title,
        username: payload
            .comment
            .user
            .map(|user| user.login)
            .unwrap_or_default(),
        body: payload.comment.body.unwrap_or_default(),
        url: payload.comment.html_url.unwrap_or_default(),
    }
}
