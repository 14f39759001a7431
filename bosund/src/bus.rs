//! Event bus shared by every module.
//!
//! Each module gets a named [`Logger`]. A log call on it is printed
//! (when its severity is enabled in `[log]`) and then handed to every
//! OTHER module's listener, one listener at a time; the call resolves
//! only after all listeners ran. Structured events go out the same way
//! without being printed.

use crate::config::LogFlags;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Data,
    Debug,
    Info,
    Warn,
    Error,
}

/// What listeners receive: a gated log line or a structured event.
#[derive(Debug, Clone)]
pub enum Emission {
    Text(Severity, String),
    Event(BusEvent),
}

/// Normalized cross-module events, mostly distilled webhook payloads.
#[derive(Debug, Clone)]
pub enum BusEvent {
    GitPush(PushEvent),
    Issue(IssueEvent),
    IssueComment(IssueCommentEvent),
}

#[derive(Debug, Clone)]
pub struct PushEvent {
    /// Provenance label, e.g. "GitHub".
    pub host: String,
    /// Service whose webhook route received the payload.
    pub service: String,
    pub username: String,
    pub repo: String,
    pub url: String,
    /// Full ref, e.g. "refs/heads/main".
    pub git_ref: String,
    pub commits: Vec<CommitInfo>,
}

#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub message: String,
    pub username: String,
    pub timestamp: String,
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct IssueEvent {
    pub host: String,
    pub service: String,
    pub repo: String,
    pub action: String,
    pub number: u64,
    pub title: String,
    pub username: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct IssueCommentEvent {
    pub host: String,
    pub service: String,
    pub repo: String,
    pub action: String,
    pub number: u64,
    pub title: String,
    pub username: String,
    pub body: String,
    pub url: String,
}

#[async_trait]
pub trait BusListener: Send + Sync {
    async fn on_emission(&self, source: &str, emission: &Emission);
}

struct ListenerEntry {
    name: String,
    listener: Arc<dyn BusListener>,
}

struct BusInner {
    flags: LogFlags,
    listeners: RwLock<Vec<ListenerEntry>>,
}

#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new(flags: LogFlags) -> Self {
        Self {
            inner: Arc::new(BusInner {
                flags,
                listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Logger for one module. The name shows up in printed lines and
    /// identifies the module's listener on the bus.
    pub fn logger(&self, name: impl Into<String>) -> Logger {
        Logger {
            bus: self.clone(),
            name: Some(name.into()),
        }
    }

    /// Nameless logger for the daemon core. It cannot listen.
    pub fn root_logger(&self) -> Logger {
        Logger {
            bus: self.clone(),
            name: None,
        }
    }

    fn enabled(&self, severity: Severity) -> bool {
        let flags = &self.inner.flags;
        match severity {
            Severity::Data => flags.data,
            Severity::Debug => flags.debug,
            Severity::Info => flags.info,
            Severity::Warn => flags.warn,
            Severity::Error => flags.error,
        }
    }

    async fn register(&self, name: String, listener: Arc<dyn BusListener>) {
        let mut listeners = self.inner.listeners.write().await;
        if let Some(entry) = listeners.iter_mut().find(|entry| entry.name == name) {
            entry.listener = listener;
        } else {
            listeners.push(ListenerEntry { name, listener });
        }
    }

    /// Hands the emission to every listener except the source's own,
    /// in registration order, awaiting each in turn.
    async fn broadcast(&self, source: &str, emission: Emission) {
        let targets: Vec<(String, Arc<dyn BusListener>)> = {
            let listeners = self.inner.listeners.read().await;
            listeners
                .iter()
                .filter(|entry| entry.name != source)
                .map(|entry| (entry.name.clone(), entry.listener.clone()))
                .collect()
        };
        for (_name, listener) in targets {
            listener.on_emission(source, &emission).await;
        }
    }
}

#[derive(Clone)]
pub struct Logger {
    bus: Bus,
    name: Option<String>,
}

impl Logger {
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    pub async fn data(&self, msg: impl Into<String>) -> bool {
        self.log(Severity::Data, msg.into()).await
    }

    pub async fn debug(&self, msg: impl Into<String>) -> bool {
        self.log(Severity::Debug, msg.into()).await
    }

    pub async fn info(&self, msg: impl Into<String>) -> bool {
        self.log(Severity::Info, msg.into()).await
    }

    pub async fn warn(&self, msg: impl Into<String>) -> bool {
        self.log(Severity::Warn, msg.into()).await
    }

    pub async fn error(&self, msg: impl Into<String>) -> bool {
        self.log(Severity::Error, msg.into()).await
    }

    /// Returns whether the severity was enabled. Disabled lines are
    /// neither printed nor offered to listeners.
    async fn log(&self, severity: Severity, msg: String) -> bool {
        if !self.bus.enabled(severity) {
            return false;
        }
        self.print(severity, &msg);
        self.bus
            .broadcast(self.name(), Emission::Text(severity, msg))
            .await;
        true
    }

    fn print(&self, severity: Severity, msg: &str) {
        match (&self.name, severity) {
            (Some(name), Severity::Data) => tracing::debug!(module = %name, kind = "data", "{msg}"),
            (Some(name), Severity::Debug) => tracing::debug!(module = %name, "{msg}"),
            (Some(name), Severity::Info) => tracing::info!(module = %name, "{msg}"),
            (Some(name), Severity::Warn) => tracing::warn!(module = %name, "{msg}"),
            (Some(name), Severity::Error) => tracing::error!(module = %name, "{msg}"),
            (None, Severity::Data) => tracing::debug!(kind = "data", "{msg}"),
            (None, Severity::Debug) => tracing::debug!("{msg}"),
            (None, Severity::Info) => tracing::info!("{msg}"),
            (None, Severity::Warn) => tracing::warn!("{msg}"),
            (None, Severity::Error) => tracing::error!("{msg}"),
        }
    }

    /// Broadcasts a structured event without printing it.
    pub async fn publish(&self, event: BusEvent) {
        self.bus
            .broadcast(self.name(), Emission::Event(event))
            .await;
    }

    /// Registers this module's listener. Listening again replaces the
    /// previous listener instead of stacking a second one.
    pub async fn listen(&self, listener: Arc<dyn BusListener>) {
        match &self.name {
            Some(name) => self.bus.register(name.clone(), listener).await,
            None => tracing::debug!("root logger cannot listen; ignoring"),
        }
    }
}

/// One-line summary of a push event.
pub fn format_push(push: &PushEvent) -> String {
    format!("{} {} pushed to {}", push.host, push.username, push.repo)
}

/// One-line summary of a commit: message, author, date, short hash.
pub fn format_commit(commit: &CommitInfo) -> String {
    let date = match chrono::DateTime::parse_from_rfc3339(&commit.timestamp) {
        Ok(ts) => ts.format("%a, %b %-d, %y").to_string(),
        Err(_) => commit.timestamp.clone(),
    };
    let short: String = commit.id.chars().take(7).collect();
    format!("{} ({} on {}) {}", commit.message, commit.username, date, short)
}

pub fn format_issue(issue: &IssueEvent) -> String {
    format!(
        "{} {} {} issue #{} in {}: {}",
        issue.host, issue.username, issue.action, issue.number, issue.repo, issue.title
    )
}

pub fn format_issue_comment(comment: &IssueCommentEvent) -> String {
    let excerpt = excerpt_line(&comment.body, 200);
    format!(
        "{} {} commented on issue #{} in {}: {}\n> {}",
        comment.host, comment.username, comment.number, comment.repo, comment.title, excerpt
    )
}

/// First line of a body, truncated on a char boundary.
fn excerpt_line(body: &str, max: usize) -> String {
    let line = body.lines().next().unwrap_or("").trim();
    if line.chars().count() <= max {
        line.to_string()
    } else {
        let cut: String = line.chars().take(max).collect();
        format!("{cut}…")
    }
}
