//! HTTP front door.
//!
//! One axum server, bound to either a TCP address or a unix socket.
//! Modules register handlers against exact paths at runtime; everything
//! else is 404. Handlers speak [`Inbound`]/[`HttpReply`] so they never
//! touch the server plumbing.

use crate::config::{Bind, RunConfig};
use crate::instance::Instance;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener};
use tower_http::trace::TraceLayer;

/// The parts of a request a route handler gets to see.
pub struct Inbound {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct HttpReply {
    pub status: StatusCode,
    pub body: Option<String>,
}

impl HttpReply {
    pub fn status(status: StatusCode) -> Self {
        Self { status, body: None }
    }

    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: Some(body.into()),
        }
    }
}

impl IntoResponse for HttpReply {
    fn into_response(self) -> Response {
        match self.body {
            Some(body) => (self.status, body).into_response(),
            None => self.status.into_response(),
        }
    }
}

#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn handle(&self, request: Inbound) -> HttpReply;
}

pub fn router(instance: Arc<Instance>) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(instance)
}

async fn dispatch(
    State(instance): State<Arc<Instance>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    match instance.route(&path).await {
        None => StatusCode::NOT_FOUND.into_response(),
        Some(handler) => {
            let reply = handler
                .handle(Inbound {
                    method,
                    path,
                    headers,
                    body,
                })
                .await;
            reply.into_response()
        }
    }
}

pub enum BoundListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// Binds the configured address. For unix sockets a stale socket file
/// is removed first; any other kind of file at that path is refused.
pub async fn bind(bind: &Bind) -> Result<BoundListener> {
    match bind {
        Bind::Inet { host, port } => {
            let listener = TcpListener::bind((host.as_str(), *port))
                .await
                .with_context(|| format!("cannot listen on {host}:{port}"))?;
            Ok(BoundListener::Tcp(listener))
        }
        Bind::Unix { path } => {
            prepare_unix_socket(path).await?;
            let listener = UnixListener::bind(path)
                .with_context(|| format!("cannot listen on {}", path.display()))?;
            Ok(BoundListener::Unix(listener))
        }
    }
}

pub async fn serve(listener: BoundListener, app: Router) -> std::io::Result<()> {
    match listener {
        BoundListener::Tcp(listener) => axum::serve(listener, app).await,
        BoundListener::Unix(listener) => axum::serve(listener, app).await,
    }
}

/// Unlinks a leftover socket from a previous run. Refuses to touch a
/// path that exists but is not a socket.
pub async fn prepare_unix_socket(path: &Path) -> Result<()> {
    use std::os::unix::fs::FileTypeExt;

    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.file_type().is_socket() => {
            tokio::fs::remove_file(path)
                .await
                .with_context(|| format!("cannot remove stale socket {}", path.display()))?;
            Ok(())
        }
        Ok(_) => bail!(
            "{} exists and is not a socket; refusing to replace it",
            path.display()
        ),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("cannot stat {}", path.display())),
    }
}

/// Hands a freshly bound socket to the configured run user so it stays
/// reachable after privileges are dropped.
pub fn chown_to_run_user(path: &Path, run: &RunConfig) -> Result<()> {
    let user = nix::unistd::User::from_name(&run.user)
        .with_context(|| format!("cannot look up user {}", run.user))?
        .with_context(|| format!("unknown user {}", run.user))?;
    let group = nix::unistd::Group::from_name(&run.group)
        .with_context(|| format!("cannot look up group {}", run.group))?
        .with_context(|| format!("unknown group {}", run.group))?;
    std::os::unix::fs::chown(path, Some(user.uid.as_raw()), Some(group.gid.as_raw()))
        .with_context(|| format!("cannot chown {}", path.display()))
}
