//! Link to the privileged helper process.
//!
//! The supervisor writes exec requests to the helper's stdin and reads
//! replies from its stdout, one JSON document per line. Replies arrive
//! in whatever order commands finish, so every in-flight request parks
//! a oneshot sender in a pending map keyed by request id.

use async_trait::async_trait;
use bosun_common::{ExecReply, ExecRequest, HelperReply, HelperRequest, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, warn};

use anyhow::{Context, Result};

/// How long the helper gets to report ready after being spawned.
pub const READY_TIMEOUT: Duration = Duration::from_millis(500);

/// Captured output of a command that exited 0.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("command exited with code {code}: {stderr}")]
    Command { code: i32, stderr: String },
    #[error("helper channel closed")]
    Closed,
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("could not reach helper: {0}")]
    Transport(String),
}

/// Something that can run a command and capture its output. The daemon
/// holds two of these: the helper link for privileged work and a local
/// in-process runner for everything else.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn exec(
        &self,
        cmd: &str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<ExecOutput, ExecError>;
}

/// Runs commands in-process, with the daemon's own (dropped) privileges.
pub struct LocalRunner;

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn exec(
        &self,
        cmd: &str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<ExecOutput, ExecError> {
        let mut command = Command::new(cmd);
        command.args(args);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        let output = command.output().await.map_err(|err| ExecError::Command {
            code: 127,
            stderr: format!("failed to spawn {cmd}: {err}"),
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if output.status.success() {
            Ok(ExecOutput { stdout, stderr })
        } else {
            Err(ExecError::Command {
                code: output.status.code().unwrap_or(-1),
                stderr,
            })
        }
    }
}

struct LinkInner {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Mutex<HashMap<String, oneshot::Sender<ExecReply>>>,
    seq: AtomicU64,
    closed: AtomicBool,
    timeout: Duration,
    fatal_on_close: bool,
}

/// Correlation channel to the helper. Cheap to clone.
#[derive(Clone)]
pub struct RootLink {
    inner: Arc<LinkInner>,
}

impl RootLink {
    /// Spawns the helper binary with piped stdio and waits for its
    /// ready handshake. Anything going wrong here is fatal to startup.
    pub async fn spawn(helper: &Path, timeout: Duration) -> Result<Self> {
        let mut child = Command::new(helper)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to spawn helper {}", helper.display()))?;
        let stdin = child.stdin.take().context("helper stdin was not piped")?;
        let stdout = child.stdout.take().context("helper stdout was not piped")?;
        // Reap the helper whenever it exits; the read loop handles the
        // fallout of the channel closing.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Self::over(stdout, stdin, timeout, true).await
    }

    /// Builds a link over an arbitrary transport. `fatal_on_close`
    /// makes an established channel's loss exit the process, which is
    /// what the daemon wants and tests do not.
    pub async fn over<R, W>(
        reader: R,
        writer: W,
        timeout: Duration,
        fatal_on_close: bool,
    ) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let inner = Arc::new(LinkInner {
            writer: Mutex::new(Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>),
            pending: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            timeout,
            fatal_on_close,
        });
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(read_loop(reader, inner.clone(), ready_tx));

        let ready = tokio::time::timeout(READY_TIMEOUT, ready_rx)
            .await
            .context("helper did not report ready in time")?
            .context("helper exited before reporting ready")?;
        if ready.v != PROTOCOL_VERSION {
            anyhow::bail!(
                "helper speaks protocol v{} but this daemon needs v{}",
                ready.v,
                PROTOCOL_VERSION
            );
        }
        Ok(Self { inner })
    }

    fn next_id(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        format!("{millis}-{seq}")
    }

    async fn send(
        &self,
        cmd: &str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<ExecReply, ExecError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ExecError::Closed);
        }
        let id = self.next_id();
        let request = HelperRequest::Exec(ExecRequest {
            id: id.clone(),
            cmd: cmd.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            cwd: cwd.map(Path::to_path_buf),
        });
        let mut line =
            serde_json::to_string(&request).map_err(|err| ExecError::Transport(err.to_string()))?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id.clone(), tx);

        {
            let mut writer = self.inner.writer.lock().await;
            let written = async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            }
            .await;
            if let Err(err) = written {
                self.inner.pending.lock().await.remove(&id);
                return Err(ExecError::Transport(err.to_string()));
            }
        }

        match tokio::time::timeout(self.inner.timeout, rx).await {
            Err(_) => {
                // Free the slot; a late reply for this id gets dropped
                // by the read loop.
                self.inner.pending.lock().await.remove(&id);
                Err(ExecError::Timeout(self.inner.timeout))
            }
            Ok(Err(_)) => Err(ExecError::Closed),
            Ok(Ok(reply)) => Ok(reply),
        }
    }
}

#[async_trait]
impl CommandRunner for RootLink {
    async fn exec(
        &self,
        cmd: &str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<ExecOutput, ExecError> {
        let reply = self.send(cmd, args, cwd).await?;
        reply_to_result(reply)
    }
}

fn reply_to_result(reply: ExecReply) -> Result<ExecOutput, ExecError> {
    match reply.code {
        Some(code) => Err(ExecError::Command {
            code,
            stderr: reply.stderr.unwrap_or_default(),
        }),
        None => Ok(ExecOutput {
            stdout: reply.stdout.unwrap_or_default(),
            stderr: reply.stderr.unwrap_or_default(),
        }),
    }
}

/// Default helper location: `bosun-root` in the daemon's own directory.
pub fn sibling_helper_path() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot locate own binary")?;
    let dir = exe.parent().context("own binary has no parent directory")?;
    Ok(dir.join("bosun-root"))
}

async fn read_loop<R>(reader: R, inner: Arc<LinkInner>, ready_tx: oneshot::Sender<bosun_common::ReadyMsg>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut ready_tx = Some(ready_tx);
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<HelperReply>(&line) {
                    Ok(HelperReply::Ready(msg)) => match ready_tx.take() {
                        Some(tx) => {
                            let _ = tx.send(msg);
                        }
                        None => warn!("helper sent a second ready message"),
                    },
                    Ok(HelperReply::Exec(reply)) => {
                        let sender = inner.pending.lock().await.remove(&reply.id);
                        match sender {
                            Some(tx) => {
                                let _ = tx.send(reply);
                            }
                            None => debug!(id = %reply.id, "dropping reply with no pending request"),
                        }
                    }
                    Err(err) => warn!("unparseable helper line: {err}"),
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!("helper channel read error: {err}");
                break;
            }
        }
    }

    inner.closed.store(true, Ordering::SeqCst);
    // Dropping the senders wakes every waiter with a channel error.
    inner.pending.lock().await.clear();

    // Losing an established channel means privileged commands can never
    // run again; pre-handshake failures surface through `over` instead.
    if inner.fatal_on_close && ready_tx.is_none() {
        error!("helper channel closed; shutting down");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, AsyncBufReadExt, BufReader};

    fn ready_line() -> String {
        format!("{}\n", serde_json::to_string(&HelperReply::Ready(bosun_common::ReadyMsg::new())).unwrap())
    }

    fn reply_line(reply: ExecReply) -> String {
        format!("{}\n", serde_json::to_string(&reply).unwrap())
    }

    async fn read_request<R: AsyncRead + Unpin>(lines: &mut tokio::io::Lines<BufReader<R>>) -> ExecRequest {
        let line = lines.next_line().await.unwrap().unwrap();
        match serde_json::from_str::<HelperRequest>(&line).unwrap() {
            HelperRequest::Exec(req) => req,
        }
    }

    #[tokio::test]
    async fn replies_resolve_out_of_order() {
        let (ours, theirs) = duplex(4096);
        let (our_read, our_write) = split(ours);
        let (their_read, mut their_write) = split(theirs);

        tokio::spawn(async move {
            their_write.write_all(ready_line().as_bytes()).await.unwrap();
            let mut lines = BufReader::new(their_read).lines();
            let first = read_request(&mut lines).await;
            let second = read_request(&mut lines).await;
            // Answer in reverse order.
            for req in [second, first] {
                let line = reply_line(ExecReply {
                    stdout: Some(format!("ran {}", req.cmd)),
                    stderr: Some(String::new()),
                    code: None,
                    id: req.id,
                });
                their_write.write_all(line.as_bytes()).await.unwrap();
            }
        });

        let link = RootLink::over(our_read, our_write, Duration::from_secs(5), false)
            .await
            .unwrap();
        let (a, b) = tokio::join!(
            link.exec("alpha", &[], None),
            link.exec("beta", &[], None)
        );
        assert_eq!(a.unwrap().stdout, "ran alpha");
        assert_eq!(b.unwrap().stdout, "ran beta");
    }

    #[tokio::test]
    async fn unknown_ids_are_dropped_silently() {
        let (ours, theirs) = duplex(4096);
        let (our_read, our_write) = split(ours);
        let (their_read, mut their_write) = split(theirs);

        tokio::spawn(async move {
            their_write.write_all(ready_line().as_bytes()).await.unwrap();
            let mut lines = BufReader::new(their_read).lines();
            let req = read_request(&mut lines).await;
            let bogus = reply_line(ExecReply {
                id: "0-999".into(),
                stdout: Some("stray".into()),
                stderr: None,
                code: None,
            });
            their_write.write_all(bogus.as_bytes()).await.unwrap();
            let real = reply_line(ExecReply {
                stdout: Some("expected".into()),
                stderr: None,
                code: None,
                id: req.id,
            });
            their_write.write_all(real.as_bytes()).await.unwrap();
        });

        let link = RootLink::over(our_read, our_write, Duration::from_secs(5), false)
            .await
            .unwrap();
        let out = link.exec("x", &[], None).await.unwrap();
        assert_eq!(out.stdout, "expected");
    }

    #[tokio::test]
    async fn failure_reply_becomes_command_error() {
        let (ours, theirs) = duplex(4096);
        let (our_read, our_write) = split(ours);
        let (their_read, mut their_write) = split(theirs);

        tokio::spawn(async move {
            their_write.write_all(ready_line().as_bytes()).await.unwrap();
            let mut lines = BufReader::new(their_read).lines();
            let req = read_request(&mut lines).await;
            let line = reply_line(ExecReply {
                stdout: None,
                stderr: Some("boom".into()),
                code: Some(2),
                id: req.id,
            });
            their_write.write_all(line.as_bytes()).await.unwrap();
        });

        let link = RootLink::over(our_read, our_write, Duration::from_secs(5), false)
            .await
            .unwrap();
        match link.exec("x", &[], None).await {
            Err(ExecError::Command { code, stderr }) => {
                assert_eq!(code, 2);
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected command error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_ready_fails_the_handshake() {
        let (ours, theirs) = duplex(64);
        let (our_read, our_write) = split(ours);
        // Keep the far side open but silent.
        let err = RootLink::over(our_read, our_write, Duration::from_secs(5), false)
            .await
            .err()
            .map(|e| e.to_string())
            .unwrap_or_default();
        assert!(err.contains("did not report ready"), "{err}");
        drop(theirs);
    }

    #[tokio::test]
    async fn wrong_protocol_version_is_refused() {
        let (ours, theirs) = duplex(256);
        let (our_read, our_write) = split(ours);
        let (_their_read, mut their_write) = split(theirs);
        their_write
            .write_all(b"{\"type\":\"ready\",\"v\":2}\n")
            .await
            .unwrap();
        let err = RootLink::over(our_read, our_write, Duration::from_secs(5), false)
            .await
            .err()
            .map(|e| e.to_string())
            .unwrap_or_default();
        assert!(err.contains("protocol v2"), "{err}");
    }

    #[tokio::test]
    async fn channel_close_rejects_pending_and_future_requests() {
        let (ours, theirs) = duplex(4096);
        let (our_read, our_write) = split(ours);
        let (their_read, mut their_write) = split(theirs);

        tokio::spawn(async move {
            their_write.write_all(ready_line().as_bytes()).await.unwrap();
            let mut lines = BufReader::new(their_read).lines();
            let _ = read_request(&mut lines).await;
            // Hang up without answering.
            drop(their_write);
        });

        let link = RootLink::over(our_read, our_write, Duration::from_secs(5), false)
            .await
            .unwrap();
        match link.exec("x", &[], None).await {
            Err(ExecError::Closed) => {}
            other => panic!("expected closed, got {other:?}"),
        }
        match link.exec("y", &[], None).await {
            Err(ExecError::Closed | ExecError::Transport(_)) => {}
            other => panic!("expected closed channel, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_frees_the_pending_slot() {
        let (ours, theirs) = duplex(4096);
        let (our_read, our_write) = split(ours);
        let (their_read, mut their_write) = split(theirs);

        tokio::spawn(async move {
            their_write.write_all(ready_line().as_bytes()).await.unwrap();
            let mut lines = BufReader::new(their_read).lines();
            let _ = read_request(&mut lines).await;
            // Never reply, but keep the channel open.
            std::future::pending::<()>().await;
        });

        let link = RootLink::over(our_read, our_write, Duration::from_millis(50), false)
            .await
            .unwrap();
        match link.exec("slow", &[], None).await {
            Err(ExecError::Timeout(t)) => assert_eq!(t, Duration::from_millis(50)),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(link.inner.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn ids_are_unique_under_bursts() {
        let (ours, theirs) = duplex(64);
        let (our_read, our_write) = split(ours);
        let (_their_read, mut their_write) = split(theirs);
        their_write.write_all(ready_line().as_bytes()).await.unwrap();

        let link = RootLink::over(our_read, our_write, Duration::from_secs(1), false)
            .await
            .unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(link.next_id()));
        }
    }

    #[tokio::test]
    async fn local_runner_reports_spawn_failure_as_127() {
        match LocalRunner.exec("/no/such/binary", &[], None).await {
            Err(ExecError::Command { code, .. }) => assert_eq!(code, 127),
            other => panic!("expected spawn failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_runner_captures_output() {
        let out = LocalRunner.exec("echo", &["hi"], None).await.unwrap();
        assert_eq!(out.stdout, "hi\n");
    }
}
