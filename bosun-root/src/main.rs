//! Bosun Root Helper
//!
//! Runs privileged commands on behalf of the unprivileged supervisor.
//! Speaks line-delimited JSON over stdin/stdout: an exec request per
//! line in, a correlated reply per line out. Exits when stdin closes.

use anyhow::{Context, Result};
use bosun_common::{ExecReply, ExecRequest, HelperReply, HelperRequest, ReadyMsg};
use std::io::IsTerminal;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_writer(std::io::stderr)
        .init();

    // stdout belongs to the protocol, so a terminal on stdin means we
    // were started by hand rather than spawned by the supervisor.
    if std::io::stdin().is_terminal() {
        anyhow::bail!("bosun-root must be spawned by bosund with piped stdio");
    }

    let (tx, mut rx) = mpsc::channel::<HelperReply>(64);

    // Single writer task; concurrent executions funnel replies through
    // it so lines never interleave.
    let writer = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(reply) = rx.recv().await {
            let mut line = match serde_json::to_string(&reply) {
                Ok(line) => line,
                Err(err) => {
                    warn!("failed to encode reply: {err}");
                    continue;
                }
            };
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                return;
            }
            if stdout.flush().await.is_err() {
                return;
            }
        }
    });

    tx.send(HelperReply::Ready(ReadyMsg::new()))
        .await
        .context("stdout closed before ready message")?;

    let mut lines = BufReader::new(io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: HelperRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                warn!("ignoring malformed request line: {err}");
                continue;
            }
        };
        let HelperRequest::Exec(exec) = request;
        let tx = tx.clone();
        tokio::spawn(async move {
            let reply = run_exec(exec).await;
            // Receiver only drops on writer failure; nothing left to do then.
            let _ = tx.send(HelperReply::Exec(reply)).await;
        });
    }

    debug!("stdin closed, shutting down");
    drop(tx);
    let _ = writer.await;
    Ok(())
}

/// Spawns the command directly (no shell) and maps the outcome onto the
/// wire shape: success carries stdout/stderr, failure carries the exit
/// code plus stderr. Spawn errors use code 127, signal deaths -1.
async fn run_exec(request: ExecRequest) -> ExecReply {
    debug!(id = %request.id, cmd = %request.cmd, "exec");
    let mut command = Command::new(&request.cmd);
    command.args(&request.args);
    if let Some(cwd) = &request.cwd {
        command.current_dir(cwd);
    }

    match command.output().await {
        Err(err) => ExecReply {
            id: request.id,
            stdout: None,
            stderr: Some(format!("failed to spawn {}: {err}", request.cmd)),
            code: Some(127),
        },
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            if output.status.success() {
                ExecReply {
                    id: request.id,
                    stdout: Some(stdout),
                    stderr: Some(stderr),
                    code: None,
                }
            } else {
                ExecReply {
                    id: request.id,
                    stdout: None,
                    stderr: Some(stderr),
                    code: Some(output.status.code().unwrap_or(-1)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn success_carries_stdout_and_no_code() {
        let reply = run_exec(ExecRequest {
            id: "1-0".into(),
            cmd: "echo".into(),
            args: vec!["hello".into()],
            cwd: None,
        })
        .await;
        assert_eq!(reply.code, None);
        assert_eq!(reply.stdout.as_deref(), Some("hello\n"));
    }

    #[tokio::test]
    async fn nonzero_exit_maps_to_code() {
        let reply = run_exec(ExecRequest {
            id: "1-1".into(),
            cmd: "false".into(),
            args: vec![],
            cwd: None,
        })
        .await;
        assert_eq!(reply.code, Some(1));
        assert_eq!(reply.stdout, None);
    }

    #[tokio::test]
    async fn spawn_failure_maps_to_127() {
        let reply = run_exec(ExecRequest {
            id: "1-2".into(),
            cmd: "/nonexistent/definitely-not-here".into(),
            args: vec![],
            cwd: None,
        })
        .await;
        assert_eq!(reply.code, Some(127));
        assert!(reply.stderr.unwrap().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn cwd_is_honored() {
        let dir = std::env::temp_dir();
        let reply = run_exec(ExecRequest {
            id: "1-3".into(),
            cmd: "pwd".into(),
            args: vec![],
            cwd: Some(dir.clone()),
        })
        .await;
        assert_eq!(reply.stdout.unwrap().trim(), dir.to_str().unwrap());
    }
}
