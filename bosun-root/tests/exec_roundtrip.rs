#![cfg(unix)]

//! End-to-end checks against the real bosun-root binary: handshake,
//! correlated replies over stdio, and clean shutdown on stdin EOF.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use bosun_common::{ExecReply, ExecRequest, HelperReply, HelperRequest, PROTOCOL_VERSION};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

fn helper_binary() -> PathBuf {
    // target/debug/deps/<test-bin> -> target/debug/bosun-root
    let exe = std::env::current_exe().expect("current_exe");
    let target_dir = exe
        .parent()
        .and_then(|p| p.parent())
        .expect("target debug dir");
    let candidate = target_dir.join("bosun-root");
    if candidate.is_file() {
        return candidate;
    }
    target_dir
        .parent()
        .map(|p| p.join("debug").join("bosun-root"))
        .unwrap_or(candidate)
}

fn request_line(id: &str, cmd: &str, args: &[&str], cwd: Option<PathBuf>) -> String {
    let request = HelperRequest::Exec(ExecRequest {
        id: id.into(),
        cmd: cmd.into(),
        args: args.iter().map(|a| a.to_string()).collect(),
        cwd,
    });
    format!("{}\n", serde_json::to_string(&request).unwrap())
}

#[tokio::test]
async fn helper_replies_once_per_id_and_exits_on_eof() {
    let mut child = Command::new(helper_binary())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn bosun-root");
    let mut stdin = child.stdin.take().expect("piped stdin");
    let mut lines = BufReader::new(child.stdout.take().expect("piped stdout")).lines();

    let first = tokio::time::timeout(Duration::from_millis(500), lines.next_line())
        .await
        .expect("ready within the handshake window")
        .unwrap()
        .expect("a ready line");
    match serde_json::from_str::<HelperReply>(&first).unwrap() {
        HelperReply::Ready(msg) => assert_eq!(msg.v, PROTOCOL_VERSION),
        other => panic!("expected ready first, got {other:?}"),
    }

    let cwd = std::env::temp_dir();
    stdin
        .write_all(request_line("t-0", "echo", &["hello"], None).as_bytes())
        .await
        .unwrap();
    stdin
        .write_all(request_line("t-1", "false", &[], None).as_bytes())
        .await
        .unwrap();
    stdin
        .write_all(request_line("t-2", "pwd", &[], Some(cwd.clone())).as_bytes())
        .await
        .unwrap();
    stdin.flush().await.unwrap();

    let mut replies: HashMap<String, ExecReply> = HashMap::new();
    while replies.len() < 3 {
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("reply in time")
            .unwrap()
            .expect("a reply line");
        match serde_json::from_str::<HelperReply>(&line).unwrap() {
            HelperReply::Exec(reply) => {
                assert!(
                    replies.insert(reply.id.clone(), reply).is_none(),
                    "duplicate reply id"
                );
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    let echo = &replies["t-0"];
    assert_eq!(echo.code, None);
    assert_eq!(echo.stdout.as_deref(), Some("hello\n"));

    let failed = &replies["t-1"];
    assert_eq!(failed.code, Some(1));
    assert_eq!(failed.stdout, None);

    let pwd = &replies["t-2"];
    assert_eq!(pwd.stdout.as_deref().map(str::trim), cwd.to_str());

    drop(stdin);
    let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
        .await
        .expect("exit after stdin EOF")
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn malformed_lines_are_ignored_and_later_requests_still_work() {
    let mut child = Command::new(helper_binary())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn bosun-root");
    let mut stdin = child.stdin.take().expect("piped stdin");
    let mut lines = BufReader::new(child.stdout.take().expect("piped stdout")).lines();

    // Skip the ready line.
    let _ = lines.next_line().await.unwrap().unwrap();

    stdin.write_all(b"this is not json\n\n").await.unwrap();
    stdin
        .write_all(request_line("t-0", "echo", &["ok"], None).as_bytes())
        .await
        .unwrap();
    stdin.flush().await.unwrap();

    let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("reply in time")
        .unwrap()
        .expect("a reply line");
    match serde_json::from_str::<HelperReply>(&line).unwrap() {
        HelperReply::Exec(reply) => {
            assert_eq!(reply.id, "t-0");
            assert_eq!(reply.stdout.as_deref(), Some("ok\n"));
        }
        other => panic!("unexpected message {other:?}"),
    }

    drop(stdin);
    let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
}
