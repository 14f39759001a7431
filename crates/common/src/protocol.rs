// # -----------------------------
// # crates/common/src/protocol.rs
// # -----------------------------
//! Wire types for the stdio channel between the supervisor and the
//! privileged helper. Every message is a single line of JSON.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Version announced by the helper in its ready message. The supervisor
/// refuses to start against a helper speaking a different version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Requests the supervisor writes to the helper's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelperRequest {
    Exec(ExecRequest),
}

/// A single command execution. `id` correlates the eventual reply;
/// `args` are passed verbatim, no shell is involved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub id: String,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

/// Reply for one [`ExecRequest`]. `code` is only present on failure:
/// the command's exit code, 127 when it could not be spawned, or -1
/// when it was killed by a signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecReply {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
}

/// First line the helper emits once its read loop is up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyMsg {
    #[serde(rename = "type")]
    pub tag: ReadyTag,
    pub v: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyTag {
    Ready,
}

impl ReadyMsg {
    pub fn new() -> Self {
        Self {
            tag: ReadyTag::Ready,
            v: PROTOCOL_VERSION,
        }
    }
}

impl Default for ReadyMsg {
    fn default() -> Self {
        Self::new()
    }
}

/// Anything the helper writes to stdout. The ready message carries a
/// `type` field and no `id`; exec replies carry an `id` and no `type`,
/// so an untagged enum disambiguates cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HelperReply {
    Ready(ReadyMsg),
    Exec(ExecReply),
}
