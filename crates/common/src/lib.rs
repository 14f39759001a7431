// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod protocol;
pub mod stats;

pub use protocol::{ExecReply, ExecRequest, HelperReply, HelperRequest, ReadyMsg, PROTOCOL_VERSION};
pub use stats::{apply_stat_update, Stat, StatUpdate, TelemetryDoc};
