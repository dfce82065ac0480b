//! Operator commands carried through the append-only queue.
//!
//! Only commands that must interrupt in-flight work travel through the queue;
//! everything else (`block`, `unblock`, `resume`, `done`) is a direct state
//! edit taken under the lock between cycles.

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// Kind of queued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    /// Advisory cancellation: prevents relaunch on the next cycle without
    /// killing an already-running worker.
    Stop,
    /// Move a plan from `review` into `reviewing`.
    Review,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Stop => "stop",
            CommandKind::Review => "review",
        }
    }
}

/// One queue entry, consumed exactly once in FIFO order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedCommand {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    pub plan_id: String,
    pub enqueued_at: Timestamp,
}

impl QueuedCommand {
    pub fn new(kind: CommandKind, plan_id: impl Into<String>) -> Self {
        Self {
            kind,
            plan_id: plan_id.into(),
            enqueued_at: Timestamp::now(),
        }
    }
}
