//! Plan record and TODO item types.

use std::path::PathBuf;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::core::status::PlanStatus;

/// Reference to a plan's live worker, if any.
///
/// Session-backed workers are polled through the session marker protocol;
/// headless workers expose only a pid for signal probes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRef {
    Session(String),
    Process(u32),
}

/// One tracked plan: an ordered TODO list executing inside its own worktree.
///
/// Process fields (`worker`, `last_poll_at`) are mutated only by the
/// Dispatcher cycle; status overrides come only from operator commands. A plan
/// leaves the state map only through explicit archival.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub status: PlanStatus,
    /// Orthogonal to `status`: any non-terminal status may co-occur with it.
    #[serde(default)]
    pub blocked: bool,
    pub worktree: PathBuf,
    pub branch: String,
    pub base_branch: String,
    /// Plan document path relative to the worktree root.
    pub plan_path: PathBuf,
    /// 0-based index of the TODO currently being dispatched.
    #[serde(default)]
    pub current_todo: usize,
    /// Failed attempts against the current TODO.
    #[serde(default)]
    pub retry_count: u32,
    pub agent: String,
    #[serde(default)]
    pub worker: Option<WorkerRef>,
    #[serde(default)]
    pub last_poll_at: Option<Timestamp>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Review feedback carried into the next dispatch, when triage produced one.
    #[serde(default)]
    pub change_request: Option<String>,
    /// Id of the newest review item already seen by the poll cursor.
    #[serde(default)]
    pub review_cursor: Option<String>,
}

impl Plan {
    /// A freshly accepted plan, parked in `queued` until capacity frees.
    pub fn new(
        id: impl Into<String>,
        worktree: impl Into<PathBuf>,
        branch: impl Into<String>,
        base_branch: impl Into<String>,
        plan_path: impl Into<PathBuf>,
        agent: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            status: PlanStatus::Queued,
            blocked: false,
            worktree: worktree.into(),
            branch: branch.into(),
            base_branch: base_branch.into(),
            plan_path: plan_path.into(),
            current_todo: 0,
            retry_count: 0,
            agent: agent.into(),
            worker: None,
            last_poll_at: None,
            last_error: None,
            change_request: None,
            review_cursor: None,
        }
    }

    /// Eligible for a new agent launch this cycle.
    pub fn dispatch_eligible(&self) -> bool {
        self.status == PlanStatus::Active && !self.blocked && self.worker.is_none()
    }
}

/// The smallest dispatchable task within a plan. Owned by the parsed plan
/// document; the Dispatcher tracks only the current index and retry count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    /// 0-based position within the plan document.
    pub index: usize,
    pub text: String,
    pub done: bool,
    pub blocked: bool,
}

/// Operator-facing TODO label. Internal indices are 0-based; everything shown
/// to a human is 1-based.
pub fn todo_display(index: usize) -> String {
    format!("TODO #{}", index + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn todo_display_is_one_based() {
        assert_eq!(todo_display(0), "TODO #1");
        assert_eq!(todo_display(2), "TODO #3");
    }

    #[test]
    fn new_plan_is_queued_and_clean() {
        let plan = Plan::new("p1", "/tmp/wt", "work/p1", "main", "PLAN.md", "claude");
        assert_eq!(plan.status, PlanStatus::Queued);
        assert!(!plan.blocked);
        assert_eq!(plan.current_todo, 0);
        assert_eq!(plan.retry_count, 0);
        assert!(plan.worker.is_none());
    }

    #[test]
    fn dispatch_eligibility_requires_active_unblocked_idle() {
        let mut plan = Plan::new("p1", "/tmp/wt", "work/p1", "main", "PLAN.md", "claude");
        assert!(!plan.dispatch_eligible());

        plan.status = PlanStatus::Active;
        assert!(plan.dispatch_eligible());

        plan.blocked = true;
        assert!(!plan.dispatch_eligible());

        plan.blocked = false;
        plan.worker = Some(WorkerRef::Session("p1".to_string()));
        assert!(!plan.dispatch_eligible());
    }

    /// `status` and `blocked` are independent fields: a paused plan can carry
    /// the blocked flag without changing status.
    #[test]
    fn blocked_flag_is_orthogonal_to_status() {
        let mut plan = Plan::new("p1", "/tmp/wt", "work/p1", "main", "PLAN.md", "claude");
        plan.status = PlanStatus::Paused;
        plan.blocked = true;
        assert_eq!(plan.status, PlanStatus::Paused);

        let json = serde_json::to_string(&plan).expect("serialize");
        let back: Plan = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.status, PlanStatus::Paused);
        assert!(back.blocked);
    }
}
