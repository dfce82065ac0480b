//! Operator command handlers.
//!
//! Handlers here edit the state file directly, taking the lock for the
//! duration of the edit so they never race a live cycle. `stop` and `review`
//! are the exception: they must interrupt in-flight work, so they only append
//! to the command queue and let the loop apply them in order.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::{info, warn};

use crate::core::command::{CommandKind, QueuedCommand};
use crate::core::plan::{Plan, WorkerRef};
use crate::core::status::{PlanStatus, check_review_trigger, check_unblock, resume_applies};
use crate::io::init::DispatcherPaths;
use crate::io::lock::{acquire_lock, release_lock};
use crate::io::plan_doc::PlanParser;
use crate::io::process::ProcessHandle;
use crate::io::queue::CommandQueue;
use crate::io::session::SessionRunner;
use crate::io::state::{GlobalState, load_state, save_state};
use crate::io::worktree::WorktreeProvider;

/// Load, edit, save under the lock. The lock is released even when the edit
/// fails.
fn with_state<T>(
    paths: &DispatcherPaths,
    edit: impl FnOnce(&mut GlobalState) -> Result<T>,
) -> Result<T> {
    acquire_lock(&paths.lock_path)?;
    let result = (|| -> Result<T> {
        let mut state = load_state(&paths.state_path)?;
        let value = edit(&mut state)?;
        save_state(&paths.state_path, &state)?;
        Ok(value)
    })();
    if let Err(err) = release_lock(&paths.lock_path) {
        warn!(err = %err, "failed to release lock");
    }
    result
}

fn plan_mut<'a>(state: &'a mut GlobalState, plan_id: &str) -> Result<&'a mut Plan> {
    state
        .plans
        .get_mut(plan_id)
        .ok_or_else(|| anyhow!("no such plan '{plan_id}'"))
}

/// Options for accepting a new plan.
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Plan id; defaults to the plan file's stem.
    pub id: Option<String>,
    /// Agent name; defaults to the configured default agent.
    pub agent: Option<String>,
    /// Base branch; defaults to the configured base branch.
    pub base_branch: Option<String>,
}

/// Accept a plan document: validate it, provision a worktree on a fresh
/// branch, copy the document in, and register the plan as `queued`.
pub fn add_plan(
    paths: &DispatcherPaths,
    parser: &dyn PlanParser,
    provider: &dyn WorktreeProvider,
    plan_file: &Path,
    default_agent: &str,
    default_base: &str,
    options: &AddOptions,
) -> Result<Plan> {
    let id = match &options.id {
        Some(id) => id.clone(),
        None => plan_file
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("cannot derive a plan id from {}", plan_file.display()))?,
    };
    // Validate before any side effects.
    let doc = parser
        .parse(plan_file)
        .with_context(|| format!("parse plan {}", plan_file.display()))?;

    let agent = options.agent.clone().unwrap_or_else(|| default_agent.to_string());
    let base_branch = options
        .base_branch
        .clone()
        .unwrap_or_else(|| default_base.to_string());
    let branch = format!("work/{id}");

    with_state(paths, |state| {
        if state.plans.contains_key(&id) {
            return Err(anyhow!("plan '{id}' already exists"));
        }
        let worktree =
            provider.create_worktree(&paths.root, &paths.worktrees_dir, &branch, &base_branch)?;
        let file_name = plan_file
            .file_name()
            .ok_or_else(|| anyhow!("plan path has no file name"))?;
        let rel_dest = Path::new(file_name);
        provider.copy_file(plan_file, &worktree, rel_dest)?;

        let plan = Plan::new(&id, worktree, &branch, &base_branch, rel_dest, &agent);
        state.plans.insert(id.clone(), plan.clone());
        info!(plan_id = %id, todos = doc.todos.len(), branch, "plan accepted");
        Ok(plan)
    })
}

/// Set the blocked flag; a non-terminal plan also moves to `blocked`.
pub fn block(paths: &DispatcherPaths, plan_id: &str) -> Result<()> {
    with_state(paths, |state| {
        let plan = plan_mut(state, plan_id)?;
        plan.blocked = true;
        if !plan.status.is_terminal() {
            plan.status = PlanStatus::Blocked;
        }
        info!(plan_id, "plan blocked");
        Ok(())
    })
}

/// Clear a blocked plan back to `active` and restart its TODO scan from the
/// top. Completed TODOs stay checked off in the document, so the next
/// dispatch lands on the first one still open.
pub fn unblock(paths: &DispatcherPaths, plan_id: &str) -> Result<()> {
    with_state(paths, |state| {
        let plan = plan_mut(state, plan_id)?;
        check_unblock(&plan.status)?;
        plan.status = PlanStatus::Active;
        plan.blocked = false;
        plan.current_todo = 0;
        plan.retry_count = 0;
        plan.last_error = None;
        info!(plan_id, "plan unblocked");
        Ok(())
    })
}

/// Resume a paused plan. A no-op outside `paused`.
pub fn resume(paths: &DispatcherPaths, plan_id: &str) -> Result<()> {
    with_state(paths, |state| {
        let plan = plan_mut(state, plan_id)?;
        if !resume_applies(&plan.status) {
            info!(plan_id, status = %plan.status, "resume is a no-op");
            return Ok(());
        }
        plan.status = PlanStatus::Active;
        plan.last_error = None;
        info!(plan_id, "plan resumed");
        Ok(())
    })
}

/// Queue an advisory stop. The loop pauses the plan on its next cycle; an
/// already-running worker is left to finish.
pub fn stop(paths: &DispatcherPaths, plan_id: &str) -> Result<()> {
    let state = load_state(&paths.state_path)?;
    if !state.plans.contains_key(plan_id) {
        return Err(anyhow!("no such plan '{plan_id}'"));
    }
    CommandQueue::new(&paths.queue_path).enqueue(&QueuedCommand::new(CommandKind::Stop, plan_id))?;
    info!(plan_id, "stop queued");
    Ok(())
}

/// Queue a review trigger. Rejected up front unless the plan is in `review`,
/// so the operator sees the actual status instead of a silently dropped
/// command.
pub fn review(paths: &DispatcherPaths, plan_id: &str) -> Result<()> {
    let state = load_state(&paths.state_path)?;
    let plan = state
        .plans
        .get(plan_id)
        .ok_or_else(|| anyhow!("no such plan '{plan_id}'"))?;
    check_review_trigger(&plan.status)?;
    CommandQueue::new(&paths.queue_path)
        .enqueue(&QueuedCommand::new(CommandKind::Review, plan_id))?;
    info!(plan_id, "review queued");
    Ok(())
}

/// Forcibly terminate a plan's live worker, clear the reference, and pause
/// the plan. Unlike advisory `stop`, this does not wait for the worker.
pub fn kill(paths: &DispatcherPaths, sessions: &SessionRunner, plan_id: &str) -> Result<()> {
    with_state(paths, |state| {
        let plan = plan_mut(state, plan_id)?;
        match plan.worker.take() {
            Some(WorkerRef::Session(session_id)) => sessions.kill_session(&session_id)?,
            Some(WorkerRef::Process(pid)) => ProcessHandle { pid }.terminate()?,
            None => info!(plan_id, "no live worker to kill"),
        }
        if !plan.status.is_terminal() {
            plan.status = PlanStatus::Paused;
        }
        info!(plan_id, "worker killed");
        Ok(())
    })
}

/// Mark a plan `done`. Terminal; the plan stays in the state map for the
/// record until archived.
pub fn done(paths: &DispatcherPaths, plan_id: &str) -> Result<()> {
    with_state(paths, |state| {
        let plan = plan_mut(state, plan_id)?;
        plan.status = PlanStatus::Done;
        plan.worker = None;
        info!(plan_id, "plan done");
        Ok(())
    })
}

/// Remove a terminal plan from the state map. The worktree and branch are
/// left for the operator to reclaim.
pub fn archive(paths: &DispatcherPaths, plan_id: &str) -> Result<Plan> {
    with_state(paths, |state| {
        let plan = state
            .plans
            .get(plan_id)
            .ok_or_else(|| anyhow!("no such plan '{plan_id}'"))?;
        if !plan.status.is_terminal() {
            return Err(anyhow!(
                "cannot archive '{plan_id}': plan is '{}', not done",
                plan.status
            ));
        }
        let plan = state
            .plans
            .remove(plan_id)
            .ok_or_else(|| anyhow!("no such plan '{plan_id}'"))?;
        info!(plan_id, "plan archived");
        Ok(plan)
    })
}

/// Read-only snapshot for status display. Takes no lock; the state file is
/// replaced atomically so a concurrent save is never seen half-written.
pub fn snapshot(paths: &DispatcherPaths) -> Result<GlobalState> {
    load_state(&paths.state_path)
}
