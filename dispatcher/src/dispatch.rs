//! The Dispatcher control loop.
//!
//! Single-threaded and cooperative: one cycle at a time, each plan's worker
//! advanced at most one phase per cycle (launch, poll, reap). Real concurrency
//! across plans comes from the OS processes hosting the agents, not from this
//! loop. Every cycle runs entirely under the lock and ends with one atomic
//! state save, so no transaction ever spans more than one cycle.

use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use jiff::Timestamp;
use tracing::{info, instrument, warn};

use crate::agents::{AgentAdapter, ExecRequest, UnknownAgentError};
use crate::core::plan::{Plan, TodoItem, WorkerRef};
use crate::core::policy::{TodoOutcome, apply_exit};
use crate::core::status::PlanStatus;
use crate::events::{DispatchEvent, EventBus};
use crate::io::config::DispatcherConfig;
use crate::io::git::Git;
use crate::io::init::DispatcherPaths;
use crate::io::lock::{acquire_lock, release_lock};
use crate::io::plan_doc::{PlanDoc, PlanParser, mark_todo_done};
use crate::io::process::{ProcessHandle, ProcessPoll};
use crate::io::prompt::PromptRenderer;
use crate::io::queue::CommandQueue;
use crate::io::review::{ReviewContext, ReviewPollState, ReviewProvider};
use crate::io::session::{SessionPoll, SessionRunner};
use crate::io::state::{GlobalState, load_state, save_state};

/// Resolves an agent name to its adapter. Seam for tests; production code
/// uses the built-in registry.
pub trait AgentResolver {
    fn resolve(&self, name: &str) -> Result<&dyn AgentAdapter, UnknownAgentError>;
}

/// The closed registry in `crate::agents`.
#[derive(Debug, Clone, Default)]
pub struct RegistryResolver;

impl AgentResolver for RegistryResolver {
    fn resolve(&self, name: &str) -> Result<&dyn AgentAdapter, UnknownAgentError> {
        crate::agents::adapter_for(name)
    }
}

/// Summary of one cycle, for logging and `once` output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub commands_applied: usize,
    pub promoted: usize,
    pub launched: usize,
    pub completed: usize,
    pub plans: usize,
}

/// The control loop and its collaborators.
pub struct Dispatcher<'a> {
    paths: DispatcherPaths,
    config: DispatcherConfig,
    sessions: SessionRunner,
    queue: CommandQueue,
    events: EventBus,
    renderer: PromptRenderer,
    parser: &'a dyn PlanParser,
    review: &'a dyn ReviewProvider,
    resolver: &'a dyn AgentResolver,
}

const EVENT_CAPACITY: usize = 256;

impl<'a> Dispatcher<'a> {
    pub fn new(
        root: &Path,
        config: DispatcherConfig,
        parser: &'a dyn PlanParser,
        review: &'a dyn ReviewProvider,
        resolver: &'a dyn AgentResolver,
    ) -> Self {
        let paths = DispatcherPaths::new(root);
        let sessions = SessionRunner::new(
            &paths.sessions_dir,
            Duration::from_millis(config.session_poll_interval_ms),
            config.missing_marker_exit_code,
        );
        let queue = CommandQueue::new(&paths.queue_path);
        Self {
            paths,
            config,
            sessions,
            queue,
            events: EventBus::start(EVENT_CAPACITY),
            renderer: PromptRenderer::new(),
            parser,
            review,
            resolver,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn sessions(&self) -> &SessionRunner {
        &self.sessions
    }

    /// Run cycles until interrupted, sleeping a fixed interval between them.
    pub fn run_loop(&self) -> Result<()> {
        loop {
            let outcome = self.cycle()?;
            info!(
                plans = outcome.plans,
                commands = outcome.commands_applied,
                launched = outcome.launched,
                completed = outcome.completed,
                "cycle complete"
            );
            thread::sleep(Duration::from_secs(self.config.cycle_interval_secs));
        }
    }

    /// One full cycle under the lock. Fails fast with `LockHeldError` when
    /// another Dispatcher is live.
    #[instrument(skip_all)]
    pub fn cycle(&self) -> Result<CycleOutcome> {
        acquire_lock(&self.paths.lock_path)?;
        let result = self.cycle_locked();
        // Release even when the cycle failed; the lock must never outlive us.
        if let Err(err) = release_lock(&self.paths.lock_path) {
            warn!(err = %err, "failed to release lock");
        }
        result
    }

    fn cycle_locked(&self) -> Result<CycleOutcome> {
        let mut state = load_state(&self.paths.state_path)?;
        let mut outcome = CycleOutcome {
            plans: state.plans.len(),
            ..CycleOutcome::default()
        };

        outcome.commands_applied = self.drain_queue(&mut state)?;
        outcome.promoted = self.promote_queued(&mut state);
        outcome.launched = self.launch_eligible(&mut state);
        self.poll_reviewing(&mut state);
        outcome.completed = self.poll_workers(&mut state);

        // The loop must not proceed past an unsaved snapshot.
        save_state(&self.paths.state_path, &state)
            .context("persist state after cycle")?;
        Ok(outcome)
    }

    /// Apply queued commands strictly in enqueue order, advancing the cursor
    /// once per entry. The cursor never rewinds, so each entry is handled at
    /// most once across restarts.
    fn drain_queue(&self, state: &mut GlobalState) -> Result<usize> {
        let entries = self.queue.read_after(state.control_cursor)?;
        let mut applied = 0usize;
        for cmd in entries {
            state.control_cursor += 1;
            applied += 1;
            let Some(plan) = state.plans.get_mut(&cmd.plan_id) else {
                warn!(plan_id = %cmd.plan_id, kind = cmd.kind.as_str(), "queued command for unknown plan");
                continue;
            };
            match cmd.kind {
                crate::core::command::CommandKind::Stop => {
                    if plan.status.is_terminal() {
                        warn!(plan_id = %plan.id, "stop on terminal plan ignored");
                        continue;
                    }
                    // Advisory: prevents relaunch, never kills a running worker.
                    let from = plan.status.clone();
                    plan.status = PlanStatus::Paused;
                    self.events.publish(DispatchEvent::StatusChanged {
                        plan_id: plan.id.clone(),
                        from,
                        to: PlanStatus::Paused,
                    });
                }
                crate::core::command::CommandKind::Review => {
                    if plan.status != PlanStatus::Review {
                        warn!(
                            plan_id = %plan.id,
                            status = %plan.status,
                            "review command on plan not in review, skipping"
                        );
                        plan.last_error = Some(format!(
                            "review command skipped: plan was '{}'",
                            plan.status
                        ));
                        continue;
                    }
                    plan.status = PlanStatus::Reviewing;
                    self.events.publish(DispatchEvent::StatusChanged {
                        plan_id: plan.id.clone(),
                        from: PlanStatus::Review,
                        to: PlanStatus::Reviewing,
                    });
                }
            }
            self.events.publish(DispatchEvent::CommandApplied {
                plan_id: cmd.plan_id.clone(),
                kind: cmd.kind,
            });
        }
        Ok(applied)
    }

    /// Promote queued plans while capacity allows. Promotion order is plan id
    /// order, which is deterministic across runs.
    fn promote_queued(&self, state: &mut GlobalState) -> usize {
        let mut active = state
            .plans
            .values()
            .filter(|p| p.status == PlanStatus::Active)
            .count();
        let queued: Vec<String> = state
            .plans
            .values()
            .filter(|p| p.status == PlanStatus::Queued && !p.blocked)
            .map(|p| p.id.clone())
            .collect();
        let mut promoted = 0usize;
        for id in queued {
            if active >= self.config.max_active {
                break;
            }
            let Some(plan) = state.plans.get_mut(&id) else {
                continue;
            };
            plan.status = PlanStatus::Active;
            active += 1;
            promoted += 1;
            self.events.publish(DispatchEvent::StatusChanged {
                plan_id: id,
                from: PlanStatus::Queued,
                to: PlanStatus::Active,
            });
        }
        promoted
    }

    /// Launch an agent for every dispatch-eligible plan with no live worker.
    /// Per-plan failures are recorded on the plan and never abort the cycle.
    fn launch_eligible(&self, state: &mut GlobalState) -> usize {
        let ids: Vec<String> = state
            .plans
            .values()
            .filter(|p| p.dispatch_eligible())
            .map(|p| p.id.clone())
            .collect();
        let mut launched = 0usize;
        for id in ids {
            let Some(plan) = state.plans.get_mut(&id) else {
                continue;
            };
            match self.launch_one(plan) {
                Ok(true) => launched += 1,
                Ok(false) => {}
                Err(err) => {
                    // Launch failures (session creation, spawn) count against
                    // the retry budget rather than crashing the loop.
                    warn!(plan_id = %plan.id, err = %err, "launch failed");
                    plan.retry_count += 1;
                    plan.last_error = Some(format!("launch failed: {err:#}"));
                    if plan.retry_count >= self.config.retry_budget {
                        let from = plan.status.clone();
                        plan.status = PlanStatus::Blocked;
                        plan.blocked = true;
                        self.events.publish(DispatchEvent::StatusChanged {
                            plan_id: plan.id.clone(),
                            from,
                            to: PlanStatus::Blocked,
                        });
                    }
                }
            }
        }
        launched
    }

    /// Returns Ok(true) when a worker was launched.
    fn launch_one(&self, plan: &mut Plan) -> Result<bool> {
        let doc = self.parse_doc(plan)?;

        let todo = match doc.first_open_todo(plan.current_todo) {
            Some(todo) => todo.clone(),
            None => {
                if doc.all_done() {
                    if plan.change_request.is_some() {
                        // Review feedback outstanding: dispatch a feedback run
                        // instead of parking in review.
                        let todo = feedback_todo(&doc);
                        return self.launch_worker(plan, &doc, &todo);
                    }
                    let from = plan.status.clone();
                    plan.status = PlanStatus::Review;
                    self.events.publish(DispatchEvent::StatusChanged {
                        plan_id: plan.id.clone(),
                        from,
                        to: PlanStatus::Review,
                    });
                    return Ok(false);
                }
                // Open TODOs remain but all are blocked.
                plan.blocked = true;
                plan.last_error =
                    Some("all remaining TODO items are marked blocked".to_string());
                return Ok(false);
            }
        };
        plan.current_todo = todo.index;
        self.launch_worker(plan, &doc, &todo)
    }

    fn launch_worker(&self, plan: &mut Plan, doc: &PlanDoc, todo: &TodoItem) -> Result<bool> {
        let adapter = match self.resolver.resolve(&plan.agent) {
            Ok(adapter) => adapter,
            Err(err) => {
                // Unknown agent is not retryable: block immediately.
                warn!(plan_id = %plan.id, err = %err, "unknown agent");
                plan.status = PlanStatus::Blocked;
                plan.blocked = true;
                plan.last_error = Some(err.to_string());
                self.events.publish(DispatchEvent::StatusChanged {
                    plan_id: plan.id.clone(),
                    from: PlanStatus::Active,
                    to: PlanStatus::Blocked,
                });
                return Ok(false);
            }
        };

        let prompt = self.renderer.render_worker_prompt(plan, doc, todo)?;
        let request = ExecRequest {
            workdir: plan.worktree.clone(),
            prompt,
            session: Some(plan.id.clone()),
            model: None,
        };
        let worker = adapter.launch(&self.sessions, &request)?;
        plan.worker = Some(worker);
        plan.last_poll_at = Some(Timestamp::now());
        self.events.publish(DispatchEvent::WorkerLaunched {
            plan_id: plan.id.clone(),
            todo: todo.index,
        });
        Ok(true)
    }

    /// Poll the review provider for every plan in `reviewing`; fresh items
    /// move the plan through `triaging` and back to `active` with the newest
    /// item recorded as the change request.
    fn poll_reviewing(&self, state: &mut GlobalState) {
        let ids: Vec<String> = state
            .plans
            .values()
            .filter(|p| p.status == PlanStatus::Reviewing)
            .map(|p| p.id.clone())
            .collect();
        for id in ids {
            let Some(plan) = state.plans.get_mut(&id) else {
                continue;
            };
            let ctx = ReviewContext {
                repo_root: plan.worktree.clone(),
                branch: plan.branch.clone(),
            };
            let prior = ReviewPollState {
                last_seen: plan.review_cursor.clone(),
            };
            let (items, new_state) = match self.review.poll(&ctx, &prior) {
                Ok(polled) => polled,
                Err(err) => {
                    // Provider errors are retried next cycle, up to the same
                    // budget that governs worker attempts.
                    warn!(plan_id = %plan.id, err = %err, "review poll failed");
                    plan.retry_count += 1;
                    plan.last_error = Some(format!("review poll failed: {err:#}"));
                    if plan.retry_count >= self.config.retry_budget {
                        plan.status = PlanStatus::Blocked;
                        plan.blocked = true;
                        self.events.publish(DispatchEvent::StatusChanged {
                            plan_id: plan.id.clone(),
                            from: PlanStatus::Reviewing,
                            to: PlanStatus::Blocked,
                        });
                    }
                    continue;
                }
            };
            plan.retry_count = 0;
            plan.review_cursor = new_state.last_seen;
            plan.last_poll_at = Some(Timestamp::now());
            if items.is_empty() {
                continue;
            }
            self.events.publish(DispatchEvent::ReviewItemsReceived {
                plan_id: plan.id.clone(),
                count: items.len(),
            });
            plan.status = PlanStatus::Triaging;
            self.events.publish(DispatchEvent::StatusChanged {
                plan_id: plan.id.clone(),
                from: PlanStatus::Reviewing,
                to: PlanStatus::Triaging,
            });
            // Triage outcome policy: carry the newest item into the next
            // dispatch and return the plan to the active path.
            if let Some(newest) = items.last() {
                plan.change_request = Some(newest.body.clone());
            }
            plan.retry_count = 0;
            plan.status = PlanStatus::Active;
            self.events.publish(DispatchEvent::StatusChanged {
                plan_id: plan.id.clone(),
                from: PlanStatus::Triaging,
                to: PlanStatus::Active,
            });
        }
    }

    /// Non-blocking poll of every live worker; completed workers are reaped
    /// and the outcome policy applied.
    fn poll_workers(&self, state: &mut GlobalState) -> usize {
        let ids: Vec<String> = state
            .plans
            .values()
            .filter(|p| p.worker.is_some())
            .map(|p| p.id.clone())
            .collect();
        let mut completed = 0usize;
        for id in ids {
            let Some(plan) = state.plans.get_mut(&id) else {
                continue;
            };
            let Some(worker) = plan.worker.clone() else {
                continue;
            };
            let exit_code = match self.poll_worker(&worker) {
                Ok(None) => {
                    plan.last_poll_at = Some(Timestamp::now());
                    continue;
                }
                Ok(Some(exit_code)) => exit_code,
                Err(err) => {
                    // An unreadable result (garbage in the marker file) is a
                    // failed attempt, not a reason to poll the same worker
                    // forever. Clearing the worker lets the next launch
                    // re-prepare the session files.
                    warn!(plan_id = %plan.id, err = %err, "worker poll failed");
                    plan.worker = None;
                    plan.last_poll_at = Some(Timestamp::now());
                    plan.retry_count += 1;
                    plan.last_error = Some(format!("worker poll failed: {err:#}"));
                    if plan.retry_count >= self.config.retry_budget {
                        let from = plan.status.clone();
                        plan.status = PlanStatus::Blocked;
                        plan.blocked = true;
                        self.events.publish(DispatchEvent::StatusChanged {
                            plan_id: plan.id.clone(),
                            from,
                            to: PlanStatus::Blocked,
                        });
                    }
                    continue;
                }
            };
            plan.worker = None;
            plan.last_poll_at = Some(Timestamp::now());
            completed += 1;
            self.reap(plan, exit_code);
        }
        completed
    }

    fn poll_worker(&self, worker: &WorkerRef) -> Result<Option<i32>> {
        match worker {
            WorkerRef::Session(session_id) => match self.sessions.poll(session_id)? {
                SessionPoll::Running => Ok(None),
                SessionPoll::Completed { exit_code } => Ok(Some(exit_code)),
            },
            WorkerRef::Process(pid) => {
                let handle = ProcessHandle { pid: *pid };
                match handle.poll()? {
                    ProcessPoll::Running => Ok(None),
                    ProcessPoll::Exited { exit_code } => Ok(Some(exit_code)),
                    // Exit code unobservable: apply the missing-result policy.
                    ProcessPoll::Gone => Ok(Some(self.config.missing_marker_exit_code)),
                }
            }
        }
    }

    /// Apply the retry/advance policy for a finished attempt.
    fn reap(&self, plan: &mut Plan, exit_code: i32) {
        let doc = match self.parse_doc(plan) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(plan_id = %plan.id, err = %err, "plan document unreadable at reap");
                plan.last_error = Some(format!("plan document unreadable: {err:#}"));
                return;
            }
        };
        let total = doc.todos.len();

        // A feedback run has no TODO of its own: success returns the plan to
        // review for another round.
        if plan.change_request.is_some() && doc.all_done() {
            if exit_code == 0 {
                plan.change_request = None;
                plan.retry_count = 0;
                plan.last_error = None;
                self.commit_plan(plan, "Address review feedback");
                // Best-effort acknowledgement on the feedback channel.
                let ctx = ReviewContext {
                    repo_root: plan.worktree.clone(),
                    branch: plan.branch.clone(),
                };
                if let Err(err) = self.review.respond(
                    &ctx,
                    "Feedback addressed; plan is back in review.",
                    plan.review_cursor.as_deref(),
                ) {
                    warn!(plan_id = %plan.id, err = %err, "review acknowledgement failed");
                }
                plan.status = PlanStatus::Review;
                self.events.publish(DispatchEvent::StatusChanged {
                    plan_id: plan.id.clone(),
                    from: PlanStatus::Active,
                    to: PlanStatus::Review,
                });
            } else {
                self.fail_attempt(plan, total, exit_code);
            }
            return;
        }

        let completed_index = plan.current_todo;
        match apply_exit(plan, exit_code, self.config.retry_budget, total) {
            TodoOutcome::Advanced { completed_todo } | TodoOutcome::PlanComplete { completed_todo } => {
                let text = doc
                    .todos
                    .get(completed_todo)
                    .map(|t| t.text.clone())
                    .unwrap_or_else(|| format!("Complete TODO #{}", completed_todo + 1));
                let plan_file = plan.worktree.join(&plan.plan_path);
                if let Err(err) = mark_todo_done(&plan_file, completed_todo) {
                    warn!(plan_id = %plan.id, err = %err, "failed to check off TODO");
                }
                // Commit message is the TODO text verbatim.
                self.commit_plan(plan, &text);
                self.events.publish(DispatchEvent::TodoCompleted {
                    plan_id: plan.id.clone(),
                    todo: completed_todo,
                });
                if plan.status == PlanStatus::Review {
                    self.events.publish(DispatchEvent::StatusChanged {
                        plan_id: plan.id.clone(),
                        from: PlanStatus::Active,
                        to: PlanStatus::Review,
                    });
                }
            }
            TodoOutcome::Retrying { retry_count } => {
                self.events.publish(DispatchEvent::TodoFailed {
                    plan_id: plan.id.clone(),
                    todo: completed_index,
                    exit_code,
                    retry_count,
                });
            }
            TodoOutcome::Exhausted => {
                self.events.publish(DispatchEvent::TodoFailed {
                    plan_id: plan.id.clone(),
                    todo: completed_index,
                    exit_code,
                    retry_count: plan.retry_count,
                });
                self.events.publish(DispatchEvent::StatusChanged {
                    plan_id: plan.id.clone(),
                    from: PlanStatus::Active,
                    to: PlanStatus::Blocked,
                });
            }
        }
    }

    fn fail_attempt(&self, plan: &mut Plan, total: usize, exit_code: i32) {
        let outcome = apply_exit(plan, exit_code, self.config.retry_budget, total.max(1));
        if matches!(outcome, TodoOutcome::Exhausted) {
            self.events.publish(DispatchEvent::StatusChanged {
                plan_id: plan.id.clone(),
                from: PlanStatus::Active,
                to: PlanStatus::Blocked,
            });
        }
    }

    fn commit_plan(&self, plan: &mut Plan, message: &str) {
        match Git::new(&plan.worktree).commit_all(message) {
            Ok(_) => {}
            Err(err) => {
                warn!(plan_id = %plan.id, err = %err, "commit failed");
                plan.last_error = Some(format!("commit failed: {err:#}"));
            }
        }
    }

    fn parse_doc(&self, plan: &Plan) -> Result<PlanDoc> {
        self.parser.parse(&plan.worktree.join(&plan.plan_path))
    }
}

/// Synthetic task for a review-feedback run; numbered after the real TODOs.
fn feedback_todo(doc: &PlanDoc) -> TodoItem {
    TodoItem {
        index: doc.todos.len(),
        text: "Address the review feedback below".to_string(),
        done: false,
        blocked: false,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::process::Command;

    use super::*;
    use crate::core::command::{CommandKind, QueuedCommand};
    use crate::io::lock::LockHeldError;
    use crate::io::plan_doc::MarkdownPlanParser;
    use crate::test_support::{
        ScriptedResolver, ScriptedReviewProvider, TestWorkspace, review_item,
    };

    const DOC: &str = "# Demo plan\n\n- [ ] First task\n- [ ] Second task\n";
    const DOC_DONE: &str = "# Demo plan\n\n- [x] First task\n- [x] Second task\n";

    fn dispatcher<'a>(
        ws: &TestWorkspace,
        config: DispatcherConfig,
        review: &'a ScriptedReviewProvider,
        resolver: &'a ScriptedResolver,
    ) -> Dispatcher<'a> {
        Dispatcher::new(ws.root(), config, &MarkdownPlanParser, review, resolver)
    }

    /// A live pid that stays alive for the whole test: our own.
    fn running_worker() -> WorkerRef {
        WorkerRef::Process(std::process::id())
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .expect("run git");
        assert!(status.success(), "git {args:?} failed");
    }

    fn init_repo(dir: &Path) {
        git(dir, &["init", "-q"]);
        git(dir, &["config", "user.email", "test@example.com"]);
        git(dir, &["config", "user.name", "Test"]);
        git(dir, &["add", "-A"]);
        git(dir, &["commit", "-q", "-m", "initial"]);
    }

    fn write_marker(ws: &TestWorkspace, session_id: &str, exit_code: i32) {
        let dir = ws.paths.sessions_dir.join(session_id);
        fs::create_dir_all(&dir).expect("session dir");
        fs::write(dir.join("exit_code"), format!("{exit_code}\n")).expect("marker");
    }

    #[test]
    fn cycle_fails_fast_when_lock_is_held() {
        let ws = TestWorkspace::new();
        let review = ScriptedReviewProvider::new();
        let resolver = ScriptedResolver::new("scripted");
        let d = dispatcher(&ws, DispatcherConfig::default(), &review, &resolver);

        acquire_lock(&ws.paths.lock_path).expect("hold lock");
        let err = d.cycle().unwrap_err();
        assert!(err.downcast_ref::<LockHeldError>().is_some(), "{err:#}");
        release_lock(&ws.paths.lock_path).expect("release");

        d.cycle().expect("cycle after release");
    }

    #[test]
    fn launches_eligible_plan_and_renders_current_todo() {
        let ws = TestWorkspace::new();
        let review = ScriptedReviewProvider::new();
        let resolver = ScriptedResolver::new("scripted");
        let config = DispatcherConfig::default();
        let d = dispatcher(&ws, config, &review, &resolver);
        let events = d.events().subscribe();

        let mut state = GlobalState::default();
        let plan = ws.active_plan("p1", "scripted", DOC);
        state.plans.insert(plan.id.clone(), plan);
        ws.save(&state);

        resolver.adapter.script_worker(running_worker());
        let outcome = d.cycle().expect("cycle");
        assert_eq!(outcome.launched, 1);

        let state = ws.load();
        let plan = &state.plans["p1"];
        assert_eq!(plan.worker, Some(running_worker()));
        assert_eq!(plan.status, PlanStatus::Active);

        let launches = resolver.adapter.launches();
        assert_eq!(launches.len(), 1);
        assert!(launches[0].prompt.contains("TODO #1"));
        assert!(launches[0].prompt.contains("First task"));
        assert_eq!(launches[0].session.as_deref(), Some("p1"));

        let launched = events
            .try_iter()
            .any(|e| matches!(e, DispatchEvent::WorkerLaunched { ref plan_id, todo: 0 } if plan_id == "p1"));
        assert!(launched);
    }

    /// Exit 0 checks off the TODO in the plan document and commits with the
    /// TODO text verbatim as the message.
    #[test]
    fn completed_todo_advances_checks_off_and_commits_verbatim() {
        let ws = TestWorkspace::new();
        let review = ScriptedReviewProvider::new();
        let resolver = ScriptedResolver::new("scripted");
        let d = dispatcher(&ws, DispatcherConfig::default(), &review, &resolver);

        let mut state = GlobalState::default();
        let plan = ws.active_plan("p1", "scripted", DOC);
        let worktree = plan.worktree.clone();
        init_repo(&worktree);
        state.plans.insert(plan.id.clone(), plan);
        ws.save(&state);

        resolver.adapter.script_worker(WorkerRef::Session("p1".to_string()));
        write_marker(&ws, "p1", 0);
        d.cycle().expect("cycle");

        let state = ws.load();
        let plan = &state.plans["p1"];
        assert!(plan.worker.is_none());
        assert_eq!(plan.current_todo, 1);
        assert_eq!(plan.retry_count, 0);
        assert_eq!(plan.status, PlanStatus::Active);

        let doc = fs::read_to_string(worktree.join("PLAN.md")).expect("read doc");
        assert!(doc.contains("[x] First task"));
        assert!(doc.contains("[ ] Second task"));

        let log = Command::new("git")
            .args(["log", "-1", "--format=%s"])
            .current_dir(&worktree)
            .output()
            .expect("git log");
        assert_eq!(String::from_utf8_lossy(&log.stdout).trim(), "First task");
    }

    #[test]
    fn retry_budget_exhaustion_blocks_the_plan() {
        let ws = TestWorkspace::new();
        let review = ScriptedReviewProvider::new();
        let resolver = ScriptedResolver::new("scripted");
        let config = DispatcherConfig {
            retry_budget: 1,
            ..DispatcherConfig::default()
        };
        let d = dispatcher(&ws, config, &review, &resolver);

        let mut state = GlobalState::default();
        let plan = ws.active_plan("p1", "scripted", DOC);
        state.plans.insert(plan.id.clone(), plan);
        ws.save(&state);

        resolver.adapter.script_worker(WorkerRef::Session("p1".to_string()));
        write_marker(&ws, "p1", 3);
        d.cycle().expect("cycle");

        let state = ws.load();
        let plan = &state.plans["p1"];
        assert_eq!(plan.status, PlanStatus::Blocked);
        assert!(plan.blocked);
        assert_eq!(plan.current_todo, 0);
        let err = plan.last_error.as_deref().expect("last_error");
        assert!(err.contains("TODO #1"), "{err}");
        assert!(err.contains('3'), "{err}");
    }

    /// A marker file with garbage in it fails the attempt like any nonzero
    /// exit: the worker reference is dropped and the budget applies.
    #[test]
    fn unreadable_worker_result_counts_as_a_failed_attempt() {
        let ws = TestWorkspace::new();
        let review = ScriptedReviewProvider::new();
        let resolver = ScriptedResolver::new("scripted");
        let config = DispatcherConfig {
            retry_budget: 1,
            ..DispatcherConfig::default()
        };
        let d = dispatcher(&ws, config, &review, &resolver);

        let mut state = GlobalState::default();
        let mut plan = ws.active_plan("p1", "scripted", DOC);
        plan.worker = Some(WorkerRef::Session("p1".to_string()));
        state.plans.insert(plan.id.clone(), plan);
        ws.save(&state);

        let dir = ws.paths.sessions_dir.join("p1");
        fs::create_dir_all(&dir).expect("session dir");
        fs::write(dir.join("exit_code"), "oops not a number\n").expect("marker");

        d.cycle().expect("cycle");

        let state = ws.load();
        let plan = &state.plans["p1"];
        assert!(plan.worker.is_none());
        assert_eq!(plan.retry_count, 1);
        assert_eq!(plan.status, PlanStatus::Blocked);
        assert!(plan.blocked);
        let err = plan.last_error.as_deref().expect("last_error");
        assert!(err.contains("worker poll failed"), "{err}");
    }

    /// After a blocked plan is unblocked, the next cycle redispatches the
    /// same TODO from a clean retry count.
    #[test]
    fn unblocked_plan_is_redispatched_on_the_next_cycle() {
        let ws = TestWorkspace::new();
        let review = ScriptedReviewProvider::new();
        let resolver = ScriptedResolver::new("scripted");
        let config = DispatcherConfig {
            retry_budget: 1,
            ..DispatcherConfig::default()
        };
        let d = dispatcher(&ws, config, &review, &resolver);

        let mut state = GlobalState::default();
        let plan = ws.active_plan("p1", "scripted", DOC);
        state.plans.insert(plan.id.clone(), plan);
        ws.save(&state);

        resolver.adapter.script_worker(WorkerRef::Session("p1".to_string()));
        write_marker(&ws, "p1", 3);
        d.cycle().expect("failing cycle");
        assert_eq!(ws.load().plans["p1"].status, PlanStatus::Blocked);

        crate::commands::unblock(&ws.paths, "p1").expect("unblock");

        resolver.adapter.script_worker(running_worker());
        let outcome = d.cycle().expect("cycle after unblock");
        assert_eq!(outcome.launched, 1);

        let state = ws.load();
        let plan = &state.plans["p1"];
        assert_eq!(plan.status, PlanStatus::Active);
        assert_eq!(plan.current_todo, 0);
        assert_eq!(plan.retry_count, 0);
        assert_eq!(plan.worker, Some(running_worker()));

        let launches = resolver.adapter.launches();
        assert_eq!(launches.len(), 2);
        assert!(launches[1].prompt.contains("TODO #1"));
        assert!(launches[1].prompt.contains("First task"));
    }

    #[test]
    fn launch_failure_counts_against_retry_budget() {
        let ws = TestWorkspace::new();
        let review = ScriptedReviewProvider::new();
        let resolver = ScriptedResolver::new("scripted");
        let config = DispatcherConfig {
            retry_budget: 2,
            ..DispatcherConfig::default()
        };
        let d = dispatcher(&ws, config, &review, &resolver);

        let mut state = GlobalState::default();
        let plan = ws.active_plan("p1", "scripted", DOC);
        state.plans.insert(plan.id.clone(), plan);
        ws.save(&state);

        resolver.adapter.script_failure("tmux refused");
        d.cycle().expect("cycle");

        let state = ws.load();
        let plan = &state.plans["p1"];
        assert_eq!(plan.retry_count, 1);
        assert_eq!(plan.status, PlanStatus::Active);
        assert!(plan.last_error.as_deref().expect("last_error").contains("tmux refused"));

        resolver.adapter.script_failure("tmux refused again");
        d.cycle().expect("cycle");

        let state = ws.load();
        let plan = &state.plans["p1"];
        assert_eq!(plan.retry_count, 2);
        assert_eq!(plan.status, PlanStatus::Blocked);
        assert!(plan.blocked);
    }

    #[test]
    fn unknown_agent_blocks_without_retries() {
        let ws = TestWorkspace::new();
        let review = ScriptedReviewProvider::new();
        let resolver = ScriptedResolver::new("scripted");
        let d = dispatcher(&ws, DispatcherConfig::default(), &review, &resolver);

        let mut state = GlobalState::default();
        let plan = ws.active_plan("p1", "mystery", DOC);
        state.plans.insert(plan.id.clone(), plan);
        ws.save(&state);

        d.cycle().expect("cycle");

        let state = ws.load();
        let plan = &state.plans["p1"];
        assert_eq!(plan.status, PlanStatus::Blocked);
        assert_eq!(plan.retry_count, 0);
        let err = plan.last_error.as_deref().expect("last_error");
        assert!(err.contains("mystery"), "{err}");
        assert!(resolver.adapter.launches().is_empty());
    }

    #[test]
    fn queued_stop_pauses_and_prevents_relaunch() {
        let ws = TestWorkspace::new();
        let review = ScriptedReviewProvider::new();
        let resolver = ScriptedResolver::new("scripted");
        let d = dispatcher(&ws, DispatcherConfig::default(), &review, &resolver);

        let mut state = GlobalState::default();
        let plan = ws.active_plan("p1", "scripted", DOC);
        state.plans.insert(plan.id.clone(), plan);
        ws.save(&state);

        let queue = CommandQueue::new(&ws.paths.queue_path);
        queue
            .enqueue(&QueuedCommand::new(CommandKind::Stop, "p1"))
            .expect("enqueue");

        let outcome = d.cycle().expect("cycle");
        assert_eq!(outcome.commands_applied, 1);
        assert_eq!(outcome.launched, 0);

        let state = ws.load();
        assert_eq!(state.plans["p1"].status, PlanStatus::Paused);
        assert_eq!(state.control_cursor, 1);
        assert!(resolver.adapter.launches().is_empty());

        // Cursor consumption is at-most-once: nothing re-applies.
        let outcome = d.cycle().expect("second cycle");
        assert_eq!(outcome.commands_applied, 0);
        assert_eq!(ws.load().control_cursor, 1);
    }

    #[test]
    fn review_command_outside_review_is_skipped_with_warning() {
        let ws = TestWorkspace::new();
        let review = ScriptedReviewProvider::new();
        let resolver = ScriptedResolver::new("scripted");
        let d = dispatcher(&ws, DispatcherConfig::default(), &review, &resolver);

        let mut state = GlobalState::default();
        let mut plan = ws.active_plan("p1", "scripted", DOC);
        plan.status = PlanStatus::Queued;
        // Keep the plan out of promotion so the cycle ends with the drain's
        // rejection still recorded.
        plan.blocked = true;
        state.plans.insert(plan.id.clone(), plan);
        ws.save(&state);

        let queue = CommandQueue::new(&ws.paths.queue_path);
        queue
            .enqueue(&QueuedCommand::new(CommandKind::Review, "p1"))
            .expect("enqueue");

        d.cycle().expect("cycle");

        let state = ws.load();
        // Cursor advanced, but the plan was not moved into reviewing.
        assert_eq!(state.control_cursor, 1);
        assert_ne!(state.plans["p1"].status, PlanStatus::Reviewing);
        assert!(
            state.plans["p1"]
                .last_error
                .as_deref()
                .expect("last_error")
                .contains("queued")
        );
    }

    #[test]
    fn capacity_limits_how_many_plans_go_active() {
        let ws = TestWorkspace::new();
        let review = ScriptedReviewProvider::new();
        let resolver = ScriptedResolver::new("scripted");
        let config = DispatcherConfig {
            max_active: 1,
            ..DispatcherConfig::default()
        };
        let d = dispatcher(&ws, config, &review, &resolver);

        let mut state = GlobalState::default();
        for id in ["p1", "p2"] {
            let mut plan = ws.active_plan(id, "scripted", DOC);
            plan.status = PlanStatus::Queued;
            state.plans.insert(plan.id.clone(), plan);
        }
        ws.save(&state);

        resolver.adapter.script_worker(running_worker());
        let outcome = d.cycle().expect("cycle");
        assert_eq!(outcome.promoted, 1);
        assert_eq!(outcome.launched, 1);

        let state = ws.load();
        assert_eq!(state.plans["p1"].status, PlanStatus::Active);
        assert_eq!(state.plans["p2"].status, PlanStatus::Queued);
    }

    /// review → reviewing → triaging → active, with the newest item carried
    /// as the change request and dispatched in the next cycle's prompt.
    #[test]
    fn review_feedback_flows_into_next_dispatch() {
        let ws = TestWorkspace::new();
        let review = ScriptedReviewProvider::new();
        let resolver = ScriptedResolver::new("scripted");
        let d = dispatcher(&ws, DispatcherConfig::default(), &review, &resolver);

        let mut state = GlobalState::default();
        let mut plan = ws.active_plan("p1", "scripted", DOC_DONE);
        plan.status = PlanStatus::Review;
        plan.current_todo = 2;
        state.plans.insert(plan.id.clone(), plan);
        ws.save(&state);

        let queue = CommandQueue::new(&ws.paths.queue_path);
        queue
            .enqueue(&QueuedCommand::new(CommandKind::Review, "p1"))
            .expect("enqueue");
        review.script_items(vec![
            review_item("c-1", "First pass comment"),
            review_item("c-2", "Rework the parser"),
        ]);

        d.cycle().expect("first cycle");
        let state = ws.load();
        let plan = &state.plans["p1"];
        assert_eq!(plan.status, PlanStatus::Active);
        assert_eq!(plan.change_request.as_deref(), Some("Rework the parser"));
        assert_eq!(plan.review_cursor.as_deref(), Some("c-2"));

        resolver.adapter.script_worker(WorkerRef::Session("p1".to_string()));
        write_marker(&ws, "p1", 0);
        d.cycle().expect("second cycle");

        let launches = resolver.adapter.launches();
        assert_eq!(launches.len(), 1);
        assert!(launches[0].prompt.contains("Review feedback"));
        assert!(launches[0].prompt.contains("Rework the parser"));

        // The feedback run completed cleanly: acknowledged on the channel and
        // parked back in review for another round.
        let state = ws.load();
        let plan = &state.plans["p1"];
        assert_eq!(plan.status, PlanStatus::Review);
        assert!(plan.change_request.is_none());
        let responses = review.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].1.as_deref(), Some("c-2"));
    }

    #[test]
    fn review_poll_errors_retry_then_block_at_budget() {
        let ws = TestWorkspace::new();
        let review = ScriptedReviewProvider::new();
        let resolver = ScriptedResolver::new("scripted");
        let config = DispatcherConfig {
            retry_budget: 2,
            ..DispatcherConfig::default()
        };
        let d = dispatcher(&ws, config, &review, &resolver);

        let mut state = GlobalState::default();
        let mut plan = ws.active_plan("p1", "scripted", DOC_DONE);
        plan.status = PlanStatus::Reviewing;
        state.plans.insert(plan.id.clone(), plan);
        ws.save(&state);

        review.script_error("gh unreachable");
        d.cycle().expect("cycle");

        let state = ws.load();
        let plan = &state.plans["p1"];
        assert_eq!(plan.status, PlanStatus::Reviewing);
        assert!(
            plan.last_error
                .as_deref()
                .expect("last_error")
                .contains("gh unreachable")
        );

        review.script_error("gh still unreachable");
        d.cycle().expect("second cycle");

        let state = ws.load();
        let plan = &state.plans["p1"];
        assert_eq!(plan.status, PlanStatus::Blocked);
        assert!(plan.blocked);
    }

    #[test]
    fn all_done_plan_without_feedback_moves_to_review() {
        let ws = TestWorkspace::new();
        let review = ScriptedReviewProvider::new();
        let resolver = ScriptedResolver::new("scripted");
        let d = dispatcher(&ws, DispatcherConfig::default(), &review, &resolver);

        let mut state = GlobalState::default();
        let plan = ws.active_plan("p1", "scripted", DOC_DONE);
        state.plans.insert(plan.id.clone(), plan);
        ws.save(&state);

        d.cycle().expect("cycle");

        let state = ws.load();
        assert_eq!(state.plans["p1"].status, PlanStatus::Review);
        assert!(resolver.adapter.launches().is_empty());
    }
}
