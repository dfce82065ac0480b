//! Scripted collaborators for exercising the control loop without tmux,
//! agent CLIs, or a review backend.
//!
//! Available to integration tests through the `test-support` feature.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::agents::{AgentAdapter, ExecRequest, InteractiveRequest, UnknownAgentError};
use crate::core::plan::{Plan, WorkerRef};
use crate::core::status::PlanStatus;
use crate::dispatch::AgentResolver;
use crate::io::init::{DispatcherPaths, InitOptions, init_dispatcher};
use crate::io::review::{ReviewContext, ReviewItem, ReviewPollState, ReviewProvider};
use crate::io::session::SessionRunner;
use crate::io::state::{GlobalState, load_state, save_state};

/// Adapter whose launches come from a script instead of spawning anything.
pub struct ScriptedAdapter {
    name: &'static str,
    results: Mutex<VecDeque<Result<WorkerRef, String>>>,
    launches: Mutex<Vec<ExecRequest>>,
}

impl ScriptedAdapter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            results: Mutex::new(VecDeque::new()),
            launches: Mutex::new(Vec::new()),
        }
    }

    /// Next launch returns this worker reference.
    pub fn script_worker(&self, worker: WorkerRef) {
        self.results
            .lock()
            .expect("results lock")
            .push_back(Ok(worker));
    }

    /// Next launch fails with this message.
    pub fn script_failure(&self, message: &str) {
        self.results
            .lock()
            .expect("results lock")
            .push_back(Err(message.to_string()));
    }

    /// Every request `launch` has seen, in order.
    pub fn launches(&self) -> Vec<ExecRequest> {
        self.launches.lock().expect("launches lock").clone()
    }
}

impl AgentAdapter for ScriptedAdapter {
    fn name(&self) -> &'static str {
        self.name
    }

    fn headless_argv(&self, _request: &ExecRequest) -> Vec<String> {
        vec!["true".to_string()]
    }

    fn session_argv(&self, _request: &ExecRequest) -> Vec<String> {
        vec!["true".to_string()]
    }

    fn interactive_argv(&self, _request: &InteractiveRequest) -> Vec<String> {
        vec!["true".to_string()]
    }

    fn launch(&self, _sessions: &SessionRunner, request: &ExecRequest) -> Result<WorkerRef> {
        self.launches
            .lock()
            .expect("launches lock")
            .push(request.clone());
        match self.results.lock().expect("results lock").pop_front() {
            Some(Ok(worker)) => Ok(worker),
            Some(Err(message)) => Err(anyhow!("{message}")),
            // Unscripted launches succeed with a session named after the plan.
            None => Ok(WorkerRef::Session(
                request
                    .session
                    .clone()
                    .unwrap_or_else(|| "scripted".to_string()),
            )),
        }
    }
}

/// Resolver knowing exactly one scripted adapter.
pub struct ScriptedResolver {
    pub adapter: ScriptedAdapter,
}

impl ScriptedResolver {
    pub fn new(name: &'static str) -> Self {
        Self {
            adapter: ScriptedAdapter::new(name),
        }
    }
}

impl AgentResolver for ScriptedResolver {
    fn resolve(&self, name: &str) -> Result<&dyn AgentAdapter, UnknownAgentError> {
        if name == self.adapter.name() {
            Ok(&self.adapter)
        } else {
            Err(UnknownAgentError {
                name: name.to_string(),
            })
        }
    }
}

/// Review provider answering polls from a script.
#[derive(Default)]
pub struct ScriptedReviewProvider {
    polls: Mutex<VecDeque<Result<Vec<ReviewItem>, String>>>,
    responses: Mutex<Vec<(String, Option<String>)>>,
}

impl ScriptedReviewProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next poll returns these items.
    pub fn script_items(&self, items: Vec<ReviewItem>) {
        self.polls.lock().expect("polls lock").push_back(Ok(items));
    }

    /// Next poll fails with this message.
    pub fn script_error(&self, message: &str) {
        self.polls
            .lock()
            .expect("polls lock")
            .push_back(Err(message.to_string()));
    }

    /// Every `(message, related_item_id)` posted through `respond`.
    pub fn responses(&self) -> Vec<(String, Option<String>)> {
        self.responses.lock().expect("responses lock").clone()
    }
}

impl ReviewProvider for ScriptedReviewProvider {
    fn poll(
        &self,
        _ctx: &ReviewContext,
        prior: &ReviewPollState,
    ) -> Result<(Vec<ReviewItem>, ReviewPollState)> {
        match self.polls.lock().expect("polls lock").pop_front() {
            Some(Ok(items)) => {
                let last_seen = items
                    .last()
                    .map(|item| item.id.clone())
                    .or_else(|| prior.last_seen.clone());
                Ok((items, ReviewPollState { last_seen }))
            }
            Some(Err(message)) => Err(anyhow!("{message}")),
            None => Ok((Vec::new(), prior.clone())),
        }
    }

    fn respond(
        &self,
        _ctx: &ReviewContext,
        message: &str,
        related_item_id: Option<&str>,
    ) -> Result<()> {
        self.responses
            .lock()
            .expect("responses lock")
            .push((message.to_string(), related_item_id.map(str::to_string)));
        Ok(())
    }
}

pub fn review_item(id: &str, body: &str) -> ReviewItem {
    ReviewItem {
        id: id.to_string(),
        author: "reviewer".to_string(),
        body: body.to_string(),
    }
}

/// Temporary repository root with `.dispatcher/` scaffolding.
pub struct TestWorkspace {
    dir: TempDir,
    pub paths: DispatcherPaths,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let paths =
            init_dispatcher(dir.path(), &InitOptions { force: false }).expect("init dispatcher");
        Self { dir, paths }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write a plan document into a fresh worktree directory and return an
    /// active plan pointing at it, wired to the given agent.
    pub fn active_plan(&self, id: &str, agent: &str, doc: &str) -> Plan {
        let worktree = self.paths.worktrees_dir.join(id);
        fs::create_dir_all(&worktree).expect("create worktree dir");
        fs::write(worktree.join("PLAN.md"), doc).expect("write plan doc");
        let mut plan = Plan::new(id, &worktree, format!("work/{id}"), "main", "PLAN.md", agent);
        plan.status = PlanStatus::Active;
        plan
    }

    pub fn save(&self, state: &GlobalState) {
        save_state(&self.paths.state_path, state).expect("save state");
    }

    pub fn load(&self) -> GlobalState {
        load_state(&self.paths.state_path).expect("load state")
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}
