//! Agent adapters: one fixed interface over several external agent CLIs.
//!
//! Each integration only describes how to build its invocations; the shared
//! execution machinery (session wrapping, detached spawn, interactive
//! passthrough) lives in the trait's default methods. The Dispatcher depends
//! on [`AgentAdapter`] and the registry, never on a concrete integration, so
//! adding one never touches the control loop.

mod claude;
mod codex;
mod gemini;

use std::fmt;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tracing::info;

pub use claude::ClaudeAdapter;
pub use codex::CodexAdapter;
pub use gemini::GeminiAdapter;

use crate::core::plan::WorkerRef;
use crate::io::process::ProcessHandle;
use crate::io::session::{SessionRunner, shell_quote};

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Working directory for the agent (the plan's worktree).
    pub workdir: PathBuf,
    pub prompt: String,
    /// Session id for a session-backed run; `None` spawns headless.
    pub session: Option<String>,
    pub model: Option<String>,
}

/// Parameters for an interactive passthrough.
#[derive(Debug, Clone)]
pub struct InteractiveRequest {
    pub workdir: PathBuf,
    /// Initial prompt. Integrations that cannot take one on this path omit
    /// it rather than fail.
    pub prompt: Option<String>,
    pub model: Option<String>,
}

/// What an invocation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// Session-backed run: exit code observed through the session marker.
    Completed { exit_code: i32 },
    /// Headless run: only a process id; the caller polls it later.
    Detached { pid: u32 },
}

/// One external agent CLI integration.
///
/// Implementations provide invocation shapes; execution flows through the
/// default methods so every integration behaves identically under the
/// session protocol.
pub trait AgentAdapter: Sync {
    fn name(&self) -> &'static str;

    /// argv for a headless run with the prompt passed inline.
    fn headless_argv(&self, request: &ExecRequest) -> Vec<String>;

    /// argv for a session-backed run reading the prompt from stdin. The
    /// prompt goes through a file to avoid argument-length limits and
    /// escaping hazards.
    fn session_argv(&self, request: &ExecRequest) -> Vec<String>;

    /// argv for attaching the operator's terminal directly.
    fn interactive_argv(&self, request: &InteractiveRequest) -> Vec<String>;

    /// Start the agent without waiting, returning the live worker reference.
    fn launch(&self, sessions: &SessionRunner, request: &ExecRequest) -> Result<WorkerRef> {
        match &request.session {
            Some(session_id) => {
                let paths = sessions.prepare_log_files(session_id, &request.prompt)?;
                let argv = self.session_argv(request);
                let command = format!(
                    "{} < {}",
                    join_argv(&argv),
                    shell_quote(&paths.prompt_path.display().to_string())
                );
                sessions.launch(session_id, &command, &request.workdir)?;
                info!(agent = self.name(), session_id, "agent session launched");
                Ok(WorkerRef::Session(session_id.clone()))
            }
            None => {
                let argv = self.headless_argv(request);
                let handle = ProcessHandle::spawn_detached(build_command(&argv, request), None)?;
                info!(agent = self.name(), pid = handle.pid, "agent spawned headless");
                Ok(WorkerRef::Process(handle.pid))
            }
        }
    }

    /// Run the agent. Session-backed runs block on the marker and return the
    /// exit code; headless runs return immediately with only a pid.
    fn execute(&self, sessions: &SessionRunner, request: &ExecRequest) -> Result<ExecutionResult> {
        match self.launch(sessions, request)? {
            WorkerRef::Session(session_id) => {
                let exit_code = sessions.wait_for_completion(&session_id)?;
                Ok(ExecutionResult::Completed { exit_code })
            }
            WorkerRef::Process(pid) => Ok(ExecutionResult::Detached { pid }),
        }
    }

    /// Attach the operator's terminal directly, blocking until the agent
    /// exits. Used for manual resumption of a stuck agent.
    fn interactive(&self, request: &InteractiveRequest) -> Result<()> {
        let argv = self.interactive_argv(request);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("empty interactive argv for agent '{}'", self.name()))?;
        let status = Command::new(program)
            .args(args)
            .current_dir(&request.workdir)
            .status()
            .with_context(|| format!("spawn {program}"))?;
        info!(agent = self.name(), code = ?status.code(), "interactive agent exited");
        Ok(())
    }
}

fn build_command(argv: &[String], request: &ExecRequest) -> Command {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]).current_dir(&request.workdir);
    cmd
}

fn join_argv(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Requested agent is not registered. Fatal for that plan's dispatch; the
/// plan transitions to blocked with `last_error` set.
#[derive(Debug, Clone)]
pub struct UnknownAgentError {
    pub name: String,
}

impl fmt::Display for UnknownAgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown agent '{}' (known agents: {})",
            self.name,
            agent_names().join(", ")
        )
    }
}

impl std::error::Error for UnknownAgentError {}

static ADAPTERS: [&dyn AgentAdapter; 3] = [&ClaudeAdapter, &CodexAdapter, &GeminiAdapter];

/// Look up an adapter by name.
pub fn adapter_for(name: &str) -> Result<&'static dyn AgentAdapter, UnknownAgentError> {
    ADAPTERS
        .iter()
        .find(|adapter| adapter.name() == name)
        .copied()
        .ok_or_else(|| UnknownAgentError {
            name: name.to_string(),
        })
}

/// Names of every registered integration.
pub fn agent_names() -> Vec<&'static str> {
    ADAPTERS.iter().map(|adapter| adapter.name()).collect()
}
