//! Named detached tmux sessions hosting agent invocations.
//!
//! A session gives a long-running headless invocation an externally
//! attachable execution context that survives Dispatcher restarts. The wrapped
//! command tees combined output to `agent.log` and appends its exit code to
//! the `exit_code` marker file; completion detection is entirely file-based so
//! the Dispatcher's non-blocking poll and the synchronous waiter always agree.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

/// Per-session file layout under a directory named after the session id.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub dir: PathBuf,
    pub log_path: PathBuf,
    pub marker_path: PathBuf,
    pub prompt_path: PathBuf,
}

impl SessionPaths {
    pub fn new(sessions_dir: &Path, session_id: &str) -> Self {
        let dir = sessions_dir.join(session_id);
        Self {
            log_path: dir.join("agent.log"),
            marker_path: dir.join("exit_code"),
            prompt_path: dir.join("prompt.md"),
            dir,
        }
    }
}

/// Non-blocking session poll result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPoll {
    Running,
    Completed { exit_code: i32 },
}

/// Session creation failed (multiplexer unavailable, name collision). Counts
/// as a failed attempt against the plan's retry budget, never a crash.
#[derive(Debug, Clone)]
pub struct SessionCreateError {
    pub session_id: String,
    pub message: String,
}

impl fmt::Display for SessionCreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to create session '{}': {}",
            self.session_id, self.message
        )
    }
}

impl std::error::Error for SessionCreateError {}

/// tmux-backed session runner.
#[derive(Debug, Clone)]
pub struct SessionRunner {
    sessions_dir: PathBuf,
    poll_interval: Duration,
    missing_marker_exit_code: i32,
}

impl SessionRunner {
    pub fn new(
        sessions_dir: impl Into<PathBuf>,
        poll_interval: Duration,
        missing_marker_exit_code: i32,
    ) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
            poll_interval,
            missing_marker_exit_code,
        }
    }

    pub fn paths(&self, session_id: &str) -> SessionPaths {
        SessionPaths::new(&self.sessions_dir, session_id)
    }

    /// Clear stale log/marker files from any prior run under the same id and
    /// persist the prompt. Idempotent, so retries never read a previous run's
    /// result.
    pub fn prepare_log_files(&self, session_id: &str, prompt: &str) -> Result<SessionPaths> {
        let paths = self.paths(session_id);
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create session dir {}", paths.dir.display()))?;
        for stale in [&paths.log_path, &paths.marker_path] {
            match fs::remove_file(stale) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("remove stale {}", stale.display()));
                }
            }
        }
        fs::write(&paths.prompt_path, prompt)
            .with_context(|| format!("write prompt {}", paths.prompt_path.display()))?;
        debug!(session_id, "session files prepared");
        Ok(paths)
    }

    /// Shell pipeline wrapping `agent_command`: combined output tees to the
    /// log, and the agent's own exit code (not tee's) lands in the marker.
    pub fn wrapped_command(&self, session_id: &str, agent_command: &str) -> String {
        let paths = self.paths(session_id);
        format!(
            "set -o pipefail; {} 2>&1 | tee -a {}; echo $? >> {}",
            agent_command,
            shell_quote(&paths.log_path.display().to_string()),
            shell_quote(&paths.marker_path.display().to_string()),
        )
    }

    /// Start a named detached session running the wrapped command.
    pub fn launch(&self, session_id: &str, agent_command: &str, workdir: &Path) -> Result<()> {
        let wrapped = self.wrapped_command(session_id, agent_command);
        let output = Command::new("tmux")
            .arg("new-session")
            .arg("-d")
            .arg("-s")
            .arg(session_id)
            .arg("-c")
            .arg(workdir)
            .arg("bash")
            .arg("-c")
            .arg(&wrapped)
            .output();
        let output = match output {
            Ok(output) => output,
            Err(err) => {
                return Err(SessionCreateError {
                    session_id: session_id.to_string(),
                    message: format!("failed to run tmux: {err}"),
                }
                .into());
            }
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SessionCreateError {
                session_id: session_id.to_string(),
                message: stderr.trim().to_string(),
            }
            .into());
        }
        debug!(session_id, workdir = %workdir.display(), "session launched");
        Ok(())
    }

    /// Whether tmux knows a session under this id. An unreachable tmux server
    /// reads as "no session".
    pub fn has_session(&self, session_id: &str) -> bool {
        let status = Command::new("tmux")
            .arg("has-session")
            .arg("-t")
            .arg(session_id)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(status) => status.success(),
            Err(err) => {
                warn!(session_id, err = %err, "tmux unavailable, treating session as gone");
                false
            }
        }
    }

    /// Non-blocking completion check: the marker wins; a live session without
    /// a marker is still running; a dead session without a marker completes
    /// with the configured missing-marker exit code (the session may have
    /// been killed externally, which is not an agent failure).
    pub fn poll(&self, session_id: &str) -> Result<SessionPoll> {
        let paths = self.paths(session_id);
        if paths.marker_path.exists() {
            let exit_code = self.read_execution_result(session_id)?;
            return Ok(SessionPoll::Completed { exit_code });
        }
        if self.has_session(session_id) {
            return Ok(SessionPoll::Running);
        }
        debug!(
            session_id,
            assumed_exit_code = self.missing_marker_exit_code,
            "session gone without marker"
        );
        Ok(SessionPoll::Completed {
            exit_code: self.missing_marker_exit_code,
        })
    }

    /// Blocking poll for the marker at a fixed interval. Used by synchronous
    /// callers; reads the same marker as [`poll`], so results agree.
    ///
    /// [`poll`]: SessionRunner::poll
    pub fn wait_for_completion(&self, session_id: &str) -> Result<i32> {
        loop {
            match self.poll(session_id)? {
                SessionPoll::Completed { exit_code } => return Ok(exit_code),
                SessionPoll::Running => thread::sleep(self.poll_interval),
            }
        }
    }

    /// Parse the marker's integer exit code; absent means the configured
    /// missing-marker code (default 0, "unknown success").
    pub fn read_execution_result(&self, session_id: &str) -> Result<i32> {
        let paths = self.paths(session_id);
        let contents = match fs::read_to_string(&paths.marker_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(self.missing_marker_exit_code);
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read marker {}", paths.marker_path.display()));
            }
        };
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return Ok(self.missing_marker_exit_code);
        }
        // prepare_log_files clears the marker per run, but take the last line
        // in case a stray re-run appended.
        let last = trimmed.lines().last().unwrap_or(trimmed).trim();
        last.parse::<i32>()
            .with_context(|| format!("parse exit code '{last}' in {}", paths.marker_path.display()))
    }

    /// Foreground-attach the operator's terminal without granting input, so
    /// detaching never disturbs the running session.
    pub fn attach_read_only(&self, session_id: &str) -> Result<()> {
        let status = run_inherited(
            Command::new("tmux")
                .arg("attach-session")
                .arg("-r")
                .arg("-t")
                .arg(session_id),
        )
        .with_context(|| format!("attach session '{session_id}'"))?;
        if !status.success() {
            return Err(anyhow!("tmux attach-session '{session_id}' failed"));
        }
        Ok(())
    }

    /// Forcibly kill a session. A narrower operation than advisory `stop`,
    /// which never touches a running session.
    pub fn kill_session(&self, session_id: &str) -> Result<()> {
        let output = run_output(
            Command::new("tmux")
                .arg("kill-session")
                .arg("-t")
                .arg(session_id),
        )?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Killing an already-dead session is not an error.
            if stderr.contains("can't find session") || stderr.contains("no server running") {
                return Ok(());
            }
            return Err(anyhow!(
                "tmux kill-session '{session_id}' failed: {}",
                stderr.trim()
            ));
        }
        Ok(())
    }
}

fn run_output(cmd: &mut Command) -> Result<Output> {
    cmd.output().context("spawn tmux")
}

fn run_inherited(cmd: &mut Command) -> Result<std::process::ExitStatus> {
    cmd.status().context("spawn tmux")
}

/// Single-quote a string for `sh`, escaping embedded quotes.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
