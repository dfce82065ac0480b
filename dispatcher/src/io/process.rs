//! Detached child processes for headless agent runs.
//!
//! Headless workers are spawned into their own process group with stdio
//! detached, so they survive a Dispatcher restart. Liveness is a signal-0
//! probe; exit codes are captured opportunistically via a non-blocking
//! `waitpid` when the worker is still our child, and fall back to the probe
//! when it is not (e.g. after the Dispatcher restarted).

use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

use crate::io::lock::pid_alive;

/// Handle to a detached worker process, reconstructible from a bare pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
}

/// Non-blocking poll result for a detached process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessPoll {
    Running,
    Exited { exit_code: i32 },
    /// Gone, but the exit code was not observable (not our child and no
    /// longer alive). The caller applies its missing-result policy.
    Gone,
}

impl ProcessHandle {
    /// Spawn `cmd` detached: own process group, stdio redirected to files or
    /// null, returning immediately with only the pid.
    pub fn spawn_detached(mut cmd: Command, log_path: Option<&Path>) -> Result<ProcessHandle> {
        match log_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("create log dir {}", parent.display()))?;
                }
                let log = std::fs::File::create(path)
                    .with_context(|| format!("create log {}", path.display()))?;
                let err = log
                    .try_clone()
                    .with_context(|| format!("clone log handle {}", path.display()))?;
                cmd.stdout(Stdio::from(log)).stderr(Stdio::from(err));
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        cmd.stdin(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let child = cmd.spawn().context("spawn detached process")?;
        let pid = child.id();
        debug!(pid, "spawned detached process");
        // The Child is dropped without waiting; poll() reaps it later.
        Ok(ProcessHandle { pid })
    }

    /// Liveness by signal probe.
    pub fn is_alive(&self) -> bool {
        pid_alive(self.pid)
    }

    /// Non-blocking completion check.
    #[cfg(unix)]
    pub fn poll(&self) -> Result<ProcessPoll> {
        use nix::errno::Errno;
        use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
        use nix::unistd::Pid;

        let pid = Pid::from_raw(self.pid as i32);
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(ProcessPoll::Running),
            Ok(WaitStatus::Exited(_, code)) => Ok(ProcessPoll::Exited { exit_code: code }),
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                warn!(pid = self.pid, signal = %signal, "worker killed by signal");
                Ok(ProcessPoll::Exited {
                    exit_code: 128 + signal as i32,
                })
            }
            Ok(_) => Ok(ProcessPoll::Running),
            // Not our child (the Dispatcher restarted); only the probe is left.
            Err(Errno::ECHILD) => {
                if self.is_alive() {
                    Ok(ProcessPoll::Running)
                } else {
                    Ok(ProcessPoll::Gone)
                }
            }
            Err(err) => Err(anyhow!("waitpid {} failed: {err}", self.pid)),
        }
    }

    #[cfg(not(unix))]
    pub fn poll(&self) -> Result<ProcessPoll> {
        if self.is_alive() {
            Ok(ProcessPoll::Running)
        } else {
            Ok(ProcessPoll::Gone)
        }
    }

    /// Ask the worker to terminate (SIGTERM). Not an error if already gone.
    #[cfg(unix)]
    pub fn terminate(&self) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(anyhow!("terminate {} failed: {err}", self.pid)),
        }
    }

    #[cfg(not(unix))]
    pub fn terminate(&self) -> Result<()> {
        Ok(())
    }

    /// Block until the process exits or `timeout` elapses, polling at
    /// `interval`. Returns the poll outcome at the moment of exit.
    pub fn wait_for_exit(&self, interval: Duration, timeout: Duration) -> Result<ProcessPoll> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.poll()? {
                ProcessPoll::Running => {}
                done => return Ok(done),
            }
            if Instant::now() >= deadline {
                return Err(anyhow!("timed out waiting for pid {}", self.pid));
            }
            thread::sleep(interval);
        }
    }
}
