//! PID-verified exclusive lock (`.dispatcher/lock.json`).
//!
//! The lock is the sole cross-process concurrency gate: only its holder may
//! persist state mutations, which makes the Dispatcher single-writer even when
//! several CLI invocations race to start it. A lock whose recorded PID is no
//! longer alive is stale and gets reclaimed.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// On-disk lock record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockFile {
    pub pid: u32,
    pub acquired_at: Timestamp,
}

/// Another live Dispatcher holds the lock. Fatal for this invocation only;
/// the holder is left undisturbed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHeldError {
    pub pid: u32,
}

impl fmt::Display for LockHeldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "another dispatcher is already running (pid {})", self.pid)
    }
}

impl std::error::Error for LockHeldError {}

/// Acquire the lock for the current process.
///
/// Fails with [`LockHeldError`] when the existing lock's PID is alive;
/// reclaims (overwrites) a stale lock otherwise.
pub fn acquire_lock(path: &Path) -> Result<()> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let existing: LockFile = serde_json::from_str(&contents)
                .with_context(|| format!("parse lock {}", path.display()))?;
            if pid_alive(existing.pid) {
                return Err(LockHeldError { pid: existing.pid }.into());
            }
            warn!(stale_pid = existing.pid, "reclaiming stale lock");
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("read lock {}", path.display()));
        }
    }

    let lock = LockFile {
        pid: std::process::id(),
        acquired_at: Timestamp::now(),
    };
    let mut buf = serde_json::to_string_pretty(&lock)?;
    buf.push('\n');
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create lock dir {}", parent.display()))?;
    }
    fs::write(path, buf).with_context(|| format!("write lock {}", path.display()))?;
    debug!(pid = lock.pid, "lock acquired");
    Ok(())
}

/// Remove the lock file. Safe to call unconditionally.
pub fn release_lock(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("lock released");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove lock {}", path.display())),
    }
}

/// Signal-0 probe: does the PID refer to a live process?
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release_leaves_no_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("lock.json");

        acquire_lock(&path).expect("acquire");
        assert!(path.exists());
        release_lock(&path).expect("release");
        assert!(!path.exists());

        // Unconditional release on a missing file is fine.
        release_lock(&path).expect("release again");
    }

    #[test]
    fn second_acquire_fails_while_holder_alive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("lock.json");

        // Our own PID is alive, so a second acquire must see AlreadyRunning.
        acquire_lock(&path).expect("acquire");
        let err = acquire_lock(&path).unwrap_err();
        let held = err.downcast_ref::<LockHeldError>().expect("LockHeldError");
        assert_eq!(held.pid, std::process::id());
    }

    #[test]
    fn dead_holder_is_reclaimed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("lock.json");

        // PIDs near the u32 ceiling exceed any real pid_max.
        let stale = LockFile {
            pid: u32::MAX - 1,
            acquired_at: Timestamp::now(),
        };
        fs::write(&path, serde_json::to_string(&stale).expect("serialize")).expect("write");

        acquire_lock(&path).expect("reclaim");
        let contents = fs::read_to_string(&path).expect("read");
        let lock: LockFile = serde_json::from_str(&contents).expect("parse");
        assert_eq!(lock.pid, std::process::id());
    }
}
