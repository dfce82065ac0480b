//! Append-only operator command queue (`.dispatcher/queue.jsonl`).
//!
//! One JSON entry per line. The Dispatcher consumes entries strictly after the
//! cursor persisted in the state snapshot; entries at or before the cursor are
//! never reprocessed.

use std::fs;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::command::QueuedCommand;

/// Handle to the on-disk queue file.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    path: PathBuf,
}

impl CommandQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one command and return immediately.
    pub fn enqueue(&self, cmd: &QueuedCommand) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create queue dir {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(cmd).context("serialize queued command")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open queue {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append queue {}", self.path.display()))?;
        debug!(kind = cmd.kind.as_str(), plan_id = %cmd.plan_id, "command enqueued");
        Ok(())
    }

    /// Read all entries strictly after `cursor`, in enqueue order.
    ///
    /// `cursor` counts entries already processed, so a cursor of N skips the
    /// first N lines. A missing file is an empty queue.
    pub fn read_after(&self, cursor: u64) -> Result<Vec<QueuedCommand>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read queue {}", self.path.display()));
            }
        };
        let mut entries = Vec::new();
        // The cursor counts entries, not file lines, so a blank line slipped
        // in by a hand edit never replays an already-processed entry.
        let mut seen = 0u64;
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            seen += 1;
            if seen <= cursor {
                continue;
            }
            let cmd: QueuedCommand = serde_json::from_str(line)
                .with_context(|| format!("parse queue entry {} (line {})", line, line_no + 1))?;
            entries.push(cmd);
        }
        Ok(entries)
    }

    /// Total number of entries ever enqueued.
    pub fn len(&self) -> Result<u64> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(err).with_context(|| format!("read queue {}", self.path.display()));
            }
        };
        Ok(contents.lines().filter(|l| !l.trim().is_empty()).count() as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
