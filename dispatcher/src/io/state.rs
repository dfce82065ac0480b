//! Durable dispatcher state (`.dispatcher/state.json`).
//!
//! The on-disk form is always a complete, valid snapshot: every save writes a
//! temp file and renames it into place, so no reader ever observes a partial
//! write. The command-queue cursor lives in the same snapshot as the plans,
//! which is what makes queued-command handling at-most-once across restarts.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::plan::Plan;

/// The single global record: queue cursor plus every tracked plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalState {
    /// Number of queue entries already processed. Never rewinds.
    #[serde(default)]
    pub control_cursor: u64,
    #[serde(default)]
    pub plans: BTreeMap<String, Plan>,
    /// Opaque operator inbox, preserved losslessly for other tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbox: Option<serde_json::Value>,
}

/// Load state from disk. A missing snapshot is a cold start, not an error.
pub fn load_state(path: &Path) -> Result<GlobalState> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "no state snapshot, cold start");
            return Ok(GlobalState::default());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("read state {}", path.display()));
        }
    };
    let state: GlobalState = serde_json::from_str(&contents)
        .with_context(|| format!("parse state {}", path.display()))?;
    debug!(
        plans = state.plans.len(),
        cursor = state.control_cursor,
        "state loaded"
    );
    Ok(state)
}

/// Atomically write state to disk (temp file + rename).
pub fn save_state(path: &Path, state: &GlobalState) -> Result<()> {
    debug!(
        path = %path.display(),
        plans = state.plans.len(),
        cursor = state.control_cursor,
        "writing state"
    );
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::status::PlanStatus;

    #[test]
    fn load_missing_returns_empty_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = load_state(&temp.path().join("state.json")).expect("load");
        assert_eq!(state, GlobalState::default());
    }

    /// save → load preserves any valid state, including an empty plan map
    /// with a nonzero cursor.
    #[test]
    fn state_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");

        let mut state = GlobalState {
            control_cursor: 17,
            ..GlobalState::default()
        };
        save_state(&path, &state).expect("save empty");
        assert_eq!(load_state(&path).expect("load empty"), state);

        let mut plan = Plan::new("p1", "/tmp/wt", "work/p1", "main", "PLAN.md", "claude");
        plan.status = PlanStatus::Active;
        plan.current_todo = 2;
        plan.retry_count = 1;
        plan.last_error = Some("TODO #3 exited with code 1".to_string());
        state.plans.insert(plan.id.clone(), plan);
        save_state(&path, &state).expect("save");
        assert_eq!(load_state(&path).expect("load"), state);
    }

    /// Statuses this version does not know, and the opaque inbox, must
    /// survive a load/save round trip byte-compatible.
    #[test]
    fn unknown_fields_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");

        let raw = serde_json::json!({
            "control_cursor": 3,
            "plans": {
                "p1": {
                    "id": "p1",
                    "status": "escalated",
                    "worktree": "/tmp/wt",
                    "branch": "work/p1",
                    "base_branch": "main",
                    "plan_path": "PLAN.md",
                    "agent": "claude"
                }
            },
            "inbox": {"notes": ["keep me"]}
        });
        fs::write(&path, raw.to_string()).expect("write raw");

        let state = load_state(&path).expect("load");
        assert_eq!(
            state.plans["p1"].status,
            PlanStatus::Other("escalated".to_string())
        );
        save_state(&path, &state).expect("save");

        let reloaded = load_state(&path).expect("reload");
        assert_eq!(reloaded, state);
        assert_eq!(
            reloaded.inbox.expect("inbox")["notes"][0],
            serde_json::json!("keep me")
        );
    }
}
