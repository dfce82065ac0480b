//! Dispatcher configuration stored under `.dispatcher/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Dispatcher configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Seconds to sleep between dispatch cycles.
    pub cycle_interval_secs: u64,

    /// Maximum failed attempts per TODO before the plan is blocked.
    pub retry_budget: u32,

    /// Maximum number of plans in `active` at once; queued plans are promoted
    /// as capacity frees.
    pub max_active: usize,

    /// Interval in milliseconds for the blocking session waiter.
    pub session_poll_interval_ms: u64,

    /// Exit code assumed when a session ends without writing its marker file.
    /// The marker can be lost when the session is killed externally, so the
    /// default treats absence as success rather than failure.
    pub missing_marker_exit_code: i32,

    /// Agent used for plans that do not name one.
    pub default_agent: String,

    /// Branch new worktrees are based on when the plan does not name one.
    pub base_branch: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 10,
            retry_budget: 3,
            max_active: 4,
            session_poll_interval_ms: 1000,
            missing_marker_exit_code: 0,
            default_agent: "claude".to_string(),
            base_branch: "main".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cycle_interval_secs == 0 {
            return Err(anyhow!("cycle_interval_secs must be > 0"));
        }
        if self.retry_budget == 0 {
            return Err(anyhow!("retry_budget must be > 0"));
        }
        if self.max_active == 0 {
            return Err(anyhow!("max_active must be > 0"));
        }
        if self.session_poll_interval_ms == 0 {
            return Err(anyhow!("session_poll_interval_ms must be > 0"));
        }
        if self.default_agent.trim().is_empty() {
            return Err(anyhow!("default_agent must not be empty"));
        }
        if self.base_branch.trim().is_empty() {
            return Err(anyhow!("base_branch must not be empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `DispatcherConfig::default()`.
pub fn load_config(path: &Path) -> Result<DispatcherConfig> {
    if !path.exists() {
        let cfg = DispatcherConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: DispatcherConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &DispatcherConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
