//! Initialization helpers for `.dispatcher/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::io::config::{DispatcherConfig, write_config};

/// All canonical paths within `.dispatcher/` for a repository root.
#[derive(Debug, Clone)]
pub struct DispatcherPaths {
    pub root: PathBuf,
    pub dispatcher_dir: PathBuf,
    pub state_path: PathBuf,
    pub lock_path: PathBuf,
    pub queue_path: PathBuf,
    pub config_path: PathBuf,
    pub sessions_dir: PathBuf,
    pub worktrees_dir: PathBuf,
    pub plans_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl DispatcherPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let dispatcher_dir = root.join(".dispatcher");
        Self {
            root,
            state_path: dispatcher_dir.join("state.json"),
            lock_path: dispatcher_dir.join("lock.json"),
            queue_path: dispatcher_dir.join("queue.jsonl"),
            config_path: dispatcher_dir.join("config.toml"),
            sessions_dir: dispatcher_dir.join("sessions"),
            worktrees_dir: dispatcher_dir.join("worktrees"),
            plans_dir: dispatcher_dir.join("plans"),
            gitignore_path: dispatcher_dir.join(".gitignore"),
            dispatcher_dir,
        }
    }
}

/// Options for `init_dispatcher`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing dispatcher-owned files.
    pub force: bool,
}

const GITIGNORE: &str = "lock.json\nqueue.jsonl\nsessions/\nworktrees/\nstate.json\n";

/// Create `.dispatcher/` scaffolding in `root`.
///
/// Fails if `.dispatcher/` already exists unless `options.force` is set.
pub fn init_dispatcher(root: &Path, options: &InitOptions) -> Result<DispatcherPaths> {
    let paths = DispatcherPaths::new(root);
    if paths.dispatcher_dir.exists() && !options.force {
        return Err(anyhow!(
            "{} already exists (use --force to reinitialize)",
            paths.dispatcher_dir.display()
        ));
    }

    for dir in [
        &paths.dispatcher_dir,
        &paths.sessions_dir,
        &paths.worktrees_dir,
        &paths.plans_dir,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }

    if options.force || !paths.config_path.exists() {
        write_config(&paths.config_path, &DispatcherConfig::default())?;
    }
    if options.force || !paths.gitignore_path.exists() {
        fs::write(&paths.gitignore_path, GITIGNORE)
            .with_context(|| format!("write {}", paths.gitignore_path.display()))?;
    }

    Ok(paths)
}
