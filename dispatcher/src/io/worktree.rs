//! Worktree provisioning for accepted plans.
//!
//! The Dispatcher never creates worktrees itself; it goes through the
//! [`WorktreeProvider`] seam so tests can substitute plain directories.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::io::git::Git;

/// Creates isolated working trees for plans.
pub trait WorktreeProvider {
    /// Create a worktree under `worktrees_root` on a new `branch` based on
    /// `base_branch`, returning the worktree path.
    fn create_worktree(
        &self,
        repo_root: &Path,
        worktrees_root: &Path,
        branch: &str,
        base_branch: &str,
    ) -> Result<PathBuf>;

    /// Copy a file into the worktree at a relative destination.
    fn copy_file(&self, src: &Path, worktree: &Path, rel_dest: &Path) -> Result<()>;
}

/// `git worktree`-backed provider.
#[derive(Debug, Clone, Default)]
pub struct GitWorktreeProvider;

impl WorktreeProvider for GitWorktreeProvider {
    fn create_worktree(
        &self,
        repo_root: &Path,
        worktrees_root: &Path,
        branch: &str,
        base_branch: &str,
    ) -> Result<PathBuf> {
        fs::create_dir_all(worktrees_root)
            .with_context(|| format!("create {}", worktrees_root.display()))?;
        // Branch names contain slashes; flatten for the directory name.
        let dir_name = branch.replace('/', "-");
        let path = worktrees_root.join(dir_name);
        Git::new(repo_root).worktree_add(&path, branch, base_branch)?;
        info!(worktree = %path.display(), branch, "worktree created");
        Ok(path)
    }

    fn copy_file(&self, src: &Path, worktree: &Path, rel_dest: &Path) -> Result<()> {
        let dest = worktree.join(rel_dest);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::copy(src, &dest).with_context(|| {
            format!("copy {} to {}", src.display(), dest.display())
        })?;
        Ok(())
    }
}
