//! Git adapter for dispatcher operations.
//!
//! Worktree management and per-TODO commits go through a small, explicit
//! wrapper around `git` subprocess calls rather than a library binding.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            return Err(anyhow!("detached HEAD in {}", self.workdir.display()));
        }
        Ok(name)
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Create a new worktree at `path` on a new `branch` based on `base`.
    #[instrument(skip_all, fields(branch, base))]
    pub fn worktree_add(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        debug!(path = %path.display(), branch, base, "adding worktree");
        let path_str = path.display().to_string();
        self.run_checked(&["worktree", "add", "-b", branch, &path_str, base])?;
        Ok(())
    }

    /// Remove a worktree, discarding its local modifications.
    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path_str = path.display().to_string();
        self.run_checked(&["worktree", "remove", "--force", &path_str])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Stage everything and commit. Convenience for the per-TODO commit.
    pub fn commit_all(&self, message: &str) -> Result<bool> {
        self.add_all()?;
        self.commit_staged(message)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn init_repo(root: &Path) -> Git {
        let git = Git::new(root);
        git.run_checked(&["init", "-b", "main"]).expect("git init");
        git.run_checked(&["config", "user.email", "t@example.com"])
            .expect("config email");
        git.run_checked(&["config", "user.name", "t"])
            .expect("config name");
        git
    }

    #[test]
    fn commit_all_commits_todo_text_verbatim() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = init_repo(temp.path());
        fs::write(temp.path().join("a.txt"), "one").expect("write");
        git.commit_all("initial").expect("commit");

        fs::write(temp.path().join("a.txt"), "two").expect("write");
        let message = "Add the widget frobnicator";
        assert!(git.commit_all(message).expect("commit"));

        let log = git.run_capture(&["log", "-1", "--format=%s"]).expect("log");
        assert_eq!(log.trim(), message);
    }

    #[test]
    fn commit_all_without_changes_is_a_noop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = init_repo(temp.path());
        fs::write(temp.path().join("a.txt"), "one").expect("write");
        git.commit_all("initial").expect("commit");

        assert!(!git.commit_all("nothing to do").expect("commit"));
    }

    #[test]
    fn worktree_add_creates_branch_and_tree() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = init_repo(temp.path());
        fs::write(temp.path().join("a.txt"), "one").expect("write");
        git.commit_all("initial").expect("commit");

        let wt = temp.path().join("wt/p1");
        git.worktree_add(&wt, "work/p1", "main").expect("worktree");
        assert!(wt.join("a.txt").exists());
        assert!(git.branch_exists("work/p1").expect("branch_exists"));
        assert_eq!(Git::new(&wt).current_branch().expect("branch"), "work/p1");
    }
}
