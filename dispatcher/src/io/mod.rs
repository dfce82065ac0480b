//! Side-effecting operations: filesystem, git, tmux, child processes.

pub mod config;
pub mod git;
pub mod init;
pub mod lock;
pub mod plan_doc;
pub mod process;
pub mod prompt;
pub mod queue;
pub mod review;
pub mod session;
pub mod state;
pub mod worktree;
