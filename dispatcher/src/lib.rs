//! Engine for orchestrating autonomous coding-agent workers over plans.
//!
//! A plan is a markdown TODO list executing inside its own git worktree. The
//! Dispatcher walks each plan's TODOs in order, launching one agent process
//! per attempt and persisting every observable change to a single state file.
//! The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (statuses, transitions, the
//!   retry/advance policy). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (state file, lock, queue, git,
//!   tmux sessions, detached processes). Isolated to enable substitution in
//!   tests.
//!
//! [`dispatch`] coordinates core logic with I/O to implement the control
//! loop; [`commands`] implements the operator surface; [`agents`] integrates
//! the external agent CLIs behind one trait.

pub mod agents;
pub mod commands;
pub mod core;
pub mod dispatch;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
