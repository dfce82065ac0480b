//! Stable exit codes for dispatcher CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed: bad arguments, unknown plan, rejected transition, or any
/// other error.
pub const INVALID: i32 = 1;
/// Another Dispatcher already holds the lock.
pub const LOCK_HELD: i32 = 2;
