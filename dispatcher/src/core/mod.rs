//! Pure, deterministic dispatcher logic. No I/O.

pub mod command;
pub mod plan;
pub mod policy;
pub mod status;
