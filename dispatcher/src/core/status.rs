//! Plan lifecycle statuses and legal transitions.
//!
//! Statuses form the active path `draft → queued → active ⇄ {blocked, paused,
//! review} → reviewing → triaging → {active|blocked}` with `done` as the only
//! terminal state. The `blocked` boolean on [`crate::core::plan::Plan`] is
//! orthogonal and may co-occur with any non-terminal status, which is why it is
//! not folded into this enum.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a plan.
///
/// Statuses not produced by this version round-trip through [`Other`] so a
/// newer state file survives load/save unchanged.
///
/// [`Other`]: PlanStatus::Other
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PlanStatus {
    Draft,
    Queued,
    Active,
    Blocked,
    Paused,
    Review,
    Reviewing,
    Triaging,
    Done,
    /// Unrecognized status string, preserved losslessly.
    Other(String),
}

impl PlanStatus {
    pub fn as_str(&self) -> &str {
        match self {
            PlanStatus::Draft => "draft",
            PlanStatus::Queued => "queued",
            PlanStatus::Active => "active",
            PlanStatus::Blocked => "blocked",
            PlanStatus::Paused => "paused",
            PlanStatus::Review => "review",
            PlanStatus::Reviewing => "reviewing",
            PlanStatus::Triaging => "triaging",
            PlanStatus::Done => "done",
            PlanStatus::Other(s) => s,
        }
    }

    /// `done` is the only terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlanStatus::Done)
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for PlanStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "draft" => PlanStatus::Draft,
            "queued" => PlanStatus::Queued,
            "active" => PlanStatus::Active,
            "blocked" => PlanStatus::Blocked,
            "paused" => PlanStatus::Paused,
            "review" => PlanStatus::Review,
            "reviewing" => PlanStatus::Reviewing,
            "triaging" => PlanStatus::Triaging,
            "done" => PlanStatus::Done,
            _ => PlanStatus::Other(s),
        }
    }
}

impl From<PlanStatus> for String {
    fn from(status: PlanStatus) -> Self {
        status.as_str().to_string()
    }
}

/// Rejected manual transition, naming the plan's actual status.
///
/// Surfaced to the operator verbatim, so the message must identify both the
/// attempted action and the current status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub action: &'static str,
    pub required: &'static str,
    pub actual: PlanStatus,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot {}: requires status '{}' but plan is '{}'",
            self.action, self.required, self.actual
        )
    }
}

impl std::error::Error for TransitionError {}

/// `unblock` is legal only from `blocked`.
pub fn check_unblock(status: &PlanStatus) -> Result<(), TransitionError> {
    if *status == PlanStatus::Blocked {
        return Ok(());
    }
    Err(TransitionError {
        action: "unblock",
        required: "blocked",
        actual: status.clone(),
    })
}

/// `review` is legal only when the plan is exactly in `review`.
pub fn check_review_trigger(status: &PlanStatus) -> Result<(), TransitionError> {
    if *status == PlanStatus::Review {
        return Ok(());
    }
    Err(TransitionError {
        action: "trigger review",
        required: "review",
        actual: status.clone(),
    })
}

/// Whether `resume` applies. `resume` on a non-paused plan is a no-op,
/// not an error.
pub fn resume_applies(status: &PlanStatus) -> bool {
    *status == PlanStatus::Paused
}
