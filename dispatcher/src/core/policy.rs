//! Retry/advance policy applied when a worker finishes.
//!
//! Pure: takes the observed exit code and mutates the plan record, never
//! touching the filesystem. The Dispatcher performs the side effects (commit,
//! events) implied by the returned outcome.

use crate::core::plan::{Plan, todo_display};
use crate::core::status::PlanStatus;

/// What the policy decided for a finished attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TodoOutcome {
    /// Exit 0: the TODO at `completed_todo` is done, index advanced, retries
    /// reset. The commit message must be the TODO text verbatim.
    Advanced { completed_todo: usize },
    /// Exit 0 on the final TODO: plan moved to `review`.
    PlanComplete { completed_todo: usize },
    /// Nonzero exit within budget: same index will be re-dispatched.
    Retrying { retry_count: u32 },
    /// Retry budget exhausted: plan moved to `blocked`, `last_error` set.
    Exhausted,
}

/// Apply the outcome policy for one finished attempt on `plan.current_todo`.
///
/// `total_todos` is the number of TODOs in the parsed plan document;
/// `retry_budget` is the maximum number of failed attempts per TODO.
pub fn apply_exit(
    plan: &mut Plan,
    exit_code: i32,
    retry_budget: u32,
    total_todos: usize,
) -> TodoOutcome {
    if exit_code == 0 {
        let completed = plan.current_todo;
        plan.current_todo += 1;
        plan.retry_count = 0;
        plan.last_error = None;
        plan.change_request = None;
        if plan.current_todo >= total_todos {
            plan.status = PlanStatus::Review;
            return TodoOutcome::PlanComplete {
                completed_todo: completed,
            };
        }
        return TodoOutcome::Advanced {
            completed_todo: completed,
        };
    }

    plan.retry_count += 1;
    if plan.retry_count >= retry_budget {
        plan.status = PlanStatus::Blocked;
        plan.blocked = true;
        plan.last_error = Some(format!(
            "{} failed {} times (last exit code {})",
            todo_display(plan.current_todo),
            plan.retry_count,
            exit_code
        ));
        return TodoOutcome::Exhausted;
    }
    plan.last_error = Some(format!(
        "{} exited with code {} (attempt {}/{})",
        todo_display(plan.current_todo),
        exit_code,
        plan.retry_count,
        retry_budget
    ));
    TodoOutcome::Retrying {
        retry_count: plan.retry_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::Plan;

    fn plan() -> Plan {
        let mut plan = Plan::new("p1", "/tmp/wt", "work/p1", "main", "PLAN.md", "claude");
        plan.status = PlanStatus::Active;
        plan
    }

    #[test]
    fn zero_exit_advances_and_resets_retries() {
        let mut plan = plan();
        plan.retry_count = 2;
        plan.last_error = Some("old".to_string());

        let outcome = apply_exit(&mut plan, 0, 3, 3);
        assert_eq!(outcome, TodoOutcome::Advanced { completed_todo: 0 });
        assert_eq!(plan.current_todo, 1);
        assert_eq!(plan.retry_count, 0);
        assert!(plan.last_error.is_none());
        assert_eq!(plan.status, PlanStatus::Active);
    }

    #[test]
    fn zero_exit_on_last_todo_moves_to_review() {
        let mut plan = plan();
        plan.current_todo = 2;

        let outcome = apply_exit(&mut plan, 0, 3, 3);
        assert_eq!(outcome, TodoOutcome::PlanComplete { completed_todo: 2 });
        assert_eq!(plan.status, PlanStatus::Review);
    }

    /// K consecutive nonzero exits on one index end in `blocked` with a
    /// non-empty last_error; any zero exit before that resets the counter.
    #[test]
    fn retry_budget_exhaustion_blocks_with_error() {
        let budget = 3;
        let mut plan = plan();

        for attempt in 1..budget {
            let outcome = apply_exit(&mut plan, 1, budget, 5);
            assert_eq!(
                outcome,
                TodoOutcome::Retrying {
                    retry_count: attempt
                }
            );
            assert_eq!(plan.current_todo, 0);
            assert_eq!(plan.status, PlanStatus::Active);
        }

        let outcome = apply_exit(&mut plan, 7, budget, 5);
        assert_eq!(outcome, TodoOutcome::Exhausted);
        assert_eq!(plan.status, PlanStatus::Blocked);
        assert!(plan.blocked);
        let err = plan.last_error.expect("last_error");
        assert!(!err.is_empty());
        assert!(err.contains("TODO #1"));
        assert!(err.contains("7"));
    }

    #[test]
    fn zero_exit_before_exhaustion_resets_counter() {
        let mut plan = plan();
        apply_exit(&mut plan, 1, 3, 5);
        apply_exit(&mut plan, 1, 3, 5);
        assert_eq!(plan.retry_count, 2);

        let outcome = apply_exit(&mut plan, 0, 3, 5);
        assert_eq!(outcome, TodoOutcome::Advanced { completed_todo: 0 });
        assert_eq!(plan.retry_count, 0);
        assert_eq!(plan.current_todo, 1);
    }
}
