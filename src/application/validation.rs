//! Task validation use-case (§4.1 algorithm step 1).
//!
//! Wraps the domain-level `Task::validate`/`TaskManifest::validate`
//! checks into the shape the transform workflow needs: a single
//! all-or-nothing gate run before any sandbox is provisioned.

use tracing::warn;

use crate::domain::error::ValidationError;
use crate::domain::models::task::Task;

/// Outcome of validating a task before workflow execution begins.
#[derive(Debug, Clone)]
pub enum ValidationOutcome {
    Passed,
    Failed(Vec<ValidationError>),
}

impl ValidationOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// Validate a task, logging every violation found (§3.1 invariants,
/// §8 testable property 1). The workflow transitions straight to
/// `Failed` on any violation; there is no partial-validity path.
pub fn validate_task(task: &Task) -> ValidationOutcome {
    match task.validate() {
        Ok(()) => ValidationOutcome::Passed,
        Err(errors) => {
            for err in &errors {
                warn!(task_id = %task.id, error = %err, "task validation failed");
            }
            ValidationOutcome::Failed(errors)
        }
    }
}
