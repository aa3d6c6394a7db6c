//! Transform workflow state (§3.8, §4.1) — the durable state machine's
//! states and the mutable runtime state it exclusively owns.
//!
//! This module models the *shape* of that state; the state machine's
//! transition logic lives in `application::transform_workflow` since it
//! depends on the activity runner and sandbox provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::models::progress::ExecutionProgress;
use crate::domain::models::result::TaskResult;
use crate::domain::models::steering::SteeringState;

/// States of the durable transform workflow (§4.1: "pending →
/// provisioning → cloning → running → awaiting_approval? →
/// creating_prs → completed | failed | cancelled").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Pending,
    Provisioning,
    Cloning,
    Running,
    AwaitingApproval,
    CreatingPrs,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Valid successor states from this state, per the §4.1 state
    /// machine diagram. `AwaitingApproval` is conditional (only entered
    /// when the task requires approval), so `Running` may transition
    /// directly to `CreatingPrs`.
    pub fn valid_transitions(self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Provisioning, Self::Failed, Self::Cancelled],
            Self::Provisioning => &[Self::Cloning, Self::Failed, Self::Cancelled],
            Self::Cloning => &[Self::Running, Self::Failed, Self::Cancelled],
            Self::Running => &[
                Self::AwaitingApproval,
                Self::CreatingPrs,
                Self::Completed,
                Self::Failed,
                Self::Cancelled,
            ],
            Self::AwaitingApproval => &[Self::CreatingPrs, Self::Failed, Self::Cancelled],
            Self::CreatingPrs => &[Self::Completed, Self::Failed, Self::Cancelled],
            Self::Completed | Self::Failed | Self::Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// The workflow's exclusively-owned mutable runtime state (§3.8:
/// "the Transform workflow exclusively owns mutable runtime state —
/// scheduler state, steering state, cached diffs/logs").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub task_id: String,
    pub state: WorkflowState,
    pub progress: ExecutionProgress,
    pub steering: Vec<SteeringState>,
    pub result: Option<TaskResult>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn new(task_id: impl Into<String>, total_groups: u32, now: DateTime<Utc>) -> Self {
        let task_id = task_id.into();
        Self {
            task_id: task_id.clone(),
            state: WorkflowState::Pending,
            progress: ExecutionProgress {
                task_id,
                total_groups,
                completed_groups: 0,
                failed_groups: 0,
                running_groups: Vec::new(),
                is_paused: false,
                paused_reason: None,
                failed_group_names: Vec::new(),
                updated_at: now,
            },
            steering: Vec::new(),
            result: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Apply a state transition, rejecting one that the state machine
    /// does not allow. The workflow runner is the only caller; this
    /// guards against the runner's own bugs, not external input.
    pub fn transition(&mut self, next: WorkflowState, now: DateTime<Utc>) -> Result<(), String> {
        if !self.state.can_transition_to(next) {
            return Err(format!("illegal transition {:?} -> {:?}", self.state, next));
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_cannot_jump_to_completed() {
        assert!(!WorkflowState::Pending.can_transition_to(WorkflowState::Completed));
    }

    #[test]
    fn running_may_skip_approval_when_not_required() {
        assert!(WorkflowState::Running.can_transition_to(WorkflowState::CreatingPrs));
        assert!(WorkflowState::Running.can_transition_to(WorkflowState::AwaitingApproval));
    }

    #[test]
    fn terminal_states_have_no_successors() {
        assert!(WorkflowState::Completed.valid_transitions().is_empty());
    }

    #[test]
    fn instance_rejects_illegal_transition() {
        let mut instance = WorkflowInstance::new("t1", 3, Utc::now());
        let err = instance
            .transition(WorkflowState::Completed, Utc::now())
            .unwrap_err();
        assert!(err.contains("illegal transition"));
    }
}
