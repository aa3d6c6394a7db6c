//! Execution progress snapshot (§3.7) exposed via `GetExecutionProgress`
//! (§6.2) — a coarser, client-facing view over `AgentStatus` plus group
//! scheduler bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::models::status::AgentPhase;

/// Per-group progress as seen by the scheduler (§4.2, §3.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupProgress {
    pub group_name: String,
    pub phase: AgentPhase,
    pub started_at: Option<DateTime<Utc>>,
}

/// Whole-task execution progress (§3.7, §6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub task_id: String,
    pub total_groups: u32,
    pub completed_groups: u32,
    pub failed_groups: u32,
    pub running_groups: Vec<GroupProgress>,
    /// Whether the scheduler has paused new group launches on a
    /// failure-threshold breach (§8 testable property 5).
    pub is_paused: bool,
    /// Non-empty iff `is_paused`; explains why (§8 property 5 requires
    /// `GetExecutionProgress` to report a reason alongside `is_paused`).
    pub paused_reason: Option<String>,
    /// Names of groups that have reached a `Failed` terminal outcome.
    #[serde(default)]
    pub failed_group_names: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionProgress {
    /// `completed_groups / total_groups` as whole percent, matching
    /// `TaskResult::completion_percent`'s denominator policy.
    pub fn percent_complete(&self) -> u8 {
        if self.total_groups == 0 {
            return 100;
        }
        ((self.completed_groups * 100) / self.total_groups) as u8
    }

    /// `failed / completed` as whole percent, the same denominator
    /// policy the scheduler uses to decide whether to pause (§9 Open
    /// Question 1: completed counts every terminal group observed so
    /// far, success and failure alike).
    pub fn failure_percent(&self) -> u8 {
        if self.completed_groups == 0 {
            return 0;
        }
        ((self.failed_groups * 100) / self.completed_groups) as u8
    }

    /// Mark the progress snapshot paused with an explanatory reason.
    pub fn pause(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.is_paused = true;
        self.paused_reason = Some(reason.into());
        self.updated_at = now;
    }
}
