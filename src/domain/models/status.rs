//! In-sandbox agent status document (§3.3) — written atomically by the
//! agent, polled by the worker (`status.json` in the control-file
//! protocol, §6.1).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse-grained phase the agent is currently in (§3.3, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Provisioning,
    Cloning,
    Setup,
    Running,
    AwaitingApproval,
    Verifying,
    CollectingDiff,
    CreatingPr,
    Reporting,
    Succeeded,
    Failed,
    Cancelled,
}

impl AgentPhase {
    /// Whether this phase is terminal — no further status updates are
    /// expected once reached.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether the group workflow should treat this phase as "waiting on a
    /// human" for the purposes of the approval gate (§4.4 step 4,
    /// §8 testable property 8).
    pub const fn is_awaiting_human(self) -> bool {
        matches!(self, Self::AwaitingApproval)
    }
}

/// Snapshot of agent progress, written to `status.json` (§3.3, §6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub task_id: String,
    pub group_name: String,
    pub phase: AgentPhase,
    /// Short label for the current step (e.g. which repo is being
    /// cloned), distinct from `message` which carries free-text detail.
    #[serde(default)]
    pub step: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Coarse progress counter in `[0, 100]`, when the phase can report
    /// one (e.g. "3 of 5 repos cloned").
    #[serde(default)]
    pub progress_percent: Option<u8>,
    /// Current steering iteration, mirrored here so a poller doesn't need
    /// a second round trip to `GetSteeringState` for the common case.
    #[serde(default)]
    pub steering_iteration: u32,
    pub updated_at: DateTime<Utc>,
    /// Count of heartbeats emitted since the phase last changed; lets the
    /// worker distinguish "still alive, same phase" from "stalled".
    #[serde(default)]
    pub heartbeat_count: u64,
}

impl AgentStatus {
    pub fn new(task_id: impl Into<String>, group_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.into(),
            group_name: group_name.into(),
            phase: AgentPhase::Provisioning,
            step: None,
            message: None,
            progress_percent: None,
            steering_iteration: 0,
            updated_at: now,
            heartbeat_count: 0,
        }
    }

    pub fn transition(&mut self, phase: AgentPhase, message: Option<String>, now: DateTime<Utc>) {
        self.phase = phase;
        self.message = message;
        self.updated_at = now;
        self.heartbeat_count = 0;
    }

    pub fn heartbeat(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
        self.heartbeat_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_phases() {
        assert!(AgentPhase::Succeeded.is_terminal());
        assert!(AgentPhase::Failed.is_terminal());
        assert!(AgentPhase::Cancelled.is_terminal());
        assert!(!AgentPhase::Running.is_terminal());
    }

    #[test]
    fn transition_resets_heartbeat() {
        let now = Utc::now();
        let mut status = AgentStatus::new("t1", "g1", now);
        status.heartbeat(now);
        status.heartbeat(now);
        assert_eq!(status.heartbeat_count, 2);
        status.transition(AgentPhase::Cloning, Some("cloning widgets".into()), now);
        assert_eq!(status.heartbeat_count, 0);
        assert_eq!(status.phase, AgentPhase::Cloning);
    }
}
