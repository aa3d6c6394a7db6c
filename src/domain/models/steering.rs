//! Human-in-the-loop steering (§3.5, §3.7, §4.5) — the instruction the
//! worker drops into the sandbox (`steering.json`) and the state the
//! agent exposes in return.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single steering instruction consumed exactly once by the agent
/// (§6.1, §8 testable property 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteeringInstruction {
    pub id: String,
    pub action: SteeringAction,
    pub issued_at: DateTime<Utc>,
}

/// What a steering instruction asks the agent to do (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SteeringAction {
    Approve,
    Reject { reason: Option<String> },
    Cancel,
    Steer { prompt: String },
    Continue { skip_remaining_verifiers: bool },
}

/// One entry in the steering audit trail (§3.7) — every instruction the
/// agent has consumed, in delivery order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteeringHistoryEntry {
    pub instruction: SteeringInstruction,
    pub consumed_at: DateTime<Utc>,
    pub iteration: u32,
}

/// Agent-reported steering state, exposed to the client API
/// (`GetSteeringState`, §6.2) so a human operator can see what the agent
/// has seen and how many iterations remain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteeringState {
    pub task_id: String,
    pub group_name: String,
    pub iterations_used: u32,
    pub max_iterations: u32,
    pub history: Vec<SteeringHistoryEntry>,
    pub awaiting_instruction: bool,
}

impl SteeringState {
    pub fn new(task_id: impl Into<String>, group_name: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            task_id: task_id.into(),
            group_name: group_name.into(),
            iterations_used: 0,
            max_iterations,
            history: Vec::new(),
            awaiting_instruction: false,
        }
    }

    /// Whether the steering loop has exhausted its iteration budget
    /// (§4.5) — the agent must stop waiting and proceed with whatever
    /// verifier state it has.
    pub fn exhausted(&self) -> bool {
        self.iterations_used >= self.max_iterations
    }

    pub fn record(&mut self, instruction: SteeringInstruction, now: DateTime<Utc>) {
        self.iterations_used += 1;
        self.awaiting_instruction = false;
        self.history.push(SteeringHistoryEntry {
            instruction,
            consumed_at: now,
            iteration: self.iterations_used,
        });
    }
}
