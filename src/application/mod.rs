//! Application layer module
//!
//! This module contains the orchestration logic that sits between the
//! domain model and the infrastructure adapters:
//! - Task/group scheduling with bounded concurrency and failure-threshold
//!   pausing
//! - The durable transform workflow state machine
//! - Retry/backoff activity execution
//! - Human-in-the-loop signal delivery (approve/reject/steer/cancel/continue)
//! - Task validation
//!
//! The application layer coordinates between domain services and
//! infrastructure, implementing the use cases and business workflows.

pub mod activity;
pub mod group_scheduler;
pub mod group_workflow;
pub mod knowledge_hooks;
pub mod signals;
pub mod transform_workflow;
pub mod validation;

pub use activity::{ActivityRunner, Heartbeat, HeartbeatTimeout, RetryPolicy};
pub use group_scheduler::{cancel_groups, skip_groups, GroupScheduler, GroupSpec, SchedulerDecision, SchedulerRunOutcome};
pub use group_workflow::{GroupWorkflow, GroupWorkflowInput};
pub use signals::{CancelToken, Signal, SignalEnvelope, SignalId, SignalQueue, SignalSender};
pub use transform_workflow::{compute_groups, TransformWorkflow, WorkflowEvent, WorkflowStore};
pub use validation::{validate_task, ValidationOutcome};
