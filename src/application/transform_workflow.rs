//! Durable transform workflow (§4.1) — the top-level state machine that
//! validates the task, runs one group inline or fans out through the
//! scheduler, applies the approval gate, and produces the TaskResult.
//!
//! The "durable-workflow runtime itself" is explicitly out of scope
//! (spec.md §1 Non-goals); what's modeled here is the state machine this
//! crate requires of such a runtime: explicit states, a replayable event
//! log, and signal/query surfaces. Persistence is handled by
//! `infrastructure::workflow_store`.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::application::group_scheduler::{cancel_groups, skip_groups, GroupScheduler, GroupSpec};
use crate::application::group_workflow::{GroupWorkflow, GroupWorkflowInput, SandboxRegistry};
use crate::application::knowledge_hooks;
use crate::application::signals::{CancelToken, Signal, SignalEnvelope, SignalQueue};
use crate::application::validation::{validate_task, ValidationOutcome};
use crate::domain::models::manifest::TaskManifest;
use crate::domain::models::progress::ExecutionProgress;
use crate::domain::models::result::{GroupOutcome, GroupResult, TaskResult};
use crate::domain::models::task::Task;
use crate::domain::models::workflow::{WorkflowInstance, WorkflowState};
use crate::domain::ports::{KnowledgeStore, SandboxProvider};

/// One event in the workflow's append-only, replayable log (§4.1: state
/// transitions survive process restarts by replay rather than relying on
/// in-memory state alone). Persisted verbatim by
/// `infrastructure::workflow_store::WorkflowStore`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum WorkflowEvent {
    Started { task_id: String, total_groups: u32 },
    StateChanged { from: WorkflowState, to: WorkflowState },
    GroupCompleted { group: GroupResult },
    SignalReceived { signal_summary: String },
    Finished { result: TaskResult },
}

/// Durable persistence for workflow instances and their event logs
/// (§4.1: state survives process restarts by replay). Stands in for
/// the external durable-workflow runtime's own state store; the
/// concrete adapter is `infrastructure::workflow_store::SqliteWorkflowStore`.
#[async_trait::async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Persist the current instance snapshot and append `new_events` to
    /// the event log in one unit.
    async fn save(
        &self,
        instance: &WorkflowInstance,
        new_events: &[WorkflowEvent],
    ) -> Result<(), crate::domain::error::FleetliftError>;

    /// Load the most recent snapshot for `task_id`, if any.
    async fn load(&self, task_id: &str) -> Result<Option<WorkflowInstance>, crate::domain::error::FleetliftError>;

    /// Replay the full event log for `task_id`, in the order recorded.
    async fn load_events(&self, task_id: &str) -> Result<Vec<WorkflowEvent>, crate::domain::error::FleetliftError>;
}

/// Compute the group list per §4.1 algorithm step 2: explicit `groups`
/// if present; otherwise one synthesized group per repo when
/// `parallel=true`; otherwise a single group containing every repo.
pub fn compute_groups(task: &Task) -> Vec<GroupSpec> {
    if !task.groups.is_empty() {
        return task
            .groups
            .iter()
            .map(|g| GroupSpec {
                name: g.name.clone(),
                repositories: g.repositories.clone(),
            })
            .collect();
    }

    let repos: Vec<String> = task
        .effective_repositories()
        .iter()
        .map(|r| r.effective_name())
        .collect();

    if task.parallel {
        repos
            .into_iter()
            .map(|name| GroupSpec {
                repositories: vec![name.clone()],
                name,
            })
            .collect()
    } else {
        vec![GroupSpec {
            name: "all".to_string(),
            repositories: repos,
        }]
    }
}

/// Drives one task from `Pending` to a terminal state.
pub struct TransformWorkflow<P: SandboxProvider> {
    group_workflow: GroupWorkflow<P>,
    sandbox_registry: SandboxRegistry,
    signals: SignalQueue,
    /// Raised the instant a `Signal::Cancel` is submitted, independent
    /// of the signal queue's FIFO delivery — every group this workflow
    /// runs gets a clone, so cancellation reaches an in-flight group
    /// directly instead of only being noticed after it (and every other
    /// group) finishes.
    cancel: CancelToken,
    knowledge_store: Option<Arc<dyn KnowledgeStore>>,
}

impl<P: SandboxProvider + Clone + 'static> TransformWorkflow<P> {
    pub fn new(provider: P) -> Self {
        let sandbox_registry = SandboxRegistry::default();
        Self {
            group_workflow: GroupWorkflow::new(provider, sandbox_registry.clone()),
            sandbox_registry,
            signals: SignalQueue::new(),
            cancel: CancelToken::new(),
            knowledge_store: None,
        }
    }

    /// Attach a `KnowledgeStore` backing the continual-learning hooks
    /// (§4.6). Without one, `enrich`/`capture` are no-ops regardless of
    /// `task.knowledge`.
    #[must_use]
    pub fn with_knowledge_store(mut self, store: Arc<dyn KnowledgeStore>) -> Self {
        self.knowledge_store = Some(store);
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: std::time::Duration) -> Self {
        self.group_workflow = self.group_workflow.with_poll_interval(interval);
        self
    }

    pub fn signal_sender(&self) -> crate::application::signals::SignalSender {
        self.signals.sender()
    }

    /// The directory of sandboxes currently backing this workflow's
    /// in-flight groups, shared with a client API layer so HITL steering
    /// (approve/reject/steer) can be relayed straight to the provider
    /// for the group it targets (§4.5).
    pub fn sandbox_registry(&self) -> SandboxRegistry {
        self.sandbox_registry.clone()
    }

    /// Run the task to completion, emitting `WorkflowEvent`s to `log` as
    /// it goes (§4.1 Algorithm steps 1-6).
    pub async fn run(
        &mut self,
        task: &Task,
        log: &mut Vec<WorkflowEvent>,
    ) -> (WorkflowInstance, TaskResult) {
        let started_at = Utc::now();
        let groups = compute_groups(task);
        let mut instance = WorkflowInstance::new(task.id.clone(), groups.len() as u32, started_at);
        log.push(WorkflowEvent::Started {
            task_id: task.id.clone(),
            total_groups: groups.len() as u32,
        });

        // Step 1: validate.
        if let ValidationOutcome::Failed(errors) = validate_task(task) {
            self.transition(&mut instance, WorkflowState::Failed, log);
            let result = TaskResult {
                task_id: task.id.clone(),
                groups: Vec::new(),
                started_at,
                finished_at: Utc::now(),
            };
            warn!(task_id = %task.id, errors = ?errors, "task failed validation");
            log.push(WorkflowEvent::Finished {
                result: result.clone(),
            });
            return (instance, result);
        }

        self.transition(&mut instance, WorkflowState::Provisioning, log);
        self.transition(&mut instance, WorkflowState::Cloning, log);
        self.transition(&mut instance, WorkflowState::Running, log);

        // Enrich (§4.6): fetch a knowledge digest once per task, before
        // any group's manifest is built, and prepend it to every group's
        // prompt. Swallows its own failures; absent a store or
        // `task.knowledge`, this is a no-op.
        let enrich_digest = knowledge_hooks::enrich(self.knowledge_store.as_deref(), task.knowledge.as_ref()).await;

        let group_results = if groups.len() == 1 {
            // Step 3: a single group runs inline, bypassing the scheduler
            // (§4.2 Edge cases: "Single group -> bypass threshold logic").
            let group = groups.into_iter().next().unwrap();
            vec![self.run_group(task, group, enrich_digest.clone()).await]
        } else {
            self.run_scheduled(task, groups, &mut instance, log, enrich_digest).await
        };

        for result in &group_results {
            log.push(WorkflowEvent::GroupCompleted {
                group: result.clone(),
            });
        }
        update_progress(&mut instance.progress, &group_results, Utc::now());

        // `self.cancel` is already authoritative — it was raised the
        // instant `submit` saw a `Signal::Cancel`, which is also what
        // every in-flight group checked to short-circuit itself. Drain
        // the queue only to clear out whatever else accumulated (e.g. a
        // stray `continue`) now that the task has finished.
        self.signals.drain();
        let cancelled = self.cancel.is_cancelled();

        let final_state = if cancelled {
            WorkflowState::Cancelled
        } else if group_results.iter().any(|g| g.outcome == GroupOutcome::Failed) {
            WorkflowState::Failed
        } else {
            WorkflowState::Completed
        };
        self.transition(&mut instance, final_state, log);

        let result = TaskResult {
            task_id: task.id.clone(),
            groups: group_results,
            started_at,
            finished_at: Utc::now(),
        };
        instance.result = Some(result.clone());
        log.push(WorkflowEvent::Finished {
            result: result.clone(),
        });

        // Capture (§4.6): summarize any steering corrections recorded
        // against this task's groups into knowledge items. Only runs
        // once the task has reached a terminal state and only when
        // there's steering history to learn from.
        let steering_history: Vec<_> = instance.steering.iter().flat_map(|s| s.history.clone()).collect();
        knowledge_hooks::capture(self.knowledge_store.as_deref(), task.knowledge.as_ref(), &steering_history).await;

        (instance, result)
    }

    async fn run_group(&self, task: &Task, group: GroupSpec, enrich_digest: Option<String>) -> GroupResult {
        run_one_group(&self.group_workflow, task, group, enrich_digest.as_deref(), &self.cancel).await
    }

    /// Run groups through the scheduler, waiting for a `continue` signal
    /// and relaunching (or skipping) the remainder each time the
    /// scheduler pauses on a failure-threshold breach (§4.2 "Resume
    /// protocol", §8 testable property 6).
    async fn run_scheduled(
        &mut self,
        task: &Task,
        groups: Vec<GroupSpec>,
        instance: &mut WorkflowInstance,
        log: &mut Vec<WorkflowEvent>,
        enrich_digest: Option<String>,
    ) -> Vec<GroupResult> {
        let mut scheduler = GroupScheduler::new(
            task.effective_max_parallel(),
            task.effective_failure_threshold(),
        );

        let mut all_results = Vec::new();
        let mut remaining = groups;

        loop {
            let task_owned = task.clone();
            let group_workflow = self.group_workflow.clone();
            let digest_owned = enrich_digest.clone();
            let cancel_owned = self.cancel.clone();
            let outcome = scheduler
                .run_all(remaining, &self.cancel, move |group| {
                    let task = task_owned.clone();
                    let group_workflow = group_workflow.clone();
                    let digest = digest_owned.clone();
                    let cancel = cancel_owned.clone();
                    async move { run_one_group(&group_workflow, &task, group, digest.as_deref(), &cancel).await }
                })
                .await;
            all_results.extend(outcome.results);

            if outcome.pending.is_empty() {
                break;
            }

            if self.cancel.is_cancelled() {
                info!(task_id = %task.id, "cancel requested, skipping remaining groups");
                all_results.extend(cancel_groups(outcome.pending));
                break;
            }

            let now = Utc::now();
            instance.progress.pause("failure-threshold-breach", now);
            log.push(WorkflowEvent::SignalReceived {
                signal_summary: "failure-threshold-pause".into(),
            });
            warn!(task_id = %task.id, "scheduler paused, awaiting continue signal");

            // Wait for a decision. Signals unrelated to resuming (e.g. a
            // steer aimed at a still-running group) don't apply here and
            // are dropped rather than looped on, since the scheduler has
            // no in-flight groups left to steer while paused.
            let decision = loop {
                match self.signals.recv().await {
                    Some(envelope) => match envelope.signal {
                        Signal::Continue { skip_remaining } => break Some(skip_remaining),
                        Signal::Cancel => break None,
                        other => {
                            info!(task_id = %task.id, signal = ?other, "ignoring non-resume signal while paused");
                        }
                    },
                    None => break None,
                }
            };

            match decision {
                Some(false) => {
                    instance.progress.is_paused = false;
                    instance.progress.paused_reason = None;
                    scheduler.resume();
                    remaining = outcome.pending;
                }
                Some(true) => {
                    all_results.extend(skip_groups(outcome.pending));
                    break;
                }
                None => {
                    // Explicit cancel, or the signal channel closed —
                    // either way there's no one left to resume this
                    // from, so the remainder is cancelled rather than
                    // merely skipped.
                    all_results.extend(cancel_groups(outcome.pending));
                    break;
                }
            }
        }

        all_results
    }

    fn transition(&self, instance: &mut WorkflowInstance, next: WorkflowState, log: &mut Vec<WorkflowEvent>) {
        let from = instance.state;
        if let Err(err) = instance.transition(next, Utc::now()) {
            warn!(error = %err, "attempted illegal workflow transition");
            return;
        }
        info!(from = ?from, to = ?next, "workflow transitioned");
        log.push(WorkflowEvent::StateChanged { from, to: next });
    }

    /// Apply an externally-submitted signal immediately, outside the
    /// group-running loop (e.g. `approve`/`reject`/`steer` relayed
    /// straight into the sandbox via the group's steering submission).
    pub fn submit(&self, envelope: SignalEnvelope) {
        match &envelope.signal {
            Signal::Cancel => {
                info!(task_id = %envelope.task_id, "cancel signal queued");
                // Raised immediately rather than waiting for the queue
                // to be drained, so an in-flight group notices within
                // one poll interval instead of only after every group
                // has already run to completion.
                self.cancel.cancel();
            }
            other => info!(task_id = %envelope.task_id, signal = ?other, "signal queued"),
        }
        let _ = self.signals.sender().send(envelope);
    }
}

/// Fold the final `GroupResult`s into the progress snapshot: every group
/// has reached a terminal outcome by the time this is called, so
/// `running_groups` is cleared and `completed_groups`/`failed_groups`
/// reflect the whole run (§3.7, §8 testable property 5).
fn update_progress(progress: &mut ExecutionProgress, group_results: &[GroupResult], now: chrono::DateTime<Utc>) {
    progress.running_groups = Vec::new();
    progress.completed_groups = group_results
        .iter()
        .filter(|g| g.outcome != GroupOutcome::Cancelled)
        .count() as u32;
    progress.failed_group_names = group_results
        .iter()
        .filter(|g| g.outcome == GroupOutcome::Failed)
        .map(|g| g.group_name.clone())
        .collect();
    progress.failed_groups = progress.failed_group_names.len() as u32;
    progress.updated_at = now;
}

/// Build the manifest for `group` and run it through `group_workflow`,
/// or fail every repo in the group with the same `ValidationError` if
/// the manifest itself is malformed (mirrors §4.3 "Failure semantics":
/// a provisioning-stage failure marks every repo in the group failed
/// with the same error message).
async fn run_one_group<P: SandboxProvider + Clone>(
    group_workflow: &GroupWorkflow<P>,
    task: &Task,
    group: GroupSpec,
    enrich_digest: Option<&str>,
    cancel: &CancelToken,
) -> GroupResult {
    if cancel.is_cancelled() {
        let now = Utc::now();
        return GroupResult {
            group_name: group.name,
            outcome: GroupOutcome::Cancelled,
            repos: Vec::new(),
            started_at: now,
            finished_at: now,
        };
    }

    let mut manifest = match TaskManifest::from_task_and_group(task, &group.name, &group.repositories) {
        Ok(manifest) => manifest,
        Err(err) => {
            let now = Utc::now();
            let fleetlift_err = crate::domain::error::FleetliftError::Validation(err);
            return GroupResult {
                group_name: group.name,
                outcome: GroupOutcome::Failed,
                repos: group
                    .repositories
                    .iter()
                    .map(|name| {
                        crate::domain::models::result::RepoResult::failure(name.clone(), &fleetlift_err)
                    })
                    .collect(),
                started_at: now,
                finished_at: now,
            };
        }
    };

    if let Some(digest) = enrich_digest {
        manifest.apply_enrichment(digest);
    }

    group_workflow
        .run(
            GroupWorkflowInput {
                task_id: task.id.clone(),
                group_name: group.name,
                repo_names: group.repositories,
                manifest: &manifest,
            },
            cancel,
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::domain::models::result::RepoResult;
    use crate::domain::models::status::AgentStatus;
    use crate::domain::models::steering::SteeringInstruction;
    use crate::domain::models::task::{ExecutionSpec, PullRequestConfig, RepositorySpec, TaskMode};
    use crate::domain::ports::{ExecOutput, SandboxHandle, SandboxLifecycleStatus};

    fn repo(name: &str) -> RepositorySpec {
        RepositorySpec {
            url: format!("https://github.com/acme/{name}.git"),
            branch: None,
            name: Some(name.to_string()),
            setup: vec![],
        }
    }

    fn task(id: &str, repos: Vec<RepositorySpec>, parallel: bool) -> Task {
        Task {
            version: "1".into(),
            id: id.into(),
            title: "Demo".into(),
            mode: TaskMode::Transform,
            repositories: repos,
            transformation: None,
            targets: vec![],
            for_each: vec![],
            execution: ExecutionSpec::Agentic {
                prompt: "do the thing".into(),
                verifiers: vec![],
                limits: None,
                output: None,
            },
            groups: vec![],
            max_parallel: None,
            failure_threshold_percent: None,
            parallel,
            timeout: None,
            require_approval: false,
            pull_request: PullRequestConfig::default(),
            knowledge: None,
            created_at: None,
        }
    }

    /// Never reaches a terminal phase on its own; the provision call
    /// also counts itself so a test can assert on how many groups
    /// actually got as far as provisioning.
    #[derive(Clone, Default)]
    struct NeverTerminalProvider {
        provisioned: std::sync::Arc<AtomicU32>,
    }

    #[async_trait]
    impl SandboxProvider for NeverTerminalProvider {
        async fn provision(&self, task_id: &str, group_name: &str) -> Result<SandboxHandle, crate::domain::error::FleetliftError> {
            self.provisioned.fetch_add(1, Ordering::SeqCst);
            Ok(SandboxHandle(format!("{task_id}-{group_name}")))
        }
        async fn submit_manifest(
            &self,
            _sandbox: &SandboxHandle,
            _manifest: &TaskManifest,
        ) -> Result<(), crate::domain::error::FleetliftError> {
            Ok(())
        }
        async fn poll_status(&self, sandbox: &SandboxHandle) -> Result<Option<AgentStatus>, crate::domain::error::FleetliftError> {
            Ok(Some(AgentStatus::new("t1", &sandbox.0, Utc::now())))
        }
        async fn read_result(&self, sandbox: &SandboxHandle) -> Result<Vec<RepoResult>, crate::domain::error::FleetliftError> {
            Ok(vec![RepoResult::success(sandbox.0.clone())])
        }
        async fn submit_steering(
            &self,
            _sandbox: &SandboxHandle,
            _instruction: &SteeringInstruction,
        ) -> Result<(), crate::domain::error::FleetliftError> {
            Ok(())
        }
        async fn exec(
            &self,
            _sandbox: &SandboxHandle,
            _command: &str,
            _args: &[String],
        ) -> Result<ExecOutput, crate::domain::error::FleetliftError> {
            unimplemented!()
        }
        async fn exec_shell(&self, _sandbox: &SandboxHandle, _command_line: &str) -> Result<ExecOutput, crate::domain::error::FleetliftError> {
            unimplemented!()
        }
        async fn copy_to(&self, _sandbox: &SandboxHandle, _host_path: &str, _sandbox_path: &str) -> Result<(), crate::domain::error::FleetliftError> {
            Ok(())
        }
        async fn copy_from(&self, _sandbox: &SandboxHandle, _sandbox_path: &str, _host_path: &str) -> Result<(), crate::domain::error::FleetliftError> {
            Ok(())
        }
        async fn status(&self, _sandbox: &SandboxHandle) -> Result<SandboxLifecycleStatus, crate::domain::error::FleetliftError> {
            Ok(SandboxLifecycleStatus::Running)
        }
        async fn cleanup(&self, _sandbox: &SandboxHandle) -> Result<(), crate::domain::error::FleetliftError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancel_short_circuits_the_inline_single_group_path() {
        let provider = NeverTerminalProvider::default();
        let mut workflow =
            TransformWorkflow::new(provider).with_poll_interval(std::time::Duration::from_millis(5));

        let sender = workflow.signal_sender();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let _ = sender.send(SignalEnvelope::new("t1", None, Signal::Cancel));
        });

        let task = task("t1", vec![repo("widgets")], false);
        let mut log = Vec::new();
        let deadline = tokio::time::timeout(std::time::Duration::from_secs(2), workflow.run(&task, &mut log));
        let (instance, result) = deadline.await.expect("cancel must short-circuit the run, not hang");

        assert_eq!(instance.state, WorkflowState::Cancelled);
        assert_eq!(result.groups.len(), 1);
        assert_eq!(result.groups[0].outcome, GroupOutcome::Cancelled);
    }

    #[tokio::test]
    async fn cancel_stops_dispatch_of_remaining_groups_in_the_scheduled_path() {
        let provider = NeverTerminalProvider::default();
        let provisioned = provider.provisioned.clone();
        let mut workflow =
            TransformWorkflow::new(provider).with_poll_interval(std::time::Duration::from_millis(5));

        let sender = workflow.signal_sender();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let _ = sender.send(SignalEnvelope::new("t1", None, Signal::Cancel));
        });

        let mut task = task(
            "t1",
            vec![repo("widgets"), repo("gadgets"), repo("gizmos")],
            true,
        );
        task.max_parallel = Some(1);

        let mut log = Vec::new();
        let deadline = tokio::time::timeout(std::time::Duration::from_secs(2), workflow.run(&task, &mut log));
        let (instance, result) = deadline.await.expect("cancel must short-circuit the run, not hang");

        assert_eq!(instance.state, WorkflowState::Cancelled);
        assert_eq!(result.groups.len(), 3);
        assert!(result.groups.iter().any(|g| g.outcome == GroupOutcome::Cancelled));
        // Bounded to 1 at a time, so at most the in-flight group plus
        // the one that observed cancellation should ever have reached
        // provisioning; the rest were cancelled before dispatch.
        assert!(provisioned.load(Ordering::SeqCst) < 3);
    }
}
