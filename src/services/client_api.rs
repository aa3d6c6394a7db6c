//! Client API (§6.2): the operations an external caller (the worker's
//! CLI, or any other client) uses to start a run and interact with it
//! while it's in flight — start, inspect, and the five HITL signals.
//!
//! Generalized from the teacher's command-bus idiom: there, many command
//! types route to many handler types through a `CommandBus`; here there
//! is exactly one long-running thing per task (a `TransformWorkflow`), so
//! this is a direct async API over a registry of in-flight workflows
//! rather than an envelope/handler dispatch table.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::application::group_workflow::SandboxRegistry;
use crate::application::signals::{Signal, SignalEnvelope, SignalSender};
use crate::application::transform_workflow::{TransformWorkflow, WorkflowEvent, WorkflowStore};
use crate::domain::models::result::{DiffEntry, VerifierResult};
use crate::domain::models::steering::{SteeringAction, SteeringInstruction, SteeringState};
use crate::domain::models::task::Task;
use crate::domain::models::workflow::{WorkflowInstance, WorkflowState};
use crate::domain::ports::SandboxProvider;

/// Failure modes specific to the client API surface, distinct from the
/// engine's own `FleetliftError` (those describe why a *workflow*
/// failed; these describe why a *client request* couldn't be served).
#[derive(Debug, Error)]
pub enum ClientApiError {
    #[error("no workflow found for task `{0}`")]
    NotFound(String),
    #[error("group `{group}` on task `{task}` has no sandbox currently provisioned to steer")]
    NoActiveSandbox { task: String, group: String },
    #[error("failed to queue signal: the workflow is no longer accepting signals")]
    SignalDeliveryFailed,
    #[error(transparent)]
    Engine(#[from] crate::domain::error::FleetliftError),
}

struct ActiveWorkflow {
    signal_sender: SignalSender,
    sandbox_registry: SandboxRegistry,
    live: Arc<Mutex<WorkflowInstance>>,
}

/// Entry point for every client-facing operation (§6.2). One instance is
/// shared (behind an `Arc`) across however many requests the worker's
/// transport (CLI, RPC, whatever) is handling concurrently.
pub struct ClientApi<P: SandboxProvider + Clone + 'static, S: WorkflowStore + 'static> {
    provider: P,
    store: Arc<S>,
    active: Arc<Mutex<HashMap<String, ActiveWorkflow>>>,
    knowledge_store: Option<Arc<dyn crate::domain::ports::KnowledgeStore>>,
}

impl<P: SandboxProvider + Clone + 'static, S: WorkflowStore + 'static> ClientApi<P, S> {
    pub fn new(provider: P, store: Arc<S>) -> Self {
        Self {
            provider,
            store,
            active: Arc::new(Mutex::new(HashMap::new())),
            knowledge_store: None,
        }
    }

    /// Attach a `KnowledgeStore` so every workflow this API starts
    /// offers the continual-learning hooks (§4.6) against it.
    #[must_use]
    pub fn with_knowledge_store(mut self, store: Arc<dyn crate::domain::ports::KnowledgeStore>) -> Self {
        self.knowledge_store = Some(store);
        self
    }

    /// `StartTransform` (§6.2): validate and launch a task, returning its
    /// generated workflow id (`transform-{task.id}-{unix_seconds}`) as
    /// soon as the workflow is registered, rather than waiting for it to
    /// finish. The caller polls `get_status`/`get_result` for progress.
    pub async fn start_transform(&self, task: Task) -> Result<String, ClientApiError> {
        let workflow_id = format!("transform-{}-{}", task.id, Utc::now().timestamp());
        let mut workflow = TransformWorkflow::new(self.provider.clone());
        if let Some(store) = &self.knowledge_store {
            workflow = workflow.with_knowledge_store(store.clone());
        }
        let signal_sender = workflow.signal_sender();
        let sandbox_registry = workflow.sandbox_registry();

        let initial = WorkflowInstance::new(task.id.clone(), 0, Utc::now());
        let live = Arc::new(Mutex::new(initial));

        self.active.lock().await.insert(
            task.id.clone(),
            ActiveWorkflow {
                signal_sender,
                sandbox_registry,
                live: live.clone(),
            },
        );

        let store = self.store.clone();
        let active = self.active.clone();
        let task_id = task.id.clone();

        tokio::spawn(async move {
            let mut log: Vec<WorkflowEvent> = Vec::new();
            let (mut instance, _result) = workflow.run(&task, &mut log).await;

            // `workflow.run`'s own snapshot has no visibility into the
            // steering instructions this API relayed straight to the
            // sandbox mid-run (`steer_sandbox` appends to `live`
            // directly); fold that history in before it's overwritten so
            // a final `GetSteeringState` query still sees it (§3.7).
            {
                let prior = live.lock().await;
                if instance.steering.is_empty() && !prior.steering.is_empty() {
                    instance.steering = prior.steering.clone();
                }
            }

            *live.lock().await = instance.clone();
            if let Err(err) = store.save(&instance, &log).await {
                warn!(task_id = %task_id, error = %err, "failed to persist completed workflow");
            }
            active.lock().await.remove(&task_id);
        });

        Ok(workflow_id)
    }

    /// `GetStatus` (§6.2): the current workflow state, preferring the
    /// in-memory snapshot of a still-running workflow over the last
    /// persisted one.
    pub async fn get_status(&self, task_id: &str) -> Result<WorkflowState, ClientApiError> {
        Ok(self.instance_snapshot(task_id).await?.state)
    }

    /// `GetResult` (§6.2): the terminal `TaskResult`, if the workflow has
    /// produced one yet.
    pub async fn get_result(&self, task_id: &str) -> Result<Option<crate::domain::models::result::TaskResult>, ClientApiError> {
        Ok(self.instance_snapshot(task_id).await?.result)
    }

    /// `GetDiff` (§6.2): every changed-file entry across every group and
    /// repo, optionally narrowed to one repo.
    pub async fn get_diff(&self, task_id: &str, repo_name: Option<&str>) -> Result<Vec<DiffEntry>, ClientApiError> {
        let instance = self.instance_snapshot(task_id).await?;
        let Some(result) = instance.result else {
            return Ok(Vec::new());
        };
        Ok(result
            .groups
            .iter()
            .flat_map(|g| g.repos.iter())
            .filter(|r| repo_name.is_none_or(|name| r.repo_name == name))
            .flat_map(|r| r.diff.clone())
            .collect())
    }

    /// `GetVerifierLogs` (§6.2): every verifier outcome, optionally
    /// narrowed to one repo.
    pub async fn get_verifier_logs(&self, task_id: &str, repo_name: Option<&str>) -> Result<Vec<VerifierResult>, ClientApiError> {
        let instance = self.instance_snapshot(task_id).await?;
        let Some(result) = instance.result else {
            return Ok(Vec::new());
        };
        Ok(result
            .groups
            .iter()
            .flat_map(|g| g.repos.iter())
            .filter(|r| repo_name.is_none_or(|name| r.repo_name == name))
            .flat_map(|r| r.verifiers.clone())
            .collect())
    }

    /// `GetSteeringState` (§6.2): the HITL steering history for one
    /// group, if it has ever entered the approval gate.
    pub async fn get_steering_state(&self, task_id: &str, group_name: &str) -> Result<Option<SteeringState>, ClientApiError> {
        let instance = self.instance_snapshot(task_id).await?;
        Ok(instance.steering.into_iter().find(|s| s.group_name == group_name))
    }

    /// `GetExecutionProgress` (§6.2): the aggregate group-completion
    /// snapshot (§3.7).
    pub async fn get_execution_progress(&self, task_id: &str) -> Result<crate::domain::models::progress::ExecutionProgress, ClientApiError> {
        Ok(self.instance_snapshot(task_id).await?.progress)
    }

    /// `ListWorkflows` (§6.2): in-flight tasks by id and state, narrowed
    /// to `status_filter` when given and capped at `limit` entries (this
    /// engine keeps every active workflow in memory, so pagination is
    /// just a truncation rather than an opaque cursor). `status_filter`
    /// matches against this engine's own `WorkflowState`, which only
    /// distinguishes the states a task can actually be in here — the
    /// spec's `Terminated`/`TimedOut` filters describe durable-runtime
    /// states this crate doesn't separately model (see §1 Non-goals).
    pub async fn list_workflows(&self, status_filter: Option<WorkflowState>, limit: Option<usize>) -> Vec<(String, WorkflowState)> {
        let active = self.active.lock().await;
        let mut out = Vec::with_capacity(active.len());
        for (task_id, workflow) in active.iter() {
            let state = workflow.live.lock().await.state;
            if status_filter.is_some_and(|wanted| wanted != state) {
                continue;
            }
            out.push((task_id.clone(), state));
        }
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        out
    }

    /// `Approve` (§6.2): release a group's approval gate, relayed
    /// straight to its sandbox's steering file (§4.5) since approval is
    /// transparent to the scheduler-level signal queue.
    pub async fn approve(&self, task_id: &str, group_name: &str) -> Result<(), ClientApiError> {
        self.steer_sandbox(task_id, group_name, SteeringAction::Approve).await
    }

    /// `Reject` (§6.2): fail a group's approval gate with an optional
    /// reason.
    pub async fn reject(&self, task_id: &str, group_name: &str, reason: Option<String>) -> Result<(), ClientApiError> {
        self.steer_sandbox(task_id, group_name, SteeringAction::Reject { reason }).await
    }

    /// `Steer` (§6.2): redirect a group's in-progress execution with a
    /// follow-up prompt.
    pub async fn steer(&self, task_id: &str, group_name: &str, prompt: String) -> Result<(), ClientApiError> {
        self.steer_sandbox(task_id, group_name, SteeringAction::Steer { prompt }).await
    }

    /// `Cancel` (§6.2): cancel the whole task. Queued through the
    /// workflow's signal channel since it's consumed at the transform
    /// workflow level, not per-sandbox.
    pub async fn cancel(&self, task_id: &str) -> Result<(), ClientApiError> {
        let active = self.active.lock().await;
        let workflow = active.get(task_id).ok_or_else(|| ClientApiError::NotFound(task_id.to_string()))?;
        info!(task_id, "client requested cancellation");
        workflow
            .signal_sender
            .send(SignalEnvelope::new(task_id, None, Signal::Cancel))
            .map_err(|_| ClientApiError::SignalDeliveryFailed)?;
        Ok(())
    }

    /// `Continue` (§6.2): resume (or skip the remainder of) a scheduler
    /// pause triggered by a failure-threshold breach (§4.2).
    pub async fn r#continue(&self, task_id: &str, skip_remaining: bool) -> Result<(), ClientApiError> {
        let active = self.active.lock().await;
        let workflow = active.get(task_id).ok_or_else(|| ClientApiError::NotFound(task_id.to_string()))?;
        info!(task_id, skip_remaining, "client requested scheduler continue");
        workflow
            .signal_sender
            .send(SignalEnvelope::new(task_id, None, Signal::Continue { skip_remaining }))
            .map_err(|_| ClientApiError::SignalDeliveryFailed)?;
        Ok(())
    }

    async fn steer_sandbox(&self, task_id: &str, group_name: &str, action: SteeringAction) -> Result<(), ClientApiError> {
        let (sandbox_registry, live) = {
            let active = self.active.lock().await;
            let workflow = active.get(task_id).ok_or_else(|| ClientApiError::NotFound(task_id.to_string()))?;
            (workflow.sandbox_registry.clone(), workflow.live.clone())
        };

        let key = format!("{task_id}:{group_name}");
        let sandbox = sandbox_registry
            .lock()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| ClientApiError::NoActiveSandbox {
                task: task_id.to_string(),
                group: group_name.to_string(),
            })?;

        let instruction = SteeringInstruction {
            id: Uuid::new_v4().to_string(),
            action,
            issued_at: Utc::now(),
        };
        info!(task_id, group_name, "relaying steering instruction to sandbox");
        self.provider.submit_steering(&sandbox, &instruction).await?;

        // Append-only steering log (§9 "Steering history as append-only"):
        // record every instruction relayed to a sandbox, regardless of
        // its kind, so `GetSteeringState` and knowledge capture (§4.6)
        // have a durable record independent of the agent's own report.
        let mut instance = live.lock().await;
        if !instance.steering.iter().any(|s| s.group_name == group_name) {
            instance.steering.push(SteeringState::new(
                task_id,
                group_name,
                crate::domain::models::manifest::DEFAULT_MAX_STEERING_ITERATIONS,
            ));
        }
        let state = instance
            .steering
            .iter_mut()
            .find(|s| s.group_name == group_name)
            .expect("just ensured present");
        state.record(instruction, Utc::now());
        Ok(())
    }

    async fn instance_snapshot(&self, task_id: &str) -> Result<WorkflowInstance, ClientApiError> {
        if let Some(workflow) = self.active.lock().await.get(task_id) {
            return Ok(workflow.live.lock().await.clone());
        }
        self.store
            .load(task_id)
            .await?
            .ok_or_else(|| ClientApiError::NotFound(task_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::FleetliftError;
    use crate::domain::models::manifest::TaskManifest;
    use crate::domain::models::result::RepoResult;
    use crate::domain::models::status::AgentStatus;
    use crate::domain::models::task::{ExecutionSpec, PullRequestConfig, RepositorySpec, TaskMode};
    use crate::domain::ports::{ExecOutput, SandboxHandle, SandboxLifecycleStatus};
    use async_trait::async_trait;

    #[derive(Clone)]
    struct ImmediateSuccessProvider;

    #[async_trait]
    impl SandboxProvider for ImmediateSuccessProvider {
        async fn provision(&self, task_id: &str, group_name: &str) -> Result<SandboxHandle, FleetliftError> {
            Ok(SandboxHandle(format!("{task_id}-{group_name}")))
        }
        async fn submit_manifest(&self, _sandbox: &SandboxHandle, _manifest: &TaskManifest) -> Result<(), FleetliftError> {
            Ok(())
        }
        async fn poll_status(&self, sandbox: &SandboxHandle) -> Result<Option<AgentStatus>, FleetliftError> {
            let mut status = AgentStatus::new("t", &sandbox.0, Utc::now());
            status.transition(crate::domain::models::status::AgentPhase::Succeeded, None, Utc::now());
            Ok(Some(status))
        }
        async fn read_result(&self, sandbox: &SandboxHandle) -> Result<Vec<RepoResult>, FleetliftError> {
            Ok(vec![RepoResult::success(sandbox.0.clone())])
        }
        async fn submit_steering(&self, _sandbox: &SandboxHandle, _instruction: &SteeringInstruction) -> Result<(), FleetliftError> {
            Ok(())
        }
        async fn exec(&self, _sandbox: &SandboxHandle, _command: &str, _args: &[String]) -> Result<ExecOutput, FleetliftError> {
            unimplemented!()
        }
        async fn exec_shell(&self, _sandbox: &SandboxHandle, _command_line: &str) -> Result<ExecOutput, FleetliftError> {
            unimplemented!()
        }
        async fn copy_to(&self, _sandbox: &SandboxHandle, _host_path: &str, _sandbox_path: &str) -> Result<(), FleetliftError> {
            Ok(())
        }
        async fn copy_from(&self, _sandbox: &SandboxHandle, _sandbox_path: &str, _host_path: &str) -> Result<(), FleetliftError> {
            Ok(())
        }
        async fn status(&self, _sandbox: &SandboxHandle) -> Result<SandboxLifecycleStatus, FleetliftError> {
            Ok(SandboxLifecycleStatus::Exited(0))
        }
        async fn cleanup(&self, _sandbox: &SandboxHandle) -> Result<(), FleetliftError> {
            Ok(())
        }
    }

    struct InMemoryStore(Mutex<HashMap<String, (WorkflowInstance, Vec<WorkflowEvent>)>>);

    #[async_trait::async_trait]
    impl WorkflowStore for InMemoryStore {
        async fn save(&self, instance: &WorkflowInstance, new_events: &[WorkflowEvent]) -> Result<(), FleetliftError> {
            self.0
                .lock()
                .await
                .insert(instance.task_id.clone(), (instance.clone(), new_events.to_vec()));
            Ok(())
        }
        async fn load(&self, task_id: &str) -> Result<Option<WorkflowInstance>, FleetliftError> {
            Ok(self.0.lock().await.get(task_id).map(|(i, _)| i.clone()))
        }
        async fn load_events(&self, task_id: &str) -> Result<Vec<WorkflowEvent>, FleetliftError> {
            Ok(self.0.lock().await.get(task_id).map(|(_, e)| e.clone()).unwrap_or_default())
        }
    }

    fn task(id: &str) -> Task {
        Task {
            version: "1".into(),
            id: id.into(),
            title: "Demo".into(),
            mode: TaskMode::Transform,
            repositories: vec![RepositorySpec {
                url: "https://github.com/acme/widgets.git".into(),
                branch: None,
                name: None,
                setup: vec![],
            }],
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
            parallel: false,
            timeout: None,
            require_approval: false,
            pull_request: PullRequestConfig::default(),
            knowledge: None,
            created_at: None,
        }
    }

    #[tokio::test]
    async fn start_transform_runs_to_completion_and_becomes_queryable() {
        let store = Arc::new(InMemoryStore(Mutex::new(HashMap::new())));
        let api = ClientApi::new(ImmediateSuccessProvider, store);

        let workflow_id = api.start_transform(task("t1")).await.unwrap();
        assert!(workflow_id.starts_with("transform-t1-"));

        let mut state = api.get_status("t1").await.unwrap();
        for _ in 0..50 {
            if state == WorkflowState::Completed {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            state = api.get_status("t1").await.unwrap();
        }
        assert_eq!(state, WorkflowState::Completed);

        let result = api.get_result("t1").await.unwrap();
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn list_workflows_honors_status_filter_and_limit() {
        let store = Arc::new(InMemoryStore(Mutex::new(HashMap::new())));
        let api = ClientApi::new(ImmediateSuccessProvider, store);

        api.start_transform(task("t3")).await.unwrap();
        api.start_transform(task("t4")).await.unwrap();

        let all = api.list_workflows(None, None).await;
        assert_eq!(all.len(), 2);

        let limited = api.list_workflows(None, Some(1)).await;
        assert_eq!(limited.len(), 1);

        // Neither workflow will be in `Cancelled` state, so filtering on
        // it should always come back empty regardless of timing.
        let filtered = api.list_workflows(Some(WorkflowState::Cancelled), None).await;
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn get_status_for_unknown_task_is_not_found() {
        let store = Arc::new(InMemoryStore(Mutex::new(HashMap::new())));
        let api = ClientApi::new(ImmediateSuccessProvider, store);
        let err = api.get_status("nope").await.unwrap_err();
        assert!(matches!(err, ClientApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn approve_without_a_provisioned_sandbox_is_rejected() {
        let store = Arc::new(InMemoryStore(Mutex::new(HashMap::new())));
        let api = ClientApi::new(ImmediateSuccessProvider, store);
        api.start_transform(task("t2")).await.unwrap();
        // Give the group workflow a moment to provision and finish so
        // the registry entry is removed again, exercising the
        // no-longer-active path deterministically.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let err = api.approve("t2", "all").await;
        assert!(err.is_err());
    }
}
