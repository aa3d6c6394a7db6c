//! Group workflow (§4.3): provisions exactly one sandbox, drives the
//! manifest/status/result exchange, and applies the approval gate before
//! PR creation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::application::activity::{ActivityRunner, Heartbeat, HeartbeatTimeout, RetryPolicy};
use crate::application::signals::CancelToken;
use crate::domain::error::FleetliftError;
use crate::domain::models::manifest::TaskManifest;
use crate::domain::models::result::{GroupOutcome, GroupResult, RepoResult};
use crate::domain::models::status::AgentPhase;
use crate::domain::ports::{SandboxHandle, SandboxProvider};

/// Shared directory of the sandbox currently backing each in-flight
/// `(task_id, group_name)`, keyed by `"{task_id}:{group_name}"`. Lets a
/// client API layer relay HITL steering straight to the provider without
/// the transform workflow itself needing to understand steering content
/// (§4.5: the agent's approval gate is transparent to `GroupWorkflow`).
pub type SandboxRegistry = Arc<Mutex<HashMap<String, SandboxHandle>>>;

fn registry_key(task_id: &str, group_name: &str) -> String {
    format!("{task_id}:{group_name}")
}

/// Input to a single group's execution (§4.3 Contract).
pub struct GroupWorkflowInput<'a> {
    pub task_id: String,
    pub group_name: String,
    pub repo_names: Vec<String>,
    pub manifest: &'a TaskManifest,
}

/// Runs one group workflow to completion against a sandbox provider.
/// Owns exactly one sandbox for its lifetime (§4.3: "Owns exactly one
/// sandbox"), and always calls `cleanup` on every exit path regardless
/// of outcome (§4.1 Cleanup, §8 testable property 7).
///
/// Cheap to clone (the provider is expected to be a cheaply-cloneable
/// handle, e.g. `Arc`-backed) so the scheduler can hand one copy to each
/// concurrently-spawned group task.
#[derive(Clone)]
pub struct GroupWorkflow<P: SandboxProvider + Clone> {
    provider: P,
    registry: SandboxRegistry,
    poll_interval: std::time::Duration,
}

impl<P: SandboxProvider + Clone> GroupWorkflow<P> {
    pub fn new(provider: P, registry: SandboxRegistry) -> Self {
        Self {
            provider,
            registry,
            poll_interval: std::time::Duration::from_millis(500),
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: std::time::Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub async fn run(&self, input: GroupWorkflowInput<'_>, cancel: &CancelToken) -> GroupResult {
        let started_at = chrono::Utc::now();

        if cancel.is_cancelled() {
            return self.cancelled_group(input, started_at);
        }

        let runner = ActivityRunner::new(RetryPolicy::default());

        let sandbox = match runner
            .run("provision", || self.provider.provision(&input.task_id, &input.group_name))
            .await
        {
            Ok(sandbox) => sandbox,
            Err(err) => {
                return self.failed_group(&input, started_at, &err);
            }
        };

        let key = registry_key(&input.task_id, &input.group_name);
        self.registry.lock().await.insert(key.clone(), sandbox.clone());

        let outcome = self.drive(&input, &sandbox, &runner, cancel).await;

        self.registry.lock().await.remove(&key);

        // Cleanup always runs, independent of how `drive` concluded —
        // including a cancellation — so a sandbox can never be leaked
        // by a cancelled group (§4.1 Cleanup, §8 testable property 7).
        if let Err(err) = self.provider.cleanup(&sandbox).await {
            warn!(group = %input.group_name, error = %err, "sandbox cleanup failed");
        }

        let finished_at = chrono::Utc::now();
        match outcome {
            Ok(repos) => GroupResult {
                group_name: input.group_name,
                outcome: if repos.iter().all(|r| r.succeeded) {
                    GroupOutcome::Succeeded
                } else {
                    GroupOutcome::Failed
                },
                repos,
                started_at,
                finished_at,
            },
            Err(FleetliftError::Cancelled) => GroupResult {
                group_name: input.group_name,
                outcome: GroupOutcome::Cancelled,
                repos: Vec::new(),
                started_at,
                finished_at,
            },
            Err(err) => self.failed_group(&input, started_at, &err),
        }
    }

    fn cancelled_group(&self, input: GroupWorkflowInput<'_>, started_at: chrono::DateTime<chrono::Utc>) -> GroupResult {
        info!(group = %input.group_name, "group cancelled before it could be provisioned");
        GroupResult {
            group_name: input.group_name,
            outcome: GroupOutcome::Cancelled,
            repos: Vec::new(),
            started_at,
            finished_at: chrono::Utc::now(),
        }
    }

    fn failed_group(
        &self,
        input: &GroupWorkflowInput<'_>,
        started_at: chrono::DateTime<chrono::Utc>,
        err: &FleetliftError,
    ) -> GroupResult {
        warn!(group = %input.group_name, error = %err, "group failed");
        let repos = input
            .repo_names
            .iter()
            .map(|name| RepoResult::failure(name.clone(), err))
            .collect();
        GroupResult {
            group_name: input.group_name.clone(),
            outcome: GroupOutcome::Failed,
            repos,
            started_at,
            finished_at: chrono::Utc::now(),
        }
    }

    /// Submit the manifest, poll status to a terminal phase, then read
    /// the result. The approval gate (if `manifest.require_approval`) is
    /// transparent to this method: the agent itself holds in
    /// `awaiting_approval` until a signal relayed via
    /// `submit_steering` releases it (§4.4 step 6, §4.5).
    async fn drive(
        &self,
        input: &GroupWorkflowInput<'_>,
        sandbox: &crate::domain::ports::SandboxHandle,
        runner: &ActivityRunner,
        cancel: &CancelToken,
    ) -> Result<Vec<RepoResult>, FleetliftError> {
        if cancel.is_cancelled() {
            return Err(FleetliftError::Cancelled);
        }
        runner
            .run("submit_manifest", || self.provider.submit_manifest(sandbox, input.manifest))
            .await?;

        let heartbeat = Heartbeat::new();
        runner
            .run_with_heartbeat("run_and_verify", HeartbeatTimeout::default(), &heartbeat, || {
                self.poll_until_terminal(sandbox, &heartbeat, cancel)
            })
            .await?;

        let repos = self.provider.read_result(sandbox).await?;
        Ok(repos)
    }

    async fn poll_until_terminal(
        &self,
        sandbox: &crate::domain::ports::SandboxHandle,
        heartbeat: &Heartbeat,
        cancel: &CancelToken,
    ) -> Result<(), FleetliftError> {
        loop {
            match self.provider.poll_status(sandbox).await? {
                Some(status) if status.phase.is_terminal() => {
                    info!(phase = ?status.phase, "group reached terminal phase");
                    return Ok(());
                }
                Some(status) => {
                    if status.phase == AgentPhase::AwaitingApproval {
                        info!("group awaiting approval");
                    }
                }
                None => {
                    // Not yet written (agent still initializing) or
                    // vanished transiently between polls.
                }
            }
            // Every poll that got an answer from the provider is a sign
            // of life, including a long but healthy `awaiting_approval`
            // wait — reset the idle deadline rather than letting it run
            // out from under a HITL pause.
            heartbeat.beat();

            // Check for cancellation at the same cadence as the poll
            // loop itself, rather than only after the group reaches a
            // terminal phase on its own, so a cancel request unwinds a
            // run within one poll interval (§4.1 cancel semantics).
            tokio::select! {
                () = cancel.cancelled() => return Err(FleetliftError::Cancelled),
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::domain::error::FleetliftError;
    use crate::domain::models::manifest::TaskManifest;
    use crate::domain::models::result::RepoResult;
    use crate::domain::models::status::AgentStatus;
    use crate::domain::models::steering::SteeringInstruction;
    use crate::domain::models::task::{ExecutionSpec, PullRequestConfig, RepositorySpec, Task, TaskMode};
    use crate::domain::ports::{ExecOutput, SandboxHandle, SandboxLifecycleStatus};
    use async_trait::async_trait;

    fn task() -> Task {
        Task {
            version: "1".into(),
            id: "t1".into(),
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

    /// Never reaches a terminal phase on its own, so the only way
    /// `run()` can return is via cancellation.
    #[derive(Clone, Default)]
    struct NeverTerminalProvider {
        cleaned_up: std::sync::Arc<AtomicBool>,
    }

    #[async_trait]
    impl SandboxProvider for NeverTerminalProvider {
        async fn provision(&self, task_id: &str, group_name: &str) -> Result<SandboxHandle, FleetliftError> {
            Ok(SandboxHandle(format!("{task_id}-{group_name}")))
        }
        async fn submit_manifest(&self, _sandbox: &SandboxHandle, _manifest: &TaskManifest) -> Result<(), FleetliftError> {
            Ok(())
        }
        async fn poll_status(&self, sandbox: &SandboxHandle) -> Result<Option<AgentStatus>, FleetliftError> {
            Ok(Some(AgentStatus::new("t1", &sandbox.0, chrono::Utc::now())))
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
            Ok(SandboxLifecycleStatus::Running)
        }
        async fn cleanup(&self, _sandbox: &SandboxHandle) -> Result<(), FleetliftError> {
            self.cleaned_up.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancelling_mid_run_stops_the_group_and_tears_down_its_sandbox() {
        let provider = NeverTerminalProvider::default();
        let cleaned_up = provider.cleaned_up.clone();
        let workflow = GroupWorkflow::new(provider, SandboxRegistry::default())
            .with_poll_interval(std::time::Duration::from_millis(5));

        let task = task();
        let manifest = TaskManifest::from_task_and_group(&task, "all", &["widgets".to_string()]).unwrap();
        let cancel = CancelToken::new();

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });

        let result = workflow
            .run(
                GroupWorkflowInput {
                    task_id: "t1".into(),
                    group_name: "all".into(),
                    repo_names: vec!["widgets".into()],
                    manifest: &manifest,
                },
                &cancel,
            )
            .await;

        assert_eq!(result.outcome, GroupOutcome::Cancelled);
        assert!(cleaned_up.load(Ordering::SeqCst), "cancelled group must still have its sandbox torn down");
    }

    #[tokio::test]
    async fn cancel_set_before_run_skips_provisioning_entirely() {
        let provider = NeverTerminalProvider::default();
        let workflow = GroupWorkflow::new(provider, SandboxRegistry::default());

        let task = task();
        let manifest = TaskManifest::from_task_and_group(&task, "all", &["widgets".to_string()]).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = workflow
            .run(
                GroupWorkflowInput {
                    task_id: "t1".into(),
                    group_name: "all".into(),
                    repo_names: vec!["widgets".into()],
                    manifest: &manifest,
                },
                &cancel,
            )
            .await;

        assert_eq!(result.outcome, GroupOutcome::Cancelled);
        assert!(workflow.registry.lock().await.is_empty());
    }
}
