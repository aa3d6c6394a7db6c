//! In-sandbox agent pipeline (§4.4): the process that watches for a
//! manifest, runs it to completion, and reports status/result back to
//! the worker over the control-file protocol (§6.1).
//!
//! `src/bin/fleetlift-agent.rs` is the thin binary entrypoint; this
//! module holds the actual phase sequence so it can be unit-tested
//! without a real child process tree.

pub mod clone;
pub mod collect;
pub mod execute;
pub mod process;
pub mod protocol;
pub mod pr;
pub mod shutdown;
pub mod steering;
pub mod verify;

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::agent::protocol::{poll_until_present, write_atomic, ControlPaths};
use crate::agent::shutdown::Shutdown;
use crate::domain::error::FleetliftError;
use crate::domain::models::manifest::TaskManifest;
use crate::domain::models::result::RepoResult;
use crate::domain::models::status::{AgentPhase, AgentStatus};
use crate::domain::models::steering::{SteeringAction, SteeringState};
use crate::domain::models::task::{ExecutionSpec, TaskMode};
use crate::domain::ports::PullRequestCreator;

/// Manifest-poll interval (§4.4 step 1).
const MANIFEST_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Run the full agent pipeline against the control directory at
/// `control_dir`, which defaults to `/workspace/.fleetlift` in
/// production (§6.1). Returns once a terminal status has been written.
pub async fn run(control_dir: impl AsRef<Path>, pr_creator: &dyn PullRequestCreator, shutdown: Shutdown) {
    let control = ControlPaths::new(control_dir);

    let manifest: Option<TaskManifest> = poll_until_present(&control.manifest, MANIFEST_POLL_INTERVAL, &shutdown).await;
    let Some(manifest) = manifest else {
        info!("shutdown requested before a manifest arrived, exiting");
        return;
    };

    let mut status = AgentStatus::new(manifest.task_id.as_str(), manifest.group_name.as_str(), Utc::now());
    if let Err(err) = manifest.validate() {
        let err: FleetliftError = err.into();
        fail(&control, &mut status, &err).await;
        return;
    }

    let home_dir = home_dir();
    if let Err(err) = run_pipeline(&manifest, &control, &home_dir, &mut status, pr_creator, &shutdown).await {
        fail(&control, &mut status, &err).await;
    }
}

fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| "/root".to_string())
}

async fn run_pipeline(
    manifest: &TaskManifest,
    control: &ControlPaths,
    home_dir: &str,
    status: &mut AgentStatus,
    pr_creator: &dyn PullRequestCreator,
    shutdown: &Shutdown,
) -> Result<(), FleetliftError> {
    transition(control, status, AgentPhase::Cloning, None).await;
    clone::configure_git(&manifest.git_identity, Path::new(home_dir), shutdown).await?;
    for repo in &manifest.repositories {
        transition(control, status, AgentPhase::Cloning, Some(format!("cloning {}", repo.name))).await;
        clone::clone_and_setup(manifest, repo, shutdown).await?;
        let workspace_path = manifest.workspace_path(repo);
        clone::write_agents_md(manifest, Path::new(&workspace_path)).await?;
    }

    transition(control, status, AgentPhase::Running, None).await;
    execute::run_execution(manifest, None, shutdown).await?;

    transition(control, status, AgentPhase::Verifying, None).await;
    let mut repo_results = collect_repo_results(manifest, shutdown).await?;

    let require_approval = manifest.mode == TaskMode::Transform && manifest.require_approval;
    if require_approval {
        transition(control, status, AgentPhase::AwaitingApproval, None).await;
        write_atomic(&control.result, &repo_results).await?;

        let mut steering_state = SteeringState::new(manifest.task_id.as_str(), manifest.group_name.as_str(), manifest.max_steering_iterations);
        match run_steering_loop(manifest, control, status, &mut steering_state, &mut repo_results, shutdown).await? {
            SteeringOutcome::Approved => {}
            SteeringOutcome::Cancelled => {
                transition(control, status, AgentPhase::Cancelled, Some("steering rejected or cancelled".into())).await;
                write_atomic(&control.result, &repo_results).await?;
                return Ok(());
            }
        }
    }

    if manifest.mode == TaskMode::Transform {
        transition(control, status, AgentPhase::CreatingPr, None).await;
        create_pull_requests(manifest, &mut repo_results, pr_creator, shutdown).await;
    }

    transition(control, status, AgentPhase::Succeeded, None).await;
    write_atomic(&control.result, &repo_results).await?;
    Ok(())
}

enum SteeringOutcome {
    Approved,
    Cancelled,
}

/// Drive the HITL loop (§4.5) until `approve`, `reject`, or `cancel` is
/// seen, re-running execute/verify/collect on every valid `steer`.
/// `continue` is treated the same as `approve` here: by the time the
/// agent is awaiting input the verifiers have already run once, so
/// there's nothing left to skip.
async fn run_steering_loop(
    manifest: &TaskManifest,
    control: &ControlPaths,
    status: &mut AgentStatus,
    steering_state: &mut SteeringState,
    repo_results: &mut Vec<RepoResult>,
    shutdown: &Shutdown,
) -> Result<SteeringOutcome, FleetliftError> {
    let original_prompt = match &manifest.execution {
        ExecutionSpec::Agentic { prompt, .. } => prompt.clone(),
        ExecutionSpec::Deterministic { .. } => String::new(),
    };
    let mut previous_output = String::new();

    loop {
        let Some(instruction) = steering::await_steering_instruction(&control.steering, shutdown).await else {
            return Ok(SteeringOutcome::Cancelled);
        };

        match instruction.action.clone() {
            SteeringAction::Approve => return Ok(SteeringOutcome::Approved),
            SteeringAction::Continue { .. } => return Ok(SteeringOutcome::Approved),
            SteeringAction::Reject { reason } => {
                if let Some(reason) = reason {
                    warn!(reason = %reason, "steering rejected");
                }
                return Ok(SteeringOutcome::Cancelled);
            }
            SteeringAction::Cancel => return Ok(SteeringOutcome::Cancelled),
            SteeringAction::Steer { prompt } => {
                if steering_state.exhausted() {
                    warn!("max steering iterations exhausted, ignoring further steer instructions");
                    continue;
                }
                steering_state.record(instruction.clone(), Utc::now());
                status.steering_iteration = steering_state.iterations_used;

                let rerun_prompt = steering::build_steering_prompt(&original_prompt, steering_state.iterations_used, &prompt, &previous_output);
                let workdir = manifest.repositories.first().map(|r| manifest.workspace_path(r));
                let output = execute::invoke_agent_binary(&rerun_prompt, workdir.as_deref(), shutdown).await?;
                previous_output = format!("{}{}", output.stdout, output.stderr);

                transition(control, status, AgentPhase::Verifying, Some("re-verifying after steering".into())).await;
                *repo_results = collect_repo_results(manifest, shutdown).await?;

                transition(control, status, AgentPhase::AwaitingApproval, None).await;
                write_atomic(&control.result, repo_results).await?;
            }
        }
    }
}

async fn collect_repo_results(manifest: &TaskManifest, shutdown: &Shutdown) -> Result<Vec<RepoResult>, FleetliftError> {
    let mut results = Vec::with_capacity(manifest.repositories.len());
    for repo in &manifest.repositories {
        let repo_dir = manifest.workspace_path(repo);
        let verifiers = verify::run_verifiers(manifest.execution.verifiers(), &repo_dir, shutdown).await?;
        let succeeded = verifiers.is_empty() || verify::all_passed(&verifiers);

        let mut result = RepoResult {
            repo_name: repo.name.clone(),
            succeeded,
            diff: Vec::new(),
            verifiers,
            report: None,
            for_each: Vec::new(),
            pull_request: None,
            error: None,
        };

        match manifest.mode {
            TaskMode::Transform => {
                result.diff = collect::collect_diff(&repo_dir, shutdown).await?;
            }
            TaskMode::Report => {
                if manifest.for_each.is_empty() {
                    match collect::read_report(&repo_dir, None).await {
                        Ok(report) => result.report = Some(report),
                        Err(err) => result.error = Some(err.to_string()),
                    }
                } else {
                    for target in &manifest.for_each {
                        let outcome = collect::read_report(&repo_dir, Some(&target.name)).await;
                        result.for_each.push(crate::domain::models::result::ForEachResult {
                            name: target.name.clone(),
                            report: outcome.as_ref().ok().cloned(),
                            error: outcome.err().map(|e| e.to_string()),
                        });
                    }
                }
            }
        }

        results.push(result);
    }
    Ok(results)
}

async fn create_pull_requests(manifest: &TaskManifest, repo_results: &mut [RepoResult], pr_creator: &dyn PullRequestCreator, shutdown: &Shutdown) {
    for (repo, result) in manifest.repositories.iter().zip(repo_results.iter_mut()) {
        if result.diff.is_empty() || !result.succeeded {
            continue;
        }
        match pr::create_pull_request(manifest, repo, &repo.url, pr_creator, shutdown).await {
            Ok(pr_info) => result.pull_request = Some(pr_info),
            Err(err) => {
                error!(repo = %repo.name, error = %err, "pull request creation failed");
                result.error = Some(err.to_string());
            }
        }
    }
}

async fn transition(control: &ControlPaths, status: &mut AgentStatus, phase: AgentPhase, message: Option<String>) {
    status.transition(phase, message, Utc::now());
    info!(phase = ?phase, "agent pipeline phase transition");
    if let Err(err) = write_atomic(&control.status, status).await {
        warn!(error = %err, "failed to write status document");
    }
}

async fn fail(control: &ControlPaths, status: &mut AgentStatus, err: &FleetliftError) {
    error!(error = %err, "agent pipeline failed");
    status.transition(AgentPhase::Failed, Some(err.to_string()), Utc::now());
    let _ = write_atomic(&control.status, status).await;
    let result = vec![RepoResult::failure(status.group_name.clone(), err)];
    let _ = write_atomic(&control.result, &result).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::task::VerifierSpec;

    #[tokio::test]
    async fn verifiers_gate_repo_success() {
        let shutdown = Shutdown::new();
        let passing = VerifierSpec {
            name: "ok".into(),
            command: "exit 0".into(),
            args: vec![],
        };
        let results = verify::run_verifiers(&[passing], "/tmp", &shutdown).await.unwrap();
        assert!(verify::all_passed(&results));

        let failing = VerifierSpec {
            name: "bad".into(),
            command: "exit 1".into(),
            args: vec![],
        };
        let results = verify::run_verifiers(&[failing], "/tmp", &shutdown).await.unwrap();
        assert!(!verify::all_passed(&results));
    }

    #[tokio::test]
    async fn fail_writes_terminal_failed_status_and_error_result() {
        let tmp = tempfile::tempdir().unwrap();
        let control = ControlPaths::new(tmp.path());
        let mut status = AgentStatus::new("t1", "g1", Utc::now());

        fail(&control, &mut status, &FleetliftError::Cancelled).await;

        let written_status: AgentStatus = crate::agent::protocol::read_if_present(&control.status).await.unwrap().unwrap();
        assert_eq!(written_status.phase, AgentPhase::Failed);

        let written_result: Vec<RepoResult> = crate::agent::protocol::read_if_present(&control.result).await.unwrap().unwrap();
        assert_eq!(written_result.len(), 1);
        assert!(!written_result[0].succeeded);
        assert_eq!(written_result[0].repo_name, "g1");
    }
}
