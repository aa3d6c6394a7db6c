//! Creating-PRs phase (§4.4 step 7): branch, secrets-safe staging,
//! commit, push, and handing off to the (out-of-scope) PR-creation tool.

use tokio::process::Command;
use tracing::info;

use crate::agent::process::run_to_completion;
use crate::agent::shutdown::Shutdown;
use crate::domain::error::{FleetliftError, PrError};
use crate::domain::models::manifest::{EffectiveRepo, TaskManifest};
use crate::domain::models::result::PullRequestInfo;
use crate::domain::models::task::PullRequestConfig;
use crate::domain::ports::PullRequestCreator;

/// Secrets deny-list appended to `.gitignore` before `git add -A`
/// (§4.4 step 7) so a transformation cannot accidentally stage
/// credentials it introduced.
const SECRETS_DENY_LIST: &[&str] = &[".env", ".env.*", "*.key", "*.pem", "credentials*", ".git-credentials", "*.secret"];

/// The branch name for one repo's PR (§4.4 step 7).
pub fn branch_name(config: &PullRequestConfig, task_id: &str, repo_name: &str) -> String {
    let prefix = config.branch_prefix.clone().unwrap_or_else(|| format!("auto/{task_id}"));
    format!("{prefix}-{repo_name}")
}

/// Create a branch, stage the repo's changes behind a secrets-safe
/// `.gitignore`, commit, push, then hand off to `creator` for the
/// actual PR/issue creation.
pub async fn create_pull_request(
    manifest: &TaskManifest,
    repo: &EffectiveRepo,
    repo_url: &str,
    creator: &dyn PullRequestCreator,
    shutdown: &Shutdown,
) -> Result<PullRequestInfo, FleetliftError> {
    let repo_dir = manifest.workspace_path(repo);
    create_pull_request_in(
        &repo_dir,
        &manifest.pull_request,
        &manifest.task_id,
        &manifest.title,
        &repo.name,
        repo_url,
        creator,
        shutdown,
    )
    .await
}

/// The actual branch/stage/commit/push/hand-off sequence, parameterized
/// on the repo's working directory so it can be exercised against a
/// temporary repo in tests rather than the hardcoded `/workspace` layout
/// `create_pull_request` resolves for real runs.
#[allow(clippy::too_many_arguments)]
async fn create_pull_request_in(
    repo_dir: &str,
    config: &PullRequestConfig,
    task_id: &str,
    task_title: &str,
    repo_name: &str,
    repo_url: &str,
    creator: &dyn PullRequestCreator,
    shutdown: &Shutdown,
) -> Result<PullRequestInfo, FleetliftError> {
    let branch = branch_name(config, task_id, repo_name);

    run_git(&["checkout", "-b", &branch], repo_dir, shutdown).await?;

    let original_gitignore = tokio::fs::read_to_string(format!("{repo_dir}/.gitignore")).await.ok();
    append_secrets_denylist(repo_dir, original_gitignore.as_deref()).await?;
    run_git(&["add", "-A"], repo_dir, shutdown).await?;

    // Restore the repo to its pre-transformation `.gitignore` state so
    // none of this engine's secrets-denylist scaffolding leaks into the
    // committed tree (§8 property 9). When the repo had no `.gitignore`
    // of its own, that means removing the one we just wrote, not leaving
    // it behind for `git add` to pick back up.
    match &original_gitignore {
        Some(original) => {
            tokio::fs::write(format!("{repo_dir}/.gitignore"), original)
                .await
                .map_err(|e| PrError::ToolFailed(e.to_string()))?;
            run_git(&["add", ".gitignore"], repo_dir, shutdown).await?;
        }
        None => {
            tokio::fs::remove_file(format!("{repo_dir}/.gitignore"))
                .await
                .map_err(|e| PrError::ToolFailed(e.to_string()))?;
            run_git(&["rm", "--cached", "--ignore-unmatch", "-q", ".gitignore"], repo_dir, shutdown).await?;
        }
    }

    let title = config.title.clone().unwrap_or_else(|| format!("fix: {task_title}"));
    run_git(&["commit", "-m", &title], repo_dir, shutdown).await?;

    run_git(&["push", "-u", "origin", &branch], repo_dir, shutdown)
        .await
        .map_err(|e| PrError::PushFailed {
            branch: branch.clone(),
            reason: e.to_string(),
        })?;

    info!(repo = %repo_name, branch = %branch, "pushed branch, creating pull request");
    let body = config.body.clone().unwrap_or_default();
    let pr = creator
        .create_pull_request(repo_url, &branch, &title, &body, &config.labels, &config.reviewers)
        .await?;
    Ok(pr)
}

async fn append_secrets_denylist(repo_dir: &str, original: Option<&str>) -> Result<(), FleetliftError> {
    let mut contents = original.map(str::to_string).unwrap_or_default();
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    contents.push_str("\n# fleetlift: secrets deny-list (temporary, restored after staging)\n");
    for pattern in SECRETS_DENY_LIST {
        contents.push_str(pattern);
        contents.push('\n');
    }
    tokio::fs::write(format!("{repo_dir}/.gitignore"), contents)
        .await
        .map_err(|e| PrError::ToolFailed(e.to_string()).into())
}

async fn run_git(args: &[&str], repo_dir: &str, shutdown: &Shutdown) -> Result<(), FleetliftError> {
    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(repo_dir);
    let output = run_to_completion(cmd, shutdown)
        .await
        .map_err(|e| PrError::ToolFailed(e.to_string()))?;
    if output.exit_code != 0 {
        return Err(PrError::ToolFailed(output.stderr).into());
    }
    Ok(())
}
