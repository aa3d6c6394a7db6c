//! Reference `PullRequestCreator` (§4.7, §6.4): shells out to the GitHub
//! CLI, matching the teacher's general preference for driving real host
//! tools over re-implementing an HTTP client and auth flow by hand.

use tokio::process::Command;
use tracing::info;

use crate::domain::error::PrError;
use crate::domain::models::result::PullRequestInfo;
use crate::domain::ports::PullRequestCreator;

/// Creates pull requests via `gh pr create`. `gh` is expected to already
/// be authenticated (`GH_TOKEN`/`GITHUB_TOKEN` in the environment or a
/// prior `gh auth login`); this type does not manage credentials itself.
pub struct GhPullRequestCreator;

#[async_trait::async_trait]
impl PullRequestCreator for GhPullRequestCreator {
    async fn create_pull_request(
        &self,
        repo_url: &str,
        branch: &str,
        title: &str,
        body: &str,
        labels: &[String],
        reviewers: &[String],
    ) -> Result<PullRequestInfo, PrError> {
        let mut cmd = Command::new("gh");
        cmd.args(["pr", "create", "--repo", repo_url, "--head", branch, "--title", title, "--body", body]);
        if !labels.is_empty() {
            cmd.args(["--label", &labels.join(",")]);
        }
        if !reviewers.is_empty() {
            cmd.args(["--reviewer", &reviewers.join(",")]);
        }

        info!(repo_url, branch, "creating pull request via gh");
        let output = cmd.output().await.map_err(|e| PrError::ToolFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(PrError::ToolFailed(String::from_utf8_lossy(&output.stderr).to_string()));
        }

        let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let number = url.rsplit('/').next().and_then(|s| s.parse::<u64>().ok());
        Ok(PullRequestInfo { url, branch: branch.to_string(), number })
    }
}
