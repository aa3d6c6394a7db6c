//! Task manifest (§3.2) — the document the worker writes once into the
//! sandbox for the agent to consume.

use serde::{Deserialize, Serialize};

use crate::domain::error::ValidationError;
use crate::domain::models::task::{is_bare_name, ExecutionSpec, PullRequestConfig, Task, TaskMode};

/// Git identity the agent should configure before committing (§3.2, §4.4
/// step 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitIdentity {
    pub user_email: String,
    pub user_name: String,
    pub clone_depth: u32,
}

impl Default for GitIdentity {
    fn default() -> Self {
        Self {
            user_email: "fleetlift@noreply.invalid".into(),
            user_name: "Fleetlift Agent".into(),
            clone_depth: 1,
        }
    }
}

/// One effective repository, flattened into execution-ready form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveRepo {
    pub name: String,
    pub url: String,
    pub branch: String,
    pub setup: Vec<String>,
    /// Whether this repo lives under `targets/{name}` (transformation
    /// mode) rather than flat at `/workspace/{name}`.
    pub is_target: bool,
}

/// Manifest schema versions this binary understands. Distinct from
/// `Task::version` because the manifest can cross a sandbox-image
/// boundary independently of the task schema (see SPEC_FULL.md §3).
pub const MANIFEST_SCHEMA_VERSIONS: &[&str] = &["1"];

/// The manifest document (§3.2): a projection of `Task` into
/// execution-ready form, written exactly once into the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskManifest {
    pub schema_version: String,
    pub task_id: String,
    pub group_name: String,
    pub title: String,
    pub mode: TaskMode,
    pub repositories: Vec<EffectiveRepo>,
    pub for_each: Vec<crate::domain::models::task::ForEachSpec>,
    pub execution: ExecutionSpec,
    pub timeout_seconds: u64,
    pub require_approval: bool,
    pub max_steering_iterations: u32,
    pub pull_request: PullRequestConfig,
    pub git_identity: GitIdentity,
}

/// Default cap on steering iterations (§4.5).
pub const DEFAULT_MAX_STEERING_ITERATIONS: u32 = 5;

impl TaskManifest {
    /// Build the manifest for a single group from its parent task. Repo
    /// names are re-sanitized here even though `Task::validate` already
    /// checked them, because the manifest is the last line of defense
    /// before names reach filesystem paths inside the sandbox (§3.2: "its
    /// commands are trusted but repo names are still sanitized").
    pub fn from_task_and_group(
        task: &Task,
        group_name: &str,
        repo_names_in_group: &[String],
    ) -> Result<Self, ValidationError> {
        let is_transform_mode = task.transformation.is_some();
        let mut repositories = Vec::new();

        for repo in task.effective_repositories() {
            let name = repo.effective_name();
            if !repo_names_in_group.iter().any(|n| n == &name) {
                continue;
            }
            if !is_bare_name(&name) {
                return Err(ValidationError::UnsafeName(name));
            }
            repositories.push(EffectiveRepo {
                name,
                url: repo.url.clone(),
                branch: repo.effective_branch().to_string(),
                setup: repo.setup.clone(),
                is_target: is_transform_mode,
            });
        }

        if let Some(tool) = &task.transformation {
            let name = tool.effective_name();
            if !is_bare_name(&name) {
                return Err(ValidationError::UnsafeName(name));
            }
            repositories.push(EffectiveRepo {
                name,
                url: tool.url.clone(),
                branch: tool.effective_branch().to_string(),
                setup: tool.setup.clone(),
                is_target: false,
            });
        }

        let max_steering_iterations = match &task.execution {
            ExecutionSpec::Agentic {
                limits: Some(limits),
                ..
            } => limits
                .max_steering_iterations
                .unwrap_or(DEFAULT_MAX_STEERING_ITERATIONS),
            _ => DEFAULT_MAX_STEERING_ITERATIONS,
        };

        Ok(Self {
            schema_version: "1".to_string(),
            task_id: task.id.clone(),
            group_name: group_name.to_string(),
            title: task.title.clone(),
            mode: task.mode,
            repositories,
            for_each: task.for_each.clone(),
            execution: task.execution.clone(),
            timeout_seconds: task.effective_timeout().as_secs(),
            require_approval: task.mode == TaskMode::Transform && task.require_approval,
            max_steering_iterations,
            pull_request: task.pull_request.clone(),
            git_identity: GitIdentity::default(),
        })
    }

    /// Structural + name-safety validation the agent performs on arrival
    /// (§4.4 step 1).
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !MANIFEST_SCHEMA_VERSIONS.contains(&self.schema_version.as_str()) {
            return Err(ValidationError::UnrecognizedVersion(
                self.schema_version.clone(),
            ));
        }
        if !is_bare_name(&self.task_id) {
            return Err(ValidationError::InvalidTaskId(self.task_id.clone()));
        }
        if !is_bare_name(&self.group_name) {
            return Err(ValidationError::UnsafeName(self.group_name.clone()));
        }
        for repo in &self.repositories {
            if !is_bare_name(&repo.name) {
                return Err(ValidationError::UnsafeName(repo.name.clone()));
            }
        }
        for fe in &self.for_each {
            if !is_bare_name(&fe.name) {
                return Err(ValidationError::UnsafeName(fe.name.clone()));
            }
        }
        Ok(())
    }

    /// Prepend a knowledge-enrich digest (§4.6) to the agentic prompt.
    /// A no-op for deterministic execution, which has no prompt to
    /// enrich.
    pub fn apply_enrichment(&mut self, digest: &str) {
        if let ExecutionSpec::Agentic { prompt, .. } = &mut self.execution {
            *prompt = format!("Relevant knowledge from past runs:\n{digest}\n\n{prompt}");
        }
    }

    /// The workspace path for a given repo, honoring the flat-vs-target
    /// layout rule of §4.4 step 2.
    pub fn workspace_path(&self, repo: &EffectiveRepo) -> String {
        if repo.is_target {
            format!("/workspace/targets/{}", repo.name)
        } else {
            format!("/workspace/{}", repo.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::task::{ExecutionSpec, RepositorySpec, Task};

    fn task() -> Task {
        Task {
            version: "1".into(),
            id: "t1".into(),
            title: "Title".into(),
            mode: TaskMode::Transform,
            repositories: vec![RepositorySpec {
                url: "https://github.com/acme/widgets.git".into(),
                branch: None,
                name: None,
                setup: vec!["npm install".into()],
            }],
            transformation: None,
            targets: vec![],
            for_each: vec![],
            execution: ExecutionSpec::Agentic {
                prompt: "p".into(),
                verifiers: vec![],
                limits: None,
                output: None,
            },
            groups: vec![],
            max_parallel: None,
            failure_threshold_percent: None,
            parallel: false,
            timeout: None,
            require_approval: true,
            pull_request: PullRequestConfig::default(),
            knowledge: None,
            created_at: None,
        }
    }

    #[test]
    fn apply_enrichment_prepends_digest_to_agentic_prompt() {
        let mut m = TaskManifest::from_task_and_group(&task(), "g1", &["widgets".to_string()]).unwrap();
        m.apply_enrichment("- watch out for flaky test X");
        match &m.execution {
            ExecutionSpec::Agentic { prompt, .. } => {
                assert!(prompt.contains("watch out for flaky test X"));
                assert!(prompt.ends_with("\np"));
            }
            ExecutionSpec::Deterministic { .. } => panic!("expected agentic execution"),
        }
    }

    #[test]
    fn manifest_flattens_repo_list() {
        let t = task();
        let m = TaskManifest::from_task_and_group(&t, "g1", &["widgets".to_string()]).unwrap();
        assert_eq!(m.repositories.len(), 1);
        assert_eq!(m.repositories[0].name, "widgets");
        assert!(m.require_approval);
        assert!(m.validate().is_ok());
    }

    #[test]
    fn workspace_path_honors_target_layout() {
        let repo = EffectiveRepo {
            name: "widgets".into(),
            url: String::new(),
            branch: "main".into(),
            setup: vec![],
            is_target: true,
        };
        let m = TaskManifest::from_task_and_group(&task(), "g1", &["widgets".into()]).unwrap();
        assert_eq!(m.workspace_path(&repo), "/workspace/targets/widgets");
    }
}
