//! Task domain model (§3.1).
//!
//! A `Task` is the immutable input to a run: the set of repositories (or a
//! shared transformation repo plus targets), the execution payload, the
//! grouping/concurrency policy, and the approval/PR configuration.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::ValidationError;

/// Execution mode of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    /// Produces pull requests.
    Transform,
    /// Produces structured reports.
    Report,
}

impl Default for TaskMode {
    fn default() -> Self {
        Self::Transform
    }
}

/// A single repository to operate on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositorySpec {
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub setup: Vec<String>,
}

impl RepositorySpec {
    /// The effective branch, defaulting to `main`.
    pub fn effective_branch(&self) -> &str {
        self.branch.as_deref().unwrap_or("main")
    }

    /// The effective name, defaulting to the repo basename of `url`.
    pub fn effective_name(&self) -> String {
        match &self.name {
            Some(n) => n.clone(),
            None => basename_of_url(&self.url),
        }
    }
}

fn basename_of_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
    last.trim_end_matches(".git").to_string()
}

/// A `for_each` iteration target within a single repository (report mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForEachSpec {
    pub name: String,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

/// A verifier command that gates progression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Resource/behavior limits for agentic execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgenticLimits {
    #[serde(default)]
    pub max_steering_iterations: Option<u32>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

/// Where the agent should write its report (report mode).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputSpec {
    #[serde(default)]
    pub schema: Option<serde_json::Value>,
}

/// The execution payload: exactly one of agentic or deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionSpec {
    Agentic {
        prompt: String,
        #[serde(default)]
        verifiers: Vec<VerifierSpec>,
        #[serde(default)]
        limits: Option<AgenticLimits>,
        #[serde(default)]
        output: Option<OutputSpec>,
    },
    Deterministic {
        image: String,
        #[serde(default)]
        command: Option<String>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: std::collections::BTreeMap<String, String>,
        #[serde(default)]
        verifiers: Vec<VerifierSpec>,
    },
}

impl ExecutionSpec {
    pub fn verifiers(&self) -> &[VerifierSpec] {
        match self {
            Self::Agentic { verifiers, .. } => verifiers,
            Self::Deterministic { verifiers, .. } => verifiers,
        }
    }
}

/// An explicit grouping of repositories sharing one sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub repositories: Vec<String>,
}

/// Pull-request creation configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullRequestConfig {
    #[serde(default)]
    pub branch_prefix: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub reviewers: Vec<String>,
}

/// Continual-learning knowledge hooks configuration (§4.6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    #[serde(default)]
    pub capture_disabled: bool,
    #[serde(default)]
    pub enrich_disabled: bool,
    #[serde(default)]
    pub max_items: Option<u32>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// The immutable input to a run (§3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub version: String,
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub mode: TaskMode,
    #[serde(default)]
    pub repositories: Vec<RepositorySpec>,
    #[serde(default)]
    pub transformation: Option<RepositorySpec>,
    #[serde(default)]
    pub targets: Vec<RepositorySpec>,
    #[serde(default)]
    pub for_each: Vec<ForEachSpec>,
    pub execution: ExecutionSpec,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub max_parallel: Option<u32>,
    #[serde(default)]
    pub failure_threshold_percent: Option<u8>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default)]
    pub pull_request: PullRequestConfig,
    #[serde(default)]
    pub knowledge: Option<KnowledgeConfig>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Schema versions this engine understands.
pub const SUPPORTED_VERSIONS: &[&str] = &["1", "1.0"];

impl Task {
    /// The effective max-parallel concurrency, defaulting to 5.
    pub fn effective_max_parallel(&self) -> u32 {
        self.max_parallel.unwrap_or(5).max(1)
    }

    /// The effective failure threshold, defaulting to 100 (never pause).
    pub fn effective_failure_threshold(&self) -> u8 {
        self.failure_threshold_percent.unwrap_or(100)
    }

    /// The effective per-group timeout, defaulting to 30 minutes.
    pub fn effective_timeout(&self) -> Duration {
        self.timeout
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(Duration::from_secs(30 * 60))
    }

    /// The effective repository list: `targets` when `transformation` is
    /// set, otherwise `repositories`.
    pub fn effective_repositories(&self) -> &[RepositorySpec] {
        if self.transformation.is_some() {
            &self.targets
        } else {
            &self.repositories
        }
    }

    /// Validate the task per §3.1 invariants and §8 testable property 1
    /// (path safety). Returns every violation found rather than
    /// short-circuiting on the first, so a caller can report them all.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if !SUPPORTED_VERSIONS.contains(&self.version.as_str()) {
            errors.push(ValidationError::UnrecognizedVersion(self.version.clone()));
        }

        if !is_bare_name(&self.id) {
            errors.push(ValidationError::InvalidTaskId(self.id.clone()));
        }

        let has_transformation = self.transformation.is_some();
        let has_repositories = !self.repositories.is_empty();

        if has_transformation && has_repositories {
            errors.push(ValidationError::RepositoriesAndTransformationBothSet);
        } else if has_transformation && self.targets.is_empty() {
            errors.push(ValidationError::TransformationWithoutTargets);
        } else if !has_transformation && !has_repositories {
            errors.push(ValidationError::EmptyRepositories);
        }

        if !self.for_each.is_empty() && self.mode != TaskMode::Report {
            errors.push(ValidationError::ForEachRequiresReportMode(self.mode));
        }

        for repo in self.effective_repositories() {
            let name = repo.effective_name();
            if !is_bare_name(&name) {
                errors.push(ValidationError::UnsafeName(name));
            }
        }
        if let Some(t) = &self.transformation {
            let name = t.effective_name();
            if !is_bare_name(&name) {
                errors.push(ValidationError::UnsafeName(name));
            }
        }
        for fe in &self.for_each {
            if !is_bare_name(&fe.name) {
                errors.push(ValidationError::UnsafeName(fe.name.clone()));
            }
        }
        for group in &self.groups {
            if !is_bare_name(&group.name) {
                errors.push(ValidationError::UnsafeName(group.name.clone()));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// A name is path-safe if it contains no path separator, no `..`, and no
/// control characters (§8 testable property 1).
pub fn is_bare_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..")
        && name.chars().all(|c| !c.is_control())
}

/// Parse a duration string like `30m`, `90s`, `2h`. Falls back to `None`
/// for anything unrecognized so the caller can apply a default.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (num, unit) = s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()));
    let n: u64 = num.parse().ok()?;
    match unit {
        "s" | "sec" | "secs" => Some(Duration::from_secs(n)),
        "m" | "min" | "mins" => Some(Duration::from_secs(n * 60)),
        "h" | "hr" | "hrs" => Some(Duration::from_secs(n * 3600)),
        "" => Some(Duration::from_secs(n)),
        _ => None,
    }
}
