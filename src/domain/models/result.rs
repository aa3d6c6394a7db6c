//! Terminal result documents (§3.4, §3.6): what a repo, group, and task
//! produced once execution finishes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::FleetliftError;

/// A changed file observed via `git diff --numstat` (§4.4 step 5,
/// §8 testable property 11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
}

/// One file's worth of diff statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffEntry {
    pub path: String,
    pub status: DiffStatus,
    pub insertions: u64,
    pub deletions: u64,
    #[serde(default)]
    pub old_path: Option<String>,
    /// This file's hunk text out of the combined `git diff HEAD` +
    /// `git diff --cached`, truncated at the fixed per-file line cap
    /// (§3.6, §4.4 step 5).
    #[serde(default)]
    pub diff: String,
}

/// The outcome of a single named verifier command (§4.4 step 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierResult {
    pub name: String,
    pub passed: bool,
    pub exit_code: i32,
    pub output_tail: String,
}

/// A parsed structured report (§3.6, report mode): YAML frontmatter plus
/// a free-text body, optionally schema-validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    #[serde(default)]
    pub frontmatter: Option<serde_json::Value>,
    #[serde(default)]
    pub body: Option<String>,
    /// The untouched report file content, kept alongside the parsed
    /// `frontmatter`/`body` split so a consumer can fall back to it if
    /// parsing was only partially successful.
    pub raw: String,
    #[serde(default)]
    pub schema_violations: Vec<String>,
}

impl Report {
    /// Whether this report satisfies its output schema, if one was given.
    /// A report with no schema (`schema_violations` never populated) is
    /// always considered valid.
    pub fn is_schema_valid(&self) -> bool {
        self.schema_violations.is_empty()
    }
}

/// The result of one `for_each` iteration within a repo (report mode,
/// §3.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForEachResult {
    pub name: String,
    pub report: Option<Report>,
    pub error: Option<String>,
}

/// Pull request metadata returned by the PR-creation collaborator
/// (§4.4 step 7). PR creation itself is an external shell-out, out of
/// scope; this struct is what the agent records once it has run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestInfo {
    pub url: String,
    pub branch: String,
    pub number: Option<u64>,
}

/// Outcome for exactly one repository within a group (§3.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoResult {
    pub repo_name: String,
    pub succeeded: bool,
    #[serde(default)]
    pub diff: Vec<DiffEntry>,
    #[serde(default)]
    pub verifiers: Vec<VerifierResult>,
    #[serde(default)]
    pub report: Option<Report>,
    #[serde(default)]
    pub for_each: Vec<ForEachResult>,
    #[serde(default)]
    pub pull_request: Option<PullRequestInfo>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RepoResult {
    pub fn success(repo_name: impl Into<String>) -> Self {
        Self {
            repo_name: repo_name.into(),
            succeeded: true,
            diff: Vec::new(),
            verifiers: Vec::new(),
            report: None,
            for_each: Vec::new(),
            pull_request: None,
            error: None,
        }
    }

    pub fn failure(repo_name: impl Into<String>, err: &FleetliftError) -> Self {
        Self {
            repo_name: repo_name.into(),
            succeeded: false,
            diff: Vec::new(),
            verifiers: Vec::new(),
            report: None,
            for_each: Vec::new(),
            pull_request: None,
            error: Some(err.to_string()),
        }
    }
}

/// Group-level outcome aggregated from its repos' results (§3.4, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupOutcome {
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

/// Terminal result for one group (§3.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupResult {
    pub group_name: String,
    pub outcome: GroupOutcome,
    pub repos: Vec<RepoResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl GroupResult {
    /// Whether every repo in this group succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.outcome == GroupOutcome::Succeeded && self.repos.iter().all(|r| r.succeeded)
    }
}

/// Terminal result for the whole task, aggregating every group (§3.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub groups: Vec<GroupResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TaskResult {
    /// `completed / total` expressed as whole percent, where `completed`
    /// counts every group that reached a terminal outcome (succeeded,
    /// failed, or skipped) — see the failure-threshold denominator
    /// decision recorded in DESIGN.md.
    pub fn completion_percent(&self) -> u8 {
        if self.groups.is_empty() {
            return 100;
        }
        let completed = self
            .groups
            .iter()
            .filter(|g| g.outcome != GroupOutcome::Cancelled)
            .count();
        ((completed * 100) / self.groups.len()) as u8
    }

    /// `failed / completed` expressed as whole percent, the quantity the
    /// failure-threshold pause check compares against
    /// `Task::effective_failure_threshold` (§4.2, §9 Open Question 1).
    pub fn failure_percent(&self) -> u8 {
        let completed: Vec<_> = self
            .groups
            .iter()
            .filter(|g| g.outcome != GroupOutcome::Cancelled)
            .collect();
        if completed.is_empty() {
            return 0;
        }
        let failed = completed
            .iter()
            .filter(|g| g.outcome == GroupOutcome::Failed)
            .count();
        ((failed * 100) / completed.len()) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(outcome: GroupOutcome) -> GroupResult {
        let now = Utc::now();
        GroupResult {
            group_name: "g".into(),
            outcome,
            repos: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn failure_percent_counts_all_terminal_groups_as_denominator() {
        // Mirrors the S3 scenario: one of two completed groups failed.
        let result = TaskResult {
            task_id: "t".into(),
            groups: vec![group(GroupOutcome::Succeeded), group(GroupOutcome::Failed)],
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };
        assert_eq!(result.failure_percent(), 50);
        assert_eq!(result.completion_percent(), 100);
    }

    #[test]
    fn cancelled_groups_excluded_from_denominator() {
        let result = TaskResult {
            task_id: "t".into(),
            groups: vec![
                group(GroupOutcome::Failed),
                group(GroupOutcome::Cancelled),
                group(GroupOutcome::Cancelled),
            ],
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };
        assert_eq!(result.failure_percent(), 100);
    }

    #[test]
    fn report_without_violations_is_valid() {
        let report = Report {
            frontmatter: Some(serde_json::json!({"ok": true})),
            body: Some("hello".into()),
            raw: "---\nok: true\n---\nhello".into(),
            schema_violations: Vec::new(),
        };
        assert!(report.is_schema_valid());
    }
}
