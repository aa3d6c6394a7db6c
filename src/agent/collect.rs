//! Collecting phase (§4.4 step 5): `git status`/`git diff` parsing into
//! structured `DiffEntry`s, and report-mode `REPORT.md` parsing.

use std::collections::HashMap;

use tokio::process::Command;

use crate::agent::process::run_to_completion;
use crate::agent::shutdown::Shutdown;
use crate::domain::error::{FleetliftError, ReportError};
use crate::domain::models::result::{DiffEntry, DiffStatus, Report};

/// Per-file diff truncation cap (§4.4 step 5: "truncate each file's diff
/// at a fixed line cap").
const DIFF_LINE_CAP: usize = 1000;

/// List every modified path in `repo_dir`, classified and sized, by
/// combining `git status --porcelain` (which paths changed),
/// `git diff --numstat HEAD` (insertion/deletion counts), and the
/// combined `git diff HEAD` + `git diff --cached` (per-file diff text,
/// only used here to detect add/delete mode lines not visible in
/// `--numstat`).
pub async fn collect_diff(repo_dir: &str, shutdown: &Shutdown) -> Result<Vec<DiffEntry>, FleetliftError> {
    let status_paths = git_status_porcelain(repo_dir, shutdown).await?;
    if status_paths.is_empty() {
        return Ok(Vec::new());
    }

    let numstat = git_numstat(repo_dir, shutdown).await?;
    let combined_diff = combined_diff_text(repo_dir, shutdown).await?;
    let chunks = parse_diff_chunks(&combined_diff);

    let mut entries = Vec::new();
    for status_path in status_paths {
        let (insertions, deletions) = numstat
            .get(&status_path.path)
            .copied()
            .unwrap_or((0, 0));
        let chunk = chunks.get(&status_path.path);
        let status = chunk.map(|c| c.status).unwrap_or(if status_path.old_path.is_some() {
            DiffStatus::Renamed
        } else {
            DiffStatus::Modified
        });
        let diff = chunk.map(|c| c.text.clone()).unwrap_or_default();

        entries.push(DiffEntry {
            path: status_path.path,
            status,
            insertions,
            deletions,
            old_path: status_path.old_path,
            diff,
        });
    }
    Ok(entries)
}

struct StatusPath {
    path: String,
    old_path: Option<String>,
}

/// Parse `git status --porcelain` output. Each line is `XY path` or,
/// for renames, `XY old -> new`.
async fn git_status_porcelain(repo_dir: &str, shutdown: &Shutdown) -> Result<Vec<StatusPath>, FleetliftError> {
    let output = run_git(&["status", "--porcelain"], repo_dir, shutdown).await?;
    Ok(output
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| {
            let rest = &line[3..];
            if let Some((old, new)) = rest.split_once(" -> ") {
                StatusPath {
                    path: new.to_string(),
                    old_path: Some(old.to_string()),
                }
            } else {
                StatusPath {
                    path: rest.to_string(),
                    old_path: None,
                }
            }
        })
        .collect())
}

/// Parse `git diff --numstat HEAD` into a path → (insertions, deletions) map.
async fn git_numstat(repo_dir: &str, shutdown: &Shutdown) -> Result<HashMap<String, (u64, u64)>, FleetliftError> {
    let output = run_git(&["diff", "--numstat", "HEAD"], repo_dir, shutdown).await?;
    let mut map = HashMap::new();
    for line in output.lines() {
        let mut fields = line.split('\t');
        let (Some(ins), Some(del), Some(path)) = (fields.next(), fields.next(), fields.next()) else {
            continue;
        };
        let insertions = ins.parse().unwrap_or(0);
        let deletions = del.parse().unwrap_or(0);
        map.insert(path.to_string(), (insertions, deletions));
    }
    Ok(map)
}

async fn combined_diff_text(repo_dir: &str, shutdown: &Shutdown) -> Result<String, FleetliftError> {
    let unstaged = run_git(&["diff", "HEAD"], repo_dir, shutdown).await?;
    let staged = run_git(&["diff", "--cached"], repo_dir, shutdown).await?;
    Ok(format!("{unstaged}\n{staged}"))
}

/// One file's worth of parsed diff: its status and its truncated hunk
/// text (§3.6, §4.4 step 5).
struct DiffChunk {
    status: DiffStatus,
    text: String,
}

/// Split the combined diff on `diff --git ` markers, classify each
/// file's status from `new file mode` / `deleted file mode` lines, and
/// keep the (truncated) hunk text alongside it.
fn parse_diff_chunks(combined: &str) -> HashMap<String, DiffChunk> {
    let mut chunks = HashMap::new();
    for chunk in combined.split("diff --git ").skip(1) {
        let Some(header_line) = chunk.lines().next() else { continue };
        let Some(path) = header_line.split(" b/").nth(1) else { continue };

        let status = if chunk.contains("new file mode") {
            DiffStatus::Added
        } else if chunk.contains("deleted file mode") {
            DiffStatus::Deleted
        } else if chunk.contains("rename from") {
            DiffStatus::Renamed
        } else {
            DiffStatus::Modified
        };
        let text = truncate_diff_text(&format!("diff --git {chunk}"));
        chunks.insert(path.to_string(), DiffChunk { status, text });
    }
    chunks
}

/// Truncate a unified diff body to `DIFF_LINE_CAP` lines, used when a
/// caller wants the raw diff text alongside the structured `DiffEntry`
/// list (§4.4 step 5).
pub fn truncate_diff_text(diff_text: &str) -> String {
    let lines: Vec<&str> = diff_text.lines().take(DIFF_LINE_CAP).collect();
    lines.join("\n")
}

async fn run_git(args: &[&str], repo_dir: &str, shutdown: &Shutdown) -> Result<String, FleetliftError> {
    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(repo_dir);
    let output = run_to_completion(cmd, shutdown)
        .await
        .map_err(|e| crate::domain::error::CloneError::SetupFailed {
            repo: repo_dir.to_string(),
            exit_code: -1,
            output: e.to_string(),
        })?;
    Ok(output.stdout)
}

/// Read and parse a report file (`REPORT.md` or `REPORT-{target}.md`),
/// splitting `---\n`-delimited YAML frontmatter from the body (§3.6,
/// §4.4 step 5).
pub async fn read_report(repo_dir: &str, target: Option<&str>) -> Result<Report, ReportError> {
    let filename = match target {
        Some(name) => format!("REPORT-{name}.md"),
        None => "REPORT.md".to_string(),
    };
    let path = format!("{repo_dir}/{filename}");

    let raw = tokio::fs::read_to_string(&path)
        .await
        .map_err(|_| ReportError::NotFound(path.clone()))?;

    Ok(parse_report(raw))
}

fn parse_report(raw: String) -> Report {
    if let Some(rest) = raw.strip_prefix("---\n") {
        if let Some(end) = rest.find("\n---") {
            let frontmatter_text = &rest[..end];
            let body = rest[end..].trim_start_matches("\n---").trim_start_matches('\n').to_string();

            return match serde_yaml::from_str::<serde_json::Value>(frontmatter_text) {
                Ok(value) => Report {
                    frontmatter: Some(value),
                    body: Some(body),
                    raw,
                    schema_violations: Vec::new(),
                },
                Err(_) => Report {
                    frontmatter: None,
                    body: Some(body),
                    raw,
                    schema_violations: vec!["frontmatter is not valid YAML".to_string()],
                },
            };
        }
    }

    Report {
        frontmatter: None,
        body: None,
        raw,
        schema_violations: Vec::new(),
    }
}

/// Validate a report's frontmatter against a JSON schema (§3.6: "output
/// requirements"), recording violations rather than failing the collect
/// phase outright (§7: report parsing failures don't fail the group).
pub fn validate_report_schema(report: &mut Report, schema: &serde_json::Value) {
    let Some(frontmatter) = &report.frontmatter else {
        report.schema_violations.push("report has no frontmatter to validate".to_string());
        return;
    };

    let compiled = match jsonschema::validator_for(schema) {
        Ok(c) => c,
        Err(e) => {
            report.schema_violations.push(format!("invalid schema: {e}"));
            return;
        }
    };

    let violations: Vec<String> = compiled.iter_errors(frontmatter).map(|e| e.to_string()).collect();
    report.schema_violations = violations;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_frontmatter_and_body() {
        let raw = "---\nstatus: ok\ncount: 3\n---\nEverything looks good.\n".to_string();
        let report = parse_report(raw);
        assert_eq!(report.frontmatter.unwrap()["status"], "ok");
        assert_eq!(report.body.unwrap().trim(), "Everything looks good.");
        assert!(report.schema_violations.is_empty());
    }

    #[test]
    fn raw_only_when_no_frontmatter_delimiter() {
        let raw = "Just a plain report body.".to_string();
        let report = parse_report(raw.clone());
        assert!(report.frontmatter.is_none());
        assert!(report.body.is_none());
        assert_eq!(report.raw, raw);
    }

    #[test]
    fn invalid_yaml_frontmatter_is_recorded_as_violation() {
        let raw = "---\n: : not yaml :\n---\nbody\n".to_string();
        let report = parse_report(raw);
        assert!(report.frontmatter.is_none());
        assert!(!report.schema_violations.is_empty());
    }

    #[test]
    fn schema_validation_flags_missing_required_field() {
        let mut report = parse_report("---\nname: widget\n---\nbody\n".to_string());
        let schema = serde_json::json!({
            "type": "object",
            "required": ["name", "version"],
        });
        validate_report_schema(&mut report, &schema);
        assert!(!report.is_schema_valid());
    }

    #[test]
    fn schema_validation_passes_for_conforming_frontmatter() {
        let mut report = parse_report("---\nname: widget\nversion: 1\n---\nbody\n".to_string());
        let schema = serde_json::json!({
            "type": "object",
            "required": ["name", "version"],
        });
        validate_report_schema(&mut report, &schema);
        assert!(report.is_schema_valid());
    }

    #[test]
    fn mode_markers_classify_add_and_delete() {
        let combined = "diff --git a/new.txt b/new.txt\nnew file mode 100644\n@@ -0,0 +1 @@\n+hi\n\
            diff --git a/old.txt b/old.txt\ndeleted file mode 100644\n@@ -1 +0,0 @@\n-bye\n";
        let chunks = parse_diff_chunks(combined);
        assert_eq!(chunks.get("new.txt").unwrap().status, DiffStatus::Added);
        assert_eq!(chunks.get("old.txt").unwrap().status, DiffStatus::Deleted);
        assert!(chunks.get("new.txt").unwrap().text.contains("+hi"));
        assert!(chunks.get("old.txt").unwrap().text.contains("-bye"));
    }

    #[tokio::test]
    async fn collect_diff_populates_status_and_truncated_diff_text() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_dir = tmp.path().to_str().unwrap();
        let shutdown = Shutdown::new();

        run_git(&["init", "-q"], repo_dir, &shutdown).await.unwrap();
        run_git(&["config", "user.email", "agent@fleetlift.dev"], repo_dir, &shutdown).await.unwrap();
        run_git(&["config", "user.name", "fleetlift-agent"], repo_dir, &shutdown).await.unwrap();
        tokio::fs::write(format!("{repo_dir}/file.txt"), "one\n").await.unwrap();
        run_git(&["add", "-A"], repo_dir, &shutdown).await.unwrap();
        run_git(&["commit", "-q", "-m", "initial"], repo_dir, &shutdown).await.unwrap();

        tokio::fs::write(format!("{repo_dir}/file.txt"), "one\ntwo\n").await.unwrap();

        let entries = collect_diff(repo_dir, &shutdown).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "file.txt");
        assert_eq!(entries[0].status, DiffStatus::Modified);
        assert!(entries[0].diff.contains("+two"));
    }

    #[test]
    fn truncate_diff_text_caps_at_line_limit() {
        let long_diff = (0..2000).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let truncated = truncate_diff_text(&long_diff);
        assert_eq!(truncated.lines().count(), DIFF_LINE_CAP);
    }

    #[tokio::test]
    async fn read_report_surfaces_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = read_report(tmp.path().to_str().unwrap(), None).await.unwrap_err();
        assert!(matches!(err, ReportError::NotFound(_)));
    }

    #[tokio::test]
    async fn read_report_honors_for_each_target_filename() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("REPORT-service-a.md"), "---\nok: true\n---\nbody\n")
            .await
            .unwrap();
        let report = read_report(tmp.path().to_str().unwrap(), Some("service-a")).await.unwrap();
        assert_eq!(report.frontmatter.unwrap()["ok"], true);
    }
}
