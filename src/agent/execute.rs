//! Executing phase (§4.4 step 3): agentic prompt construction and
//! invocation, or direct deterministic command execution.

use std::collections::BTreeMap;

use tokio::process::Command;
use tracing::info;

use crate::agent::clone::GITHUB_TOKEN_VAR;
use crate::agent::process::run_to_completion;
use crate::agent::shutdown::Shutdown;
use crate::domain::error::{FleetliftError, TransformationError};
use crate::domain::models::manifest::TaskManifest;
use crate::domain::models::task::{ExecutionSpec, TaskMode};
use crate::domain::ports::ExecOutput;

/// Environment variable names a deterministic execution's `env` map can
/// never override (§4.4 step 3: "a fixed deny-list ... that manifest
/// entries cannot override").
const DENY_LIST: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "SHELL",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "GITHUB_TOKEN",
    "ANTHROPIC_API_KEY",
];

/// Path to the configured agentic binary, overridable for tests; in
/// production this is resolved from `PATH` the same way the teacher's
/// `McpProcessManager::find_binary` resolves its server binaries.
pub const AGENT_BINARY_ENV: &str = "FLEETLIFT_AGENT_BINARY";

fn default_agent_binary() -> String {
    std::env::var(AGENT_BINARY_ENV).unwrap_or_else(|_| "claude".to_string())
}

/// Build the prompt handed to the agentic binary as a single argument
/// (§4.4 step 3): title, instructions, effective repo list with absolute
/// paths, `for_each` targets, verifier commands, and output requirements.
pub fn build_prompt(manifest: &TaskManifest, knowledge_digest: Option<&str>) -> String {
    let ExecutionSpec::Agentic { prompt, verifiers, output, .. } = &manifest.execution else {
        unreachable!("build_prompt called for a non-agentic execution spec")
    };

    let mut sections = Vec::new();
    if let Some(digest) = knowledge_digest {
        if !digest.is_empty() {
            sections.push(format!("## Relevant prior knowledge\n{digest}"));
        }
    }

    sections.push(format!("## Task: {}\n\n{}", manifest.title, prompt));

    let repo_list: String = manifest
        .repositories
        .iter()
        .map(|r| format!("- {}: {}", r.name, manifest.workspace_path(r)))
        .collect::<Vec<_>>()
        .join("\n");
    sections.push(format!("## Repositories\n{repo_list}"));

    if !manifest.for_each.is_empty() {
        let targets: String = manifest.for_each.iter().map(|f| format!("- {}", f.name)).collect::<Vec<_>>().join("\n");
        sections.push(format!("## for_each targets\n{targets}"));
    }

    if !verifiers.is_empty() {
        let verifier_list: String = verifiers.iter().map(|v| format!("- {}: {}", v.name, v.command)).collect::<Vec<_>>().join("\n");
        sections.push(format!("## Verifiers (must pass)\n{verifier_list}"));
    }

    let report_instructions = match manifest.mode {
        TaskMode::Transform => "Make the requested code changes directly in the repositories listed above.".to_string(),
        TaskMode::Report => {
            if manifest.for_each.is_empty() {
                "Write your findings to REPORT.md in the repository root.".to_string()
            } else {
                "For each target above, write your findings to REPORT-{target}.md in the repository root.".to_string()
            }
        }
    };
    sections.push(format!("## Output\n{report_instructions}"));

    if let Some(output) = output {
        if let Some(schema) = &output.schema {
            sections.push(format!(
                "Your report's YAML frontmatter must validate against this JSON schema:\n{schema}"
            ));
        }
    }

    sections.join("\n\n")
}

/// Run the manifest's execution spec against a cloned workspace.
pub async fn run_execution(manifest: &TaskManifest, knowledge_digest: Option<&str>, shutdown: &Shutdown) -> Result<ExecOutput, FleetliftError> {
    match &manifest.execution {
        ExecutionSpec::Agentic { .. } => run_agentic(manifest, knowledge_digest, shutdown).await,
        ExecutionSpec::Deterministic { image, command, args, env, .. } => {
            run_deterministic(image, command.as_deref(), args, env, shutdown).await
        }
    }
}

async fn run_agentic(manifest: &TaskManifest, knowledge_digest: Option<&str>, shutdown: &Shutdown) -> Result<ExecOutput, FleetliftError> {
    let prompt = build_prompt(manifest, knowledge_digest);
    let workdir = manifest.repositories.first().map(|r| manifest.workspace_path(r));
    invoke_agent_binary(&prompt, workdir.as_deref(), shutdown).await
}

/// Invoke the configured agentic binary with `prompt` as a single
/// argument (§4.4 step 3). Shared between the initial execution and
/// every steering re-run, since both must go through the same
/// secrets-stripped environment.
pub async fn invoke_agent_binary(prompt: &str, workdir: Option<&str>, shutdown: &Shutdown) -> Result<ExecOutput, FleetliftError> {
    info!("invoking agentic binary");

    let mut cmd = Command::new(default_agent_binary());
    cmd.arg(prompt);
    cmd.env_clear();
    for (key, value) in std::env::vars() {
        if key != GITHUB_TOKEN_VAR {
            cmd.env(key, value);
        }
    }
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }

    let output = run_to_completion(cmd, shutdown)
        .await
        .map_err(|e| TransformationError::AgentFailed(e.to_string()))?;
    if output.exit_code != 0 {
        return Err(TransformationError::AgentFailed(output.stderr).into());
    }
    Ok(output)
}

async fn run_deterministic(
    image: &str,
    command: Option<&str>,
    args: &[String],
    env: &BTreeMap<String, String>,
    shutdown: &Shutdown,
) -> Result<ExecOutput, FleetliftError> {
    let program = command.unwrap_or(image);
    info!(program, "running deterministic execution");

    let mut cmd = Command::new(program);
    cmd.args(args);
    for (key, value) in env {
        if DENY_LIST.contains(&key.as_str()) {
            continue;
        }
        cmd.env(key, value);
    }

    let output = run_to_completion(cmd, shutdown)
        .await
        .map_err(|e| TransformationError::AgentFailed(e.to_string()))?;
    if output.exit_code != 0 {
        return Err(TransformationError::DeterministicNonZero(output.exit_code).into());
    }
    Ok(output)
}
