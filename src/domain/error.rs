//! Domain error taxonomy for the Fleetlift orchestration engine.
//!
//! Each enum corresponds to one of the error kinds enumerated in the error
//! handling design: validation, provisioning, clone/setup, transformation,
//! verifier, PR creation, report parsing, sandbox protocol, and
//! cancellation. Errors never cross the workflow boundary as exceptions —
//! they are folded into the structured `TaskResult`/`GroupResult` types
//! that the workflow always returns.

use thiserror::Error;

/// Task/manifest validation failures. Surfaced immediately; never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unrecognized task schema version: {0}")]
    UnrecognizedVersion(String),

    #[error("name `{0}` is not path-safe (contains '/', '..', or control characters)")]
    UnsafeName(String),

    #[error("exactly one of {{agentic, deterministic}} must be set on `execution`")]
    ExecutionBranchAmbiguous,

    #[error("`repositories` and `transformation`+`targets` are mutually exclusive")]
    RepositoriesAndTransformationBothSet,

    #[error("`transformation` is set but `targets` is empty")]
    TransformationWithoutTargets,

    #[error("`repositories` must be non-empty when `transformation` is not set")]
    EmptyRepositories,

    #[error("`for_each` requires mode `report`, found `{0:?}`")]
    ForEachRequiresReportMode(crate::domain::models::task::TaskMode),

    #[error("task id `{0}` is not a bare name")]
    InvalidTaskId(String),
}

/// Sandbox provisioning failures. Retried per policy; terminal failure
/// marks every repo in the group failed.
#[derive(Debug, Error, Clone)]
pub enum ProvisioningError {
    #[error("sandbox provider refused to provision: {0}")]
    Refused(String),

    #[error("sandbox provisioning timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Clone / per-repo setup failures.
#[derive(Debug, Error, Clone)]
pub enum CloneError {
    #[error("failed to clone `{repo}`: {reason}")]
    CloneFailed { repo: String, reason: String },

    #[error("setup command failed for `{repo}` (exit {exit_code}): {output}")]
    SetupFailed {
        repo: String,
        exit_code: i32,
        output: String,
    },
}

/// Transformation execution failures (agentic binary or deterministic
/// container exited non-zero, or could not be launched at all).
#[derive(Debug, Error, Clone)]
pub enum TransformationError {
    #[error("agent process failed: {0}")]
    AgentFailed(String),

    #[error("deterministic command exited with code {0}")]
    DeterministicNonZero(i32),

    #[error("transformation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Verifier failures. Never retried; the group fails with the names of the
/// verifiers that failed.
#[derive(Debug, Error, Clone)]
pub enum VerifierError {
    #[error("verifier `{name}` has an empty command")]
    EmptyCommand { name: String },

    #[error("verifiers failed: {0:?}")]
    Failed(Vec<String>),
}

/// Pull-request creation failures. Scoped per-repo; other repos in the
/// group still succeed.
#[derive(Debug, Error, Clone)]
pub enum PrError {
    #[error("failed to push branch `{branch}`: {reason}")]
    PushFailed { branch: String, reason: String },

    #[error("PR creation tool failed: {0}")]
    ToolFailed(String),
}

/// Report parsing/validation failures. Recorded into the repo result; does
/// not fail the group.
#[derive(Debug, Error, Clone)]
pub enum ReportError {
    #[error("report file not found: {0}")]
    NotFound(String),

    #[error("frontmatter is not valid YAML: {0}")]
    InvalidFrontmatter(String),

    #[error("output schema validation failed: {0:?}")]
    SchemaViolations(Vec<String>),
}

/// Persisted-state I/O failures (workflow event log, knowledge store).
#[derive(Debug, Error, Clone)]
pub enum StorageError {
    #[error("failed to read `{path}`: {reason}")]
    ReadFailed { path: String, reason: String },

    #[error("failed to write `{path}`: {reason}")]
    WriteFailed { path: String, reason: String },

    #[error("failed to decode `{path}`: {reason}")]
    DecodeFailed { path: String, reason: String },
}

/// Malformed document observed on the sandbox control-file protocol.
/// Logged and ignored for polls; fatal only for the terminal result.
#[derive(Debug, Error, Clone)]
pub enum ProtocolError {
    #[error("malformed {kind} document: {reason}")]
    Malformed { kind: &'static str, reason: String },

    #[error("control file `{0}` vanished mid-read")]
    Vanished(String),
}

/// Top-level error enum unifying every concern above, for call sites that
/// need a single `Result<_, FleetliftError>` (e.g. activity runners).
#[derive(Debug, Error, Clone)]
pub enum FleetliftError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error(transparent)]
    Clone(#[from] CloneError),

    #[error(transparent)]
    Transformation(#[from] TransformationError),

    #[error(transparent)]
    Verifier(#[from] VerifierError),

    #[error(transparent)]
    Pr(#[from] PrError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("task cancelled")]
    Cancelled,
}

impl FleetliftError {
    /// Whether this error kind should ever be retried by the activity
    /// runner's backoff policy (§4.1, §7).
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provisioning(_) | Self::Clone(_) | Self::Transformation(_)
        )
    }
}
