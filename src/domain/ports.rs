//! Ports (§4.7, §6.3): the abstract boundaries the core engine consumes.
//! Concrete adapters (container runtime, cluster job provider, GitHub PR
//! creation) live outside the core; only the reference
//! `LocalProcessSandboxProvider` (infrastructure::sandbox) ships here.

use async_trait::async_trait;

use crate::domain::error::{FleetliftError, PrError};
use crate::domain::models::knowledge::KnowledgeItem;
use crate::domain::models::manifest::TaskManifest;
use crate::domain::models::result::{PullRequestInfo, RepoResult};
use crate::domain::models::status::AgentStatus;
use crate::domain::models::steering::SteeringInstruction;

/// Opaque handle to a provisioned sandbox, returned by
/// `SandboxProvider::provision` and threaded through every subsequent
/// call for that sandbox's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxHandle(pub String);

/// The abstract contract for provisioning an isolated execution
/// environment, submitting the manifest, polling status/result, and
/// delivering steering (§4.7). Concrete providers (container runtime,
/// cluster job) are external collaborators; the engine only depends on
/// this trait.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provision a fresh sandbox for one group. Retried by the activity
    /// runner on `ProvisioningError` per the backoff policy (§4.1).
    async fn provision(&self, task_id: &str, group_name: &str) -> Result<SandboxHandle, FleetliftError>;

    /// Write the manifest exactly once, atomically, at the well-known
    /// control-file path (§6.1, §8 testable property 2).
    async fn submit_manifest(
        &self,
        sandbox: &SandboxHandle,
        manifest: &TaskManifest,
    ) -> Result<(), FleetliftError>;

    /// Poll the agent's current status document. Returns `None` if the
    /// agent has not written one yet (e.g. still provisioning internally).
    async fn poll_status(&self, sandbox: &SandboxHandle) -> Result<Option<AgentStatus>, FleetliftError>;

    /// Read the terminal result once the polled status reaches a
    /// terminal phase.
    async fn read_result(&self, sandbox: &SandboxHandle) -> Result<Vec<RepoResult>, FleetliftError>;

    /// Deliver a steering instruction by writing it to the control-file
    /// location the agent claims via rename (§8 testable property 3).
    async fn submit_steering(
        &self,
        sandbox: &SandboxHandle,
        instruction: &SteeringInstruction,
    ) -> Result<(), FleetliftError>;

    /// Execute a command inside the sandbox and capture its output.
    async fn exec(&self, sandbox: &SandboxHandle, command: &str, args: &[String]) -> Result<ExecOutput, FleetliftError>;

    /// Execute a shell command line inside the sandbox (for verifier
    /// commands and setup steps, which are shell strings per §3.1).
    async fn exec_shell(&self, sandbox: &SandboxHandle, command_line: &str) -> Result<ExecOutput, FleetliftError>;

    /// Copy a file or directory from the host into the sandbox.
    async fn copy_to(&self, sandbox: &SandboxHandle, host_path: &str, sandbox_path: &str) -> Result<(), FleetliftError>;

    /// Copy a file or directory out of the sandbox to the host.
    async fn copy_from(&self, sandbox: &SandboxHandle, sandbox_path: &str, host_path: &str) -> Result<(), FleetliftError>;

    /// Whether the sandbox's supervised process is still alive.
    async fn status(&self, sandbox: &SandboxHandle) -> Result<SandboxLifecycleStatus, FleetliftError>;

    /// Release every resource associated with the sandbox. Must be
    /// idempotent and must run on every exit path, including
    /// cancellation (§4.1 Cleanup, §8 testable property 7).
    async fn cleanup(&self, sandbox: &SandboxHandle) -> Result<(), FleetliftError>;
}

/// Output of an in-sandbox command execution.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Coarse liveness of a provisioned sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxLifecycleStatus {
    Running,
    Exited(i32),
    Gone,
}

/// Pull-request creation (§4.4 step 7). A pure shell-out to Git/GitHub
/// tooling; explicitly out of scope to implement concretely, but the
/// engine depends on this trait so a group workflow can call it without
/// knowing which forge is in play.
#[async_trait]
pub trait PullRequestCreator: Send + Sync {
    async fn create_pull_request(
        &self,
        repo_url: &str,
        branch: &str,
        title: &str,
        body: &str,
        labels: &[String],
        reviewers: &[String],
    ) -> Result<PullRequestInfo, PrError>;
}

/// Persisted, keyed knowledge-item storage (§4.6, §6.3) outliving any
/// single workflow instance.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn list(&self, tags: &[String]) -> Result<Vec<KnowledgeItem>, FleetliftError>;
    async fn put(&self, item: KnowledgeItem) -> Result<(), FleetliftError>;
    async fn touch(&self, id: &str, now: chrono::DateTime<chrono::Utc>) -> Result<(), FleetliftError>;
}
