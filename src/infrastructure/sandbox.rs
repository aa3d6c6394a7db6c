//! Reference `SandboxProvider` (§4.7): provisions a sandbox as a plain OS
//! subdirectory plus a supervised `fleetlift-agent` child process,
//! grounded in the teacher's `McpProcessManager` pattern (spawn, track,
//! graceful-then-forced kill). Suitable for tests and single-machine
//! operation; a production container/cluster provider is out of scope
//! (spec.md §1 Non-goals).

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::agent::protocol::{read_if_present, write_atomic, ControlPaths};
use crate::domain::error::{FleetliftError, ProtocolError, ProvisioningError};
use crate::domain::models::manifest::TaskManifest;
use crate::domain::models::result::RepoResult;
use crate::domain::models::status::AgentStatus;
use crate::domain::models::steering::SteeringInstruction;
use crate::domain::ports::{ExecOutput, SandboxHandle, SandboxLifecycleStatus, SandboxProvider};
use crate::infrastructure::config::SandboxConfig;

/// Grace period between SIGTERM and SIGKILL when cleaning up a sandbox
/// whose agent process is still running.
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);

struct Supervised {
    workspace: PathBuf,
    child: Child,
}

/// Sandboxes keyed by handle id, each owning a workspace directory and a
/// supervised agent process. Cheaply clonable (`Arc`-backed state) so the
/// group scheduler can hand one copy to each concurrently-running group
/// (§4.3).
#[derive(Clone)]
pub struct LocalProcessSandboxProvider {
    config: SandboxConfig,
    sandboxes: Arc<Mutex<HashMap<String, Supervised>>>,
}

impl LocalProcessSandboxProvider {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            sandboxes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn workspace_for(&self, sandbox: &SandboxHandle) -> Result<PathBuf, FleetliftError> {
        self.sandboxes
            .lock()
            .await
            .get(&sandbox.0)
            .map(|s| s.workspace.clone())
            .ok_or_else(|| ProvisioningError::Refused(format!("unknown sandbox `{}`", sandbox.0)).into())
    }

    async fn control_paths(&self, sandbox: &SandboxHandle) -> Result<ControlPaths, FleetliftError> {
        let workspace = self.workspace_for(sandbox).await?;
        Ok(ControlPaths::new(workspace.join(&self.config.control_dir_name)))
    }
}

#[async_trait]
impl SandboxProvider for LocalProcessSandboxProvider {
    async fn provision(&self, task_id: &str, group_name: &str) -> Result<SandboxHandle, FleetliftError> {
        let id = format!("{task_id}-{group_name}");
        let workspace = PathBuf::from(&self.config.base_dir).join(task_id).join(group_name);
        let control_dir = workspace.join(&self.config.control_dir_name);

        tokio::fs::create_dir_all(&control_dir)
            .await
            .map_err(|e| ProvisioningError::Refused(e.to_string()))?;

        let mut cmd = Command::new(&self.config.agent_binary);
        cmd.arg(&control_dir);
        cmd.current_dir(&workspace);
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        let child = cmd.spawn().map_err(|e| ProvisioningError::Refused(e.to_string()))?;

        info!(task_id, group_name, pid = ?child.id(), "provisioned local sandbox");
        self.sandboxes
            .lock()
            .await
            .insert(id.clone(), Supervised { workspace, child });
        Ok(SandboxHandle(id))
    }

    async fn submit_manifest(&self, sandbox: &SandboxHandle, manifest: &TaskManifest) -> Result<(), FleetliftError> {
        let control = self.control_paths(sandbox).await?;
        write_atomic(&control.manifest, manifest).await
    }

    async fn poll_status(&self, sandbox: &SandboxHandle) -> Result<Option<AgentStatus>, FleetliftError> {
        let control = self.control_paths(sandbox).await?;
        read_if_present(&control.status).await
    }

    async fn read_result(&self, sandbox: &SandboxHandle) -> Result<Vec<RepoResult>, FleetliftError> {
        let control = self.control_paths(sandbox).await?;
        read_if_present(&control.result).await?.ok_or_else(|| {
            ProtocolError::Malformed {
                kind: "result",
                reason: "terminal phase reached but no result document was written".into(),
            }
            .into()
        })
    }

    async fn submit_steering(&self, sandbox: &SandboxHandle, instruction: &SteeringInstruction) -> Result<(), FleetliftError> {
        let control = self.control_paths(sandbox).await?;
        write_atomic(&control.steering, instruction).await
    }

    async fn exec(&self, sandbox: &SandboxHandle, command: &str, args: &[String]) -> Result<ExecOutput, FleetliftError> {
        let workspace = self.workspace_for(sandbox).await?;
        let mut cmd = Command::new(command);
        cmd.args(args).current_dir(&workspace);
        run_capturing(cmd).await
    }

    async fn exec_shell(&self, sandbox: &SandboxHandle, command_line: &str) -> Result<ExecOutput, FleetliftError> {
        let workspace = self.workspace_for(sandbox).await?;
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command_line).current_dir(&workspace);
        run_capturing(cmd).await
    }

    async fn copy_to(&self, sandbox: &SandboxHandle, host_path: &str, sandbox_path: &str) -> Result<(), FleetliftError> {
        let workspace = self.workspace_for(sandbox).await?;
        let dest = workspace.join(sandbox_path.trim_start_matches('/'));
        copy_recursive(host_path, dest.to_string_lossy().as_ref()).await
    }

    async fn copy_from(&self, sandbox: &SandboxHandle, sandbox_path: &str, host_path: &str) -> Result<(), FleetliftError> {
        let workspace = self.workspace_for(sandbox).await?;
        let src = workspace.join(sandbox_path.trim_start_matches('/'));
        copy_recursive(src.to_string_lossy().as_ref(), host_path).await
    }

    async fn status(&self, sandbox: &SandboxHandle) -> Result<SandboxLifecycleStatus, FleetliftError> {
        let mut sandboxes = self.sandboxes.lock().await;
        let Some(supervised) = sandboxes.get_mut(&sandbox.0) else {
            return Ok(SandboxLifecycleStatus::Gone);
        };
        match supervised.child.try_wait() {
            Ok(Some(status)) => Ok(SandboxLifecycleStatus::Exited(status.code().unwrap_or(-1))),
            Ok(None) => Ok(SandboxLifecycleStatus::Running),
            Err(_) => Ok(SandboxLifecycleStatus::Gone),
        }
    }

    async fn cleanup(&self, sandbox: &SandboxHandle) -> Result<(), FleetliftError> {
        let Some(mut supervised) = self.sandboxes.lock().await.remove(&sandbox.0) else {
            return Ok(());
        };

        if matches!(supervised.child.try_wait(), Ok(None)) {
            if let Some(id) = supervised.child.id() {
                if let Err(err) = kill(Pid::from_raw(id as i32), Signal::SIGTERM) {
                    warn!(sandbox = %sandbox.0, error = %err, "failed to send SIGTERM to agent process");
                }
            }
            if tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, supervised.child.wait()).await.is_err() {
                warn!(sandbox = %sandbox.0, "agent process did not exit after SIGTERM, sending SIGKILL");
                let _ = supervised.child.kill().await;
            }
        }

        if self.config.debug_no_cleanup {
            info!(sandbox = %sandbox.0, workspace = %supervised.workspace.display(), "debug_no_cleanup set, leaving workspace on disk");
        } else {
            let _ = tokio::fs::remove_dir_all(&supervised.workspace).await;
        }
        Ok(())
    }
}

async fn run_capturing(mut cmd: Command) -> Result<ExecOutput, FleetliftError> {
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    let output = cmd
        .output()
        .await
        .map_err(|e| ProvisioningError::Refused(e.to_string()))?;
    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Shells out to `cp -r`, matching the teacher's general preference for
/// invoking real host tools over hand-rolled filesystem walks.
async fn copy_recursive(src: &str, dest: &str) -> Result<(), FleetliftError> {
    if let Some(parent) = std::path::Path::new(dest).parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ProvisioningError::Refused(e.to_string()))?;
    }
    let output = Command::new("cp")
        .args(["-r", src, dest])
        .output()
        .await
        .map_err(|e| ProvisioningError::Refused(e.to_string()))?;
    if !output.status.success() {
        return Err(ProvisioningError::Refused(String::from_utf8_lossy(&output.stderr).to_string()).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: &std::path::Path) -> SandboxConfig {
        SandboxConfig {
            base_dir: base.to_string_lossy().to_string(),
            control_dir_name: ".fleetlift".to_string(),
            agent_binary: "true".to_string(),
            debug_no_cleanup: false,
        }
    }

    #[tokio::test]
    async fn provision_creates_workspace_and_control_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = LocalProcessSandboxProvider::new(config(tmp.path()));
        let handle = provider.provision("t1", "g1").await.unwrap();
        assert_eq!(handle.0, "t1-g1");

        let workspace = provider.workspace_for(&handle).await.unwrap();
        assert!(workspace.join(".fleetlift").is_dir());
        provider.cleanup(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn read_result_before_agent_writes_one_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = LocalProcessSandboxProvider::new(config(tmp.path()));
        let handle = provider.provision("t1", "g1").await.unwrap();
        let err = provider.read_result(&handle).await.unwrap_err();
        assert!(matches!(err, FleetliftError::Protocol(_)));
        provider.cleanup(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_and_removes_workspace_by_default() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = LocalProcessSandboxProvider::new(config(tmp.path()));
        let handle = provider.provision("t1", "g1").await.unwrap();
        let workspace = provider.workspace_for(&handle).await.unwrap();

        provider.cleanup(&handle).await.unwrap();
        assert!(!workspace.exists());
        provider.cleanup(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn debug_no_cleanup_preserves_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(tmp.path());
        cfg.debug_no_cleanup = true;
        let provider = LocalProcessSandboxProvider::new(cfg);
        let handle = provider.provision("t1", "g1").await.unwrap();
        let workspace = provider.workspace_for(&handle).await.unwrap();

        provider.cleanup(&handle).await.unwrap();
        assert!(workspace.exists());
    }

    #[tokio::test]
    async fn status_of_unknown_sandbox_is_gone() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = LocalProcessSandboxProvider::new(config(tmp.path()));
        let status = provider.status(&SandboxHandle("nope".into())).await.unwrap();
        assert_eq!(status, SandboxLifecycleStatus::Gone);
    }
}
