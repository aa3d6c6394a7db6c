//! Child-process lifecycle helper, grounded in the teacher's
//! `application::mcp_process_manager::McpProcessManager` pattern (spawn,
//! graceful stop with a timeout, force kill) and adapted for one-shot
//! commands (clone, transform, verify) rather than long-lived servers.

use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::warn;

use crate::agent::shutdown::Shutdown;
use crate::domain::ports::ExecOutput;

/// Grace period between SIGTERM and SIGKILL when a run is cancelled
/// mid-flight (§4.4 Contract: "graceful cancellation of the current
/// step").
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `cmd` to completion, capturing stdout/stderr, but abort it
/// (SIGTERM, then SIGKILL after a grace period) if `shutdown` is
/// requested before it exits.
pub async fn run_to_completion(mut cmd: Command, shutdown: &Shutdown) -> std::io::Result<ExecOutput> {
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn()?;

    tokio::select! {
        status = wait_with_output(&mut child) => status,
        () = wait_for_shutdown(shutdown) => {
            warn!("shutdown requested mid-command, terminating child process");
            terminate_gracefully(&mut child).await;
            Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "cancelled by shutdown"))
        }
    }
}

async fn wait_for_shutdown(shutdown: &Shutdown) {
    loop {
        if shutdown.wait(Duration::from_millis(200)).await {
            return;
        }
    }
}

async fn wait_with_output(child: &mut Child) -> std::io::Result<ExecOutput> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (stdout_fut, stderr_fut) = (
        read_all(stdout),
        read_all(stderr),
    );
    let (stdout_bytes, stderr_bytes) = tokio::join!(stdout_fut, stderr_fut);
    let status = child.wait().await?;

    Ok(ExecOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
    })
}

async fn read_all<R: tokio::io::AsyncRead + Unpin>(reader: Option<R>) -> Vec<u8> {
    use tokio::io::AsyncReadExt;
    let mut buf = Vec::new();
    if let Some(mut r) = reader {
        let _ = r.read_to_end(&mut buf).await;
    }
    buf
}

/// Send SIGTERM, wait up to `GRACEFUL_STOP_TIMEOUT` for exit, then
/// SIGKILL (via `Child::kill`) if it is still running.
async fn terminate_gracefully(child: &mut Child) {
    if let Some(id) = child.id() {
        if let Err(err) = kill(Pid::from_raw(id as i32), Signal::SIGTERM) {
            warn!(error = %err, "failed to send SIGTERM to child process");
        }
    }

    match tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("child process did not exit after SIGTERM, sending SIGKILL");
            let _ = child.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo hello; exit 3");
        let shutdown = Shutdown::new();
        let output = run_to_completion(cmd, &shutdown).await.unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn shutdown_request_aborts_a_long_running_command() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 30");
        let shutdown = Shutdown::new();
        let handle = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.request();
        });

        let result = run_to_completion(cmd, &shutdown).await;
        assert!(result.is_err());
    }
}
