//! Verifying phase (§4.4 step 4): run each repo's verifier commands and
//! capture a structured pass/fail outcome.

use tokio::process::Command;

use crate::agent::process::run_to_completion;
use crate::agent::shutdown::Shutdown;
use crate::domain::error::{FleetliftError, VerifierError};
use crate::domain::models::result::VerifierResult;
use crate::domain::models::task::VerifierSpec;

/// Each verifier's captured stdout+stderr is truncated to this many
/// characters in the stored result (§4.4 step 4: "truncated stdout+stderr").
const OUTPUT_TAIL_CHARS: usize = 4000;

/// Run every verifier against `repo_dir`, in order. An empty command is
/// an immediate failure rather than being skipped (§4.4 step 4).
pub async fn run_verifiers(verifiers: &[VerifierSpec], repo_dir: &str, shutdown: &Shutdown) -> Result<Vec<VerifierResult>, FleetliftError> {
    let mut results = Vec::with_capacity(verifiers.len());
    for verifier in verifiers {
        results.push(run_one(verifier, repo_dir, shutdown).await?);
    }
    Ok(results)
}

async fn run_one(verifier: &VerifierSpec, repo_dir: &str, shutdown: &Shutdown) -> Result<VerifierResult, FleetliftError> {
    if verifier.command.trim().is_empty() {
        return Err(VerifierError::EmptyCommand {
            name: verifier.name.clone(),
        }
        .into());
    }

    let mut cmd = Command::new("sh");
    cmd.args(["-c", &verifier.command]).current_dir(repo_dir);
    for arg in &verifier.args {
        cmd.arg(arg);
    }

    let output = run_to_completion(cmd, shutdown).await.map_err(|e| VerifierError::Failed(vec![format!("{}: {e}", verifier.name)]))?;

    let combined = format!("{}{}", output.stdout, output.stderr);
    let tail: String = combined.chars().rev().take(OUTPUT_TAIL_CHARS).collect::<Vec<_>>().into_iter().rev().collect();

    Ok(VerifierResult {
        name: verifier.name.clone(),
        passed: output.exit_code == 0,
        exit_code: output.exit_code,
        output_tail: tail,
    })
}

/// Whether every verifier in the set passed — used to gate PR creation
/// and to determine group-level verifier failure.
pub fn all_passed(results: &[VerifierResult]) -> bool {
    results.iter().all(|r| r.passed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passing_verifier_reports_success() {
        let verifier = VerifierSpec {
            name: "smoke".into(),
            command: "echo ok".into(),
            args: vec![],
        };
        let shutdown = Shutdown::new();
        let results = run_verifiers(&[verifier], "/tmp", &shutdown).await.unwrap();
        assert!(results[0].passed);
        assert!(all_passed(&results));
    }

    #[tokio::test]
    async fn failing_verifier_reports_exit_code() {
        let verifier = VerifierSpec {
            name: "smoke".into(),
            command: "exit 2".into(),
            args: vec![],
        };
        let shutdown = Shutdown::new();
        let results = run_verifiers(&[verifier], "/tmp", &shutdown).await.unwrap();
        assert!(!results[0].passed);
        assert_eq!(results[0].exit_code, 2);
        assert!(!all_passed(&results));
    }

    #[tokio::test]
    async fn empty_command_is_an_immediate_failure() {
        let verifier = VerifierSpec {
            name: "broken".into(),
            command: String::new(),
            args: vec![],
        };
        let shutdown = Shutdown::new();
        let err = run_verifiers(&[verifier], "/tmp", &shutdown).await.unwrap_err();
        assert!(matches!(err, FleetliftError::Verifier(VerifierError::EmptyCommand { .. })));
    }

    #[tokio::test]
    async fn long_output_is_truncated() {
        let verifier = VerifierSpec {
            name: "noisy".into(),
            command: "yes x | head -c 10000".into(),
            args: vec![],
        };
        let shutdown = Shutdown::new();
        let results = run_verifiers(&[verifier], "/tmp", &shutdown).await.unwrap();
        assert!(results[0].output_tail.chars().count() <= OUTPUT_TAIL_CHARS);
    }
}
