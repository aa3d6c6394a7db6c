//! Steering loop primitives (§4.5): building a re-run prompt from a
//! steering correction, and waiting for the next instruction to claim.
//! The loop itself — re-running execute/verify/collect on each `steer`
//! — is driven by `agent::run` in `mod.rs`, since it needs the full
//! pipeline context those phases share.

use std::path::Path;
use std::time::Duration;

use crate::agent::protocol::claim_steering;
use crate::agent::shutdown::Shutdown;
use crate::domain::models::steering::SteeringInstruction;

/// How often the agent polls for a new steering instruction while
/// `awaiting_input` (§4.4 step 6, §5 "suspension points").
pub const STEERING_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Previous-output truncation length embedded in a re-run prompt
/// (§4.5: "previous run's output truncated to ~4000 characters").
const PREVIOUS_OUTPUT_CHARS: usize = 4000;

/// Wait for the next steering instruction to appear and claim it
/// exactly once. Returns `None` if shutdown is requested first.
pub async fn await_steering_instruction(steering_path: &Path, shutdown: &Shutdown) -> Option<SteeringInstruction> {
    loop {
        if let Ok(Some(instruction)) = claim_steering(steering_path).await {
            return Some(instruction);
        }
        if shutdown.wait(STEERING_POLL_INTERVAL).await {
            return None;
        }
    }
}

/// Build the prompt for a re-run triggered by `steer(prompt)` (§4.5):
/// the original instructions, the iteration number, the steering text,
/// and the previous run's output truncated to ~4000 characters.
pub fn build_steering_prompt(original_prompt: &str, iteration: u32, steer_text: &str, previous_output: &str) -> String {
    let truncated_output = truncate_tail(previous_output, PREVIOUS_OUTPUT_CHARS);
    format!(
        "## Original instructions\n{original_prompt}\n\n\
         ## Steering iteration {iteration}\n{steer_text}\n\n\
         ## Previous run output (truncated)\n{truncated_output}"
    )
}

fn truncate_tail(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().rev().take(max_chars).collect::<Vec<_>>().into_iter().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::protocol::write_atomic;
    use crate::domain::models::steering::SteeringAction;

    #[test]
    fn steering_prompt_includes_iteration_and_text() {
        let prompt = build_steering_prompt("rename foo to bar", 2, "also update the docs", "build succeeded");
        assert!(prompt.contains("iteration 2"));
        assert!(prompt.contains("also update the docs"));
        assert!(prompt.contains("rename foo to bar"));
    }

    #[test]
    fn previous_output_is_truncated() {
        let long_output = "x".repeat(5000);
        let prompt = build_steering_prompt("p", 1, "s", &long_output);
        let tail_section = prompt.split("Previous run output (truncated)\n").nth(1).unwrap();
        assert!(tail_section.chars().count() <= PREVIOUS_OUTPUT_CHARS);
    }

    #[tokio::test]
    async fn await_steering_instruction_claims_once_written() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("steering.json");
        write_atomic(
            &path,
            &SteeringInstruction {
                id: "s1".into(),
                action: SteeringAction::Approve,
                issued_at: chrono::Utc::now(),
            },
        )
        .await
        .unwrap();

        let shutdown = Shutdown::new();
        let instruction = await_steering_instruction(&path, &shutdown).await.unwrap();
        assert!(matches!(instruction.action, SteeringAction::Approve));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn await_steering_instruction_returns_none_on_shutdown() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("steering.json");
        let shutdown = Shutdown::new();
        shutdown.request();
        let instruction = await_steering_instruction(&path, &shutdown).await;
        assert!(instruction.is_none());
    }
}
