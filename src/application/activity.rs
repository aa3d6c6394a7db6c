//! Activity runner (§4.1 "Retries and timeouts"): wraps a single workflow
//! activity (provision, clone, run, verify, collect, PR-create) with
//! exponential backoff retries and a heartbeat-based timeout.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use tracing::warn;

use crate::domain::error::FleetliftError;

/// Retry policy for one activity kind. Defaults match §4.1's "typical:
/// 3 attempts, 1s→60s backoff".
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
        }
    }
}

/// Heartbeat-based timeout tracker for a long-running activity (§4.1:
/// "a missed heartbeat beyond the heartbeat timeout marks the attempt
/// failed and triggers retry"). Typical timeout 2-5 minutes.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatTimeout {
    pub interval: Duration,
}

impl Default for HeartbeatTimeout {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
        }
    }
}

/// Handle a long-running activity uses to signal it is still making
/// progress, so `run_with_heartbeat` can reset its idle deadline instead
/// of enforcing one flat deadline over the whole operation (§4.1,
/// §5 "a missed heartbeat... marks the attempt failed"). Each call to
/// `beat()` pushes the deadline out by another `HeartbeatTimeout::interval`.
#[derive(Clone)]
pub struct Heartbeat {
    notify: std::sync::Arc<tokio::sync::Notify>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            notify: std::sync::Arc::new(tokio::sync::Notify::new()),
        }
    }

    /// Record a heartbeat. Safe to call from inside the polling loop this
    /// heartbeat was handed to, even if no one is currently awaiting it:
    /// `Notify` stores a permit for the next `notified().await`.
    pub fn beat(&self) {
        self.notify.notify_one();
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a single activity with the retry policy above, classifying
/// errors via `FleetliftError::is_retryable` so validation-type failures
/// (never retryable) fail fast while transient provisioning/clone/
/// transformation failures get the backoff treatment.
pub struct ActivityRunner {
    policy: RetryPolicy,
}

impl ActivityRunner {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Execute `op`, retrying on retryable errors up to `max_attempts`
    /// times with exponential backoff between attempts.
    pub async fn run<F, Fut, T>(&self, activity_name: &str, mut op: F) -> Result<T, FleetliftError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FleetliftError>>,
    {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.policy.initial_interval)
            .with_max_interval(self.policy.max_interval)
            .with_max_elapsed_time(None)
            .build();

        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.policy.max_attempts => {
                    let wait = backoff.next_backoff().unwrap_or(self.policy.max_interval);
                    warn!(
                        activity = activity_name,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        error = %err,
                        wait_secs = wait.as_secs(),
                        "activity failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Run `op`, failing it as a timeout only once `timeout.interval`
    /// elapses with *no* heartbeat recorded on `heartbeat` — not over the
    /// operation's total runtime. `op` (or whatever it polls) is expected
    /// to call `heartbeat.beat()` periodically while it is still making
    /// progress; each call pushes the deadline out, so a long but healthy
    /// wait (e.g. HITL `awaiting_approval`) never trips this timeout on
    /// its own, while a genuinely stalled activity does.
    pub async fn run_with_heartbeat<F, Fut, T>(
        &self,
        activity_name: &str,
        timeout: HeartbeatTimeout,
        heartbeat: &Heartbeat,
        mut op: F,
    ) -> Result<T, FleetliftError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FleetliftError>>,
    {
        let work = self.run(activity_name, &mut op);
        tokio::pin!(work);

        loop {
            tokio::select! {
                result = &mut work => return result,
                () = tokio::time::sleep(timeout.interval) => {
                    warn!(activity = activity_name, "heartbeat timeout elapsed with no progress");
                    return Err(FleetliftError::Transformation(
                        crate::domain::error::TransformationError::Timeout(timeout.interval),
                    ));
                }
                () = heartbeat.notify.notified() => {
                    // Progress observed; loop back around to restart the
                    // idle-deadline sleep above.
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let mut policy = RetryPolicy::default();
        policy.initial_interval = Duration::from_millis(1);
        policy.max_interval = Duration::from_millis(5);
        let runner = ActivityRunner::new(policy);
        let attempts = Arc::new(AtomicU32::new(0));

        let result = runner
            .run("clone", || {
                let attempts = Arc::clone(&attempts);
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        Err(FleetliftError::Clone(crate::domain::error::CloneError::CloneFailed {
                            repo: "widgets".into(),
                            reason: "timeout".into(),
                        }))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn does_not_retry_non_retryable_errors() {
        let runner = ActivityRunner::new(RetryPolicy::default());
        let attempts = Arc::new(AtomicU32::new(0));

        let result: Result<(), FleetliftError> = runner
            .run("validate", || {
                let attempts = Arc::clone(&attempts);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(FleetliftError::Validation(
                        crate::domain::error::ValidationError::EmptyRepositories,
                    ))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn heartbeat_timeout_fires_when_no_beats_arrive() {
        let runner = ActivityRunner::new(RetryPolicy::default());
        let heartbeat = Heartbeat::new();
        let timeout = HeartbeatTimeout {
            interval: Duration::from_millis(20),
        };

        let result: Result<(), FleetliftError> = runner
            .run_with_heartbeat("stalled", timeout, &heartbeat, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(
            result,
            Err(FleetliftError::Transformation(crate::domain::error::TransformationError::Timeout(_)))
        ));
    }

    #[tokio::test]
    async fn heartbeats_reset_the_idle_deadline() {
        let runner = ActivityRunner::new(RetryPolicy::default());
        let heartbeat = Heartbeat::new();
        let timeout = HeartbeatTimeout {
            interval: Duration::from_millis(30),
        };

        let beats = Arc::new(AtomicU32::new(0));
        let beats_clone = Arc::clone(&beats);
        let heartbeat_clone = heartbeat.clone();
        let beater = tokio::spawn(async move {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                heartbeat_clone.beat();
                beats_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let result: Result<u32, FleetliftError> = runner
            .run_with_heartbeat("healthy_wait", timeout, &heartbeat, || async {
                tokio::time::sleep(Duration::from_millis(60)).await;
                Ok(7)
            })
            .await;

        beater.await.unwrap();
        assert_eq!(result.unwrap(), 7);
        assert!(beats.load(Ordering::SeqCst) > 0);
    }
}
