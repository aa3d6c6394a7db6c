//! Cooperative shutdown for the in-sandbox agent pipeline (§4.4
//! Contract: "handles SIGTERM/SIGINT with a graceful cancellation of the
//! current step"). `src/bin/fleetlift-agent.rs` wires the OS signal
//! handlers; this type is what the pipeline's loops actually select on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Shared flag plus wakeup, cheap to clone and hand to every phase of
/// the pipeline.
#[derive(Clone)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Request shutdown; wakes every task currently waiting in `wait`.
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, returning early (with `true`) if shutdown is
    /// requested before the duration elapses. Returns `false` if the
    /// sleep completed without a shutdown request.
    pub async fn wait(&self, duration: std::time::Duration) -> bool {
        if self.is_requested() {
            return true;
        }
        tokio::select! {
            () = tokio::time::sleep(duration) => false,
            () = self.notify.notified() => true,
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Install OS signal handlers that call `shutdown.request()` on SIGTERM
/// or SIGINT (§4.4 Contract). Spawned once from `main`; the returned
/// task runs for the lifetime of the process.
pub fn install_signal_handlers(shutdown: Shutdown) {
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, requesting graceful shutdown");
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, requesting graceful shutdown");
            }
        }
        shutdown.request();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_early_on_request() {
        let shutdown = Shutdown::new();
        let handle = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            handle.request();
        });

        let timed_out = shutdown.wait(std::time::Duration::from_secs(5)).await;
        assert!(timed_out);
    }

    #[tokio::test]
    async fn wait_returns_false_when_duration_elapses_first() {
        let shutdown = Shutdown::new();
        let timed_out = shutdown.wait(std::time::Duration::from_millis(5)).await;
        assert!(!timed_out);
    }

    #[test]
    fn already_requested_short_circuits() {
        let shutdown = Shutdown::new();
        shutdown.request();
        assert!(shutdown.is_requested());
    }
}
