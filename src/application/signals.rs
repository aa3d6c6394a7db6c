//! Workflow signals (§4.1, §6.2): the five external mutations a client
//! can send into a running transform workflow. Generalized from a
//! command-bus/envelope idiom into a FIFO channel per workflow instance,
//! since a workflow has exactly one signal consumer (itself) rather than
//! many handler types to route across.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Unique identifier for a signal, used for idempotent delivery logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalId(pub Uuid);

impl SignalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SignalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The five signals the client API can send into a running workflow
/// (§4.1 Contract: "Signals: approve, reject, cancel, steer(prompt),
/// continue(skip_remaining: bool)").
#[derive(Debug, Clone)]
pub enum Signal {
    Approve,
    Reject { reason: Option<String> },
    Cancel,
    Steer { prompt: String },
    Continue { skip_remaining: bool },
}

/// A signal together with delivery metadata, submitted through
/// `WorkflowHandle::send_signal`.
#[derive(Debug, Clone)]
pub struct SignalEnvelope {
    pub id: SignalId,
    pub task_id: String,
    pub group_name: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub signal: Signal,
}

impl SignalEnvelope {
    pub fn new(task_id: impl Into<String>, group_name: Option<String>, signal: Signal) -> Self {
        Self {
            id: SignalId::new(),
            task_id: task_id.into(),
            group_name,
            submitted_at: Utc::now(),
            signal,
        }
    }
}

/// Per-workflow FIFO signal queue. One `SignalQueue` is owned by exactly
/// one running workflow instance; the client API's sender half is the
/// only other holder, matching §3.8's "single execution thread" policy —
/// the workflow task is the sole consumer.
#[derive(Debug)]
pub struct SignalQueue {
    sender: tokio::sync::mpsc::UnboundedSender<SignalEnvelope>,
    receiver: tokio::sync::mpsc::UnboundedReceiver<SignalEnvelope>,
}

impl SignalQueue {
    pub fn new() -> Self {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        Self { sender, receiver }
    }

    pub fn sender(&self) -> SignalSender {
        SignalSender {
            sender: self.sender.clone(),
        }
    }

    /// Drain every signal currently queued, preserving FIFO order
    /// (§8 testable property 12: signal FIFO ordering).
    pub fn drain(&mut self) -> Vec<SignalEnvelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = self.receiver.try_recv() {
            out.push(envelope);
        }
        out
    }

    /// Wait for at least one signal, then drain whatever else has
    /// accumulated in the meantime.
    pub async fn recv(&mut self) -> Option<SignalEnvelope> {
        self.receiver.recv().await
    }
}

impl Default for SignalQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable handle used by the client API to enqueue signals without
/// owning the receiving half.
#[derive(Debug, Clone)]
pub struct SignalSender {
    sender: tokio::sync::mpsc::UnboundedSender<SignalEnvelope>,
}

impl SignalSender {
    pub fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalEnvelope> {
        self.sender.send(envelope.clone()).map_err(|_| envelope)
    }
}

/// Cooperative cancellation flag raised the instant a `Signal::Cancel`
/// is submitted, independent of the signal queue's FIFO delivery. A
/// `TransformWorkflow` hands a clone to every group it runs so an
/// in-flight group (and the scheduler's dispatch loop) can notice a
/// cancel within one poll interval instead of it only being observed
/// once every group has already finished (§4.1 cancel semantics).
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves immediately if already cancelled; otherwise waits for
    /// the next `cancel()` call. Meant to sit in a `select!` alongside
    /// whatever work is in flight.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signals_are_delivered_in_fifo_order() {
        let mut queue = SignalQueue::new();
        let sender = queue.sender();

        sender
            .send(SignalEnvelope::new("t1", None, Signal::Approve))
            .unwrap();
        sender
            .send(SignalEnvelope::new(
                "t1",
                None,
                Signal::Steer {
                    prompt: "adjust".into(),
                },
            ))
            .unwrap();
        sender.send(SignalEnvelope::new("t1", None, Signal::Cancel)).unwrap();

        let drained = queue.drain();
        assert_eq!(drained.len(), 3);
        assert!(matches!(drained[0].signal, Signal::Approve));
        assert!(matches!(drained[1].signal, Signal::Steer { .. }));
        assert!(matches!(drained[2].signal, Signal::Cancel));
    }

    #[tokio::test]
    async fn recv_waits_for_a_signal() {
        let mut queue = SignalQueue::new();
        let sender = queue.sender();
        sender.send(SignalEnvelope::new("t1", None, Signal::Cancel)).unwrap();
        let envelope = queue.recv().await.unwrap();
        assert!(matches!(envelope.signal, Signal::Cancel));
    }

    #[tokio::test]
    async fn cancel_token_wakes_a_pending_waiter() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        token.cancel();
        handle.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_token_cancelled_returns_immediately_once_set() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_millis(50), token.cancelled())
            .await
            .expect("cancelled() must not block once already cancelled");
    }
}
