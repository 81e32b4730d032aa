//! Concurrency governor for parallel branches.
//!
//! A bounded worker pool over a `JoinSet`: up to `N` jobs run at once, and
//! each completion admits the next pending job. Once a job reports failure
//! (or the run is cancelled) the governor stops admitting; jobs already
//! running are never pre-empted and are always awaited.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// Outcome of a governed batch.
#[derive(Debug)]
pub struct GovernorReport<T> {
    /// `(job index, output)` in completion order.
    pub outcomes: Vec<(usize, T)>,
    /// Jobs that panicked or were aborted by the runtime.
    pub aborted: Vec<JoinError>,
    /// Highest number of jobs observed running at the same time.
    pub peak_concurrency: usize,
    /// Indices of jobs never started because admission stopped.
    pub not_admitted: Vec<usize>,
}

/// Caps how many parallel branches run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyGovernor {
    limit: usize,
}

/// Decrements the active counter even if the job panics.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyGovernor {
    /// `N = min(requested, workflow cap, hard cap)`, at least 1. The requested
    /// value defaults to the number of branches.
    pub fn effective_limit(
        requested: Option<usize>,
        branch_count: usize,
        workflow_cap: Option<usize>,
        hard_cap: usize,
    ) -> usize {
        let requested = requested.unwrap_or(branch_count);
        requested
            .min(workflow_cap.unwrap_or(usize::MAX))
            .min(hard_cap)
            .max(1)
    }

    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Run `jobs` with at most `limit` in flight.
    ///
    /// `is_failure` is checked on every finished job; a failure (or a panic)
    /// cancels `abort`, which stops further admission. Cancelling `abort`
    /// from outside has the same effect.
    pub async fn run<T, F, Fut, P>(
        &self,
        jobs: Vec<F>,
        abort: CancellationToken,
        is_failure: P,
    ) -> GovernorReport<T>
    where
        F: FnOnce(usize) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        P: Fn(&T) -> bool,
    {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut pending = jobs.into_iter().enumerate();
        let mut join_set = JoinSet::new();
        let mut outcomes = Vec::new();
        let mut aborted = Vec::new();

        let mut admit = |join_set: &mut JoinSet<(usize, T)>| -> bool {
            if abort.is_cancelled() {
                return false;
            }
            let Some((index, job)) = pending.next() else {
                return false;
            };
            let fut = job(index);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            join_set.spawn(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                let _guard = ActiveGuard(active);
                (index, fut.await)
            });
            true
        };

        for _ in 0..self.limit {
            if !admit(&mut join_set) {
                break;
            }
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, value)) => {
                    if is_failure(&value) {
                        abort.cancel();
                    }
                    outcomes.push((index, value));
                }
                Err(error) => {
                    tracing::error!(%error, "parallel branch task aborted");
                    abort.cancel();
                    aborted.push(error);
                }
            }
            admit(&mut join_set);
        }

        let not_admitted = pending.map(|(index, _)| index).collect();
        GovernorReport {
            outcomes,
            aborted,
            peak_concurrency: peak.load(Ordering::SeqCst),
            not_admitted,
        }
    }
}
