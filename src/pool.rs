//! Bounded per-stage worker pool.
//!
//! Tasks are driven through `buffer_unordered(parallelism)`, so at most
//! `parallelism` external processes run at once. Once any task reports a
//! fatal condition the [`AbortSignal`] is raised: queued tasks are not
//! started, tasks already running finish normally.

use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    Succeeded,
    Failed,
    /// Not attempted, e.g. its tool is missing.
    Skipped,
    /// Stop dispatching; the message becomes the abort reason.
    Fatal(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolTally {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Tasks never started because the pool was aborted.
    pub not_started: u64,
    pub fatal: Option<String>,
}

/// Runs `task` for every item with at most `parallelism` in flight.
pub async fn run_bounded<T, F, Fut>(
    items: Vec<T>,
    parallelism: usize,
    abort: &AbortSignal,
    task: F,
) -> PoolTally
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = TaskResult>,
{
    let parallelism = parallelism.max(1);
    debug!(tasks = items.len(), parallelism, "Dispatching tasks");
    let task = &task;
    stream::iter(items)
        .map(|item| async move {
            if abort.is_raised() {
                return None;
            }
            Some(task(item).await)
        })
        .buffer_unordered(parallelism)
        .fold(PoolTally::default(), |mut tally, result| async move {
            match result {
                None => tally.not_started += 1,
                Some(TaskResult::Skipped) => tally.skipped += 1,
                Some(TaskResult::Succeeded) => {
                    tally.attempted += 1;
                    tally.succeeded += 1;
                }
                Some(TaskResult::Failed) => {
                    tally.attempted += 1;
                    tally.failed += 1;
                }
                Some(TaskResult::Fatal(reason)) => {
                    tally.attempted += 1;
                    tally.failed += 1;
                    warn!(reason = %reason, "Fatal task result, no further tasks will start");
                    abort.raise();
                    tally.fatal.get_or_insert(reason);
                }
            }
            tally
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn never_exceeds_parallelism() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let abort = AbortSignal::new();

        let tally = run_bounded((0..20).collect(), 3, &abort, |_: i32| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                TaskResult::Succeeded
            }
        })
        .await;

        assert_eq!(tally.succeeded, 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn counts_each_result_kind() {
        let abort = AbortSignal::new();
        let tally = run_bounded(vec![0, 1, 2, 3], 2, &abort, |i: i32| async move {
            match i {
                0 | 1 => TaskResult::Succeeded,
                2 => TaskResult::Failed,
                _ => TaskResult::Skipped,
            }
        })
        .await;
        assert_eq!(tally.attempted, 3);
        assert_eq!(tally.succeeded, 2);
        assert_eq!(tally.failed, 1);
        assert_eq!(tally.skipped, 1);
        assert!(tally.fatal.is_none());
    }

    #[tokio::test]
    async fn fatal_result_stops_dispatch() {
        let abort = AbortSignal::new();
        let tally = run_bounded((0..10).collect(), 1, &abort, |i: i32| async move {
            if i == 2 {
                TaskResult::Fatal("root vanished".into())
            } else {
                TaskResult::Succeeded
            }
        })
        .await;
        assert!(abort.is_raised());
        assert_eq!(tally.fatal.as_deref(), Some("root vanished"));
        assert_eq!(tally.succeeded, 2);
        assert_eq!(tally.not_started, 7);
    }
}
