//! Bounded-concurrency execution of independent tracker operations.
//!
//! Opt-in and orthogonal to the phase pipeline: a [`BatchExecutor`] drains a
//! list of operations with at most `max_concurrency` in flight, gating each
//! start on a token-bucket [`RateLimiter`]. Every item's outcome is
//! collected; a failure never cancels the rest.

use crate::domain::{IssueKey, NewSubtask, RemoteIssue};
use crate::ports::{IssueTracker, TrackerResult};
use futures::future::join_all;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::debug;

/// Longest single wait for a token; the bucket is re-checked afterwards.
const MAX_WAIT: Duration = Duration::from_secs(60);

/// Token bucket: `rate` tokens per second, holding at most `burst`.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    /// Limiter allowing `requests_per_second` with bursts of `burst`.
    /// A rate that is not a positive finite number disables limiting.
    #[must_use]
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        let rate = if requests_per_second.is_finite() && requests_per_second > 0.0 {
            requests_per_second
        } else {
            0.0
        };
        Self {
            rate,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// A limiter that never waits.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(0.0, 1)
    }

    /// Wait for a token.
    pub async fn acquire(&self) {
        if self.rate <= 0.0 {
            return;
        }
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
                bucket.refilled_at = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                (1.0 - bucket.tokens) / self.rate
            };
            let wait = Duration::try_from_secs_f64(wait).map_or(MAX_WAIT, |w| w.min(MAX_WAIT));
            tokio::time::sleep(wait).await;
        }
    }
}

/// Outcome of one batch item.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem<T> {
    /// Position in the input.
    pub index: usize,
    /// The operation's result.
    pub result: TrackerResult<T>,
}

/// Outcomes of a batch, in input order.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult<T> {
    /// One entry per input operation.
    pub items: Vec<BatchItem<T>>,
}

impl<T> BatchResult<T> {
    /// Number of successful items.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|i| i.result.is_ok()).count()
    }

    /// Number of failed items.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }

    /// Whether every item succeeded.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.items.iter().all(|i| i.result.is_ok())
    }
}

/// Runs independent operations concurrently under a semaphore and a rate
/// limiter.
#[derive(Debug)]
pub struct BatchExecutor {
    semaphore: Semaphore,
    limiter: RateLimiter,
}

impl BatchExecutor {
    /// Executor with at most `max_concurrency` operations in flight.
    #[must_use]
    pub fn new(max_concurrency: usize, limiter: RateLimiter) -> Self {
        Self {
            semaphore: Semaphore::new(max_concurrency.max(1)),
            limiter,
        }
    }

    /// Run every operation and collect the outcomes in input order.
    pub async fn run<T, F, Fut>(&self, operations: Vec<F>) -> BatchResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TrackerResult<T>>,
    {
        let total = operations.len();
        let futures = operations.into_iter().enumerate().map(|(index, operation)| async move {
            let result = match self.semaphore.acquire().await {
                Ok(_permit) => {
                    self.limiter.acquire().await;
                    operation().await
                }
                Err(_) => Err(crate::error::TrackerError::Other(
                    "batch executor shut down".to_string(),
                )),
            };
            BatchItem { index, result }
        });
        let items = join_all(futures).await;
        let result = BatchResult { items };
        debug!(total, succeeded = result.succeeded(), "batch finished");
        result
    }

    /// Fetch several issues.
    pub async fn fetch_issues<T: IssueTracker + ?Sized>(
        &self,
        tracker: &T,
        keys: &[IssueKey],
    ) -> BatchResult<RemoteIssue> {
        let operations: Vec<_> = keys
            .iter()
            .map(|key| move || tracker.get_issue(key))
            .collect();
        self.run(operations).await
    }

    /// Create several subtasks.
    pub async fn create_subtasks<T: IssueTracker + ?Sized>(
        &self,
        tracker: &T,
        subtasks: Vec<NewSubtask>,
    ) -> BatchResult<IssueKey> {
        let operations: Vec<_> = subtasks
            .into_iter()
            .map(|subtask| move || tracker.create_subtask(subtask))
            .collect();
        self.run(operations).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrackerError;
    use crate::ports::memory::{InMemoryTracker, TrackerOperation};
    use crate::ports::RichDoc;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn failures_do_not_cancel_the_batch() {
        let tracker = InMemoryTracker::new("PROJ");
        let epic = tracker.create_epic("Epic").await;
        let a = tracker.insert_story(&epic, "A").await;
        let b = tracker.insert_story(&epic, "B").await;
        let c = tracker.insert_story(&epic, "C").await;
        tracker
            .fail(
                TrackerOperation::GetIssue,
                Some(&b),
                TrackerError::Transient("timeout".into()),
            )
            .await;

        let executor = BatchExecutor::new(2, RateLimiter::unlimited());
        let result = executor.fetch_issues(&tracker, &[a, b, c]).await;

        assert_eq!(result.succeeded(), 2);
        assert_eq!(result.failed(), 1);
        assert!(result.items[1].result.is_err());
        assert_eq!(
            result.items[2].result.as_ref().map(|i| i.summary.as_str()),
            Ok("C")
        );
    }

    #[rstest]
    #[case::nan(f64::NAN)]
    #[case::infinite(f64::INFINITY)]
    #[case::negative(-2.0)]
    #[tokio::test]
    async fn unusable_rates_disable_limiting(#[case] rate: f64) {
        let limiter = RateLimiter::new(rate, 1);
        for _ in 0..3 {
            limiter.acquire().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn tiny_rates_wait_in_bounded_steps() {
        let limiter = RateLimiter::new(1e-30, 1);
        limiter.acquire().await;

        let second = tokio::time::timeout(Duration::from_secs(3600), limiter.acquire()).await;

        assert!(second.is_err());
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let executor = BatchExecutor::new(2, RateLimiter::unlimited());
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let operations: Vec<_> = (0..6)
            .map(|i| {
                let in_flight = &in_flight;
                let peak = &peak;
                move || async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, TrackerError>(i)
                }
            })
            .collect();

        let result = executor.run(operations).await;
        assert!(result.all_succeeded());
        assert!(peak.load(Ordering::SeqCst) <= 2);
        let order: Vec<usize> = result.items.iter().map(|i| i.index).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_spaces_requests() {
        let limiter = RateLimiter::new(10.0, 1);
        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire().await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(290), "{elapsed:?}");
    }

    #[tokio::test]
    async fn creates_subtasks_in_order() {
        let tracker = InMemoryTracker::new("PROJ");
        let epic = tracker.create_epic("Epic").await;
        let story = tracker.insert_story(&epic, "Story").await;
        let subtasks = ["one", "two"]
            .into_iter()
            .map(|name| NewSubtask {
                parent_key: story.clone(),
                summary: name.into(),
                description: RichDoc::plain(""),
                story_points: None,
                assignee: None,
            })
            .collect();

        let executor = BatchExecutor::new(4, RateLimiter::new(100.0, 10));
        let result = executor.create_subtasks(&tracker, subtasks).await;
        assert!(result.all_succeeded());
        let names: Vec<String> = tracker
            .issue(&story)
            .await
            .unwrap()
            .subtasks
            .into_iter()
            .map(|s| s.summary)
            .collect();
        assert_eq!(names, vec!["one".to_string(), "two".to_string()]);
    }
}
