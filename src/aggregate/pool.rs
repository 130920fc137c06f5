//! Worker pool for large groups.
//!
//! Jobs run on a dedicated rayon pool so evaluation never blocks the async
//! runtime. Results come back over a oneshot channel; the caller awaits it
//! with an optional deadline and flips the job's cancel flag on expiry.

use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use super::aggregator::AggregateError;
use crate::data::ValueStore;
use crate::expr::{evaluate_primed, CompiledExpr, GroupContext, RecordView};

/// Records evaluated between deadline checks
pub(crate) const CHUNK_SIZE: usize = 1024;

/// Expiry time plus a cancel flag shared with a running job
#[derive(Debug, Clone)]
pub struct Deadline {
    expires_at: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl Deadline {
    pub fn none() -> Self {
        Self {
            expires_at: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn after(timeout: Duration) -> Self {
        Self {
            expires_at: Some(Instant::now() + timeout),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_option(timeout: Option<Duration>) -> Self {
        timeout.map(Self::after).unwrap_or_else(Self::none)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_expired(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
            || self.expires_at.map(|t| Instant::now() >= t).unwrap_or(false)
    }

    /// Time left; `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|t| t.saturating_duration_since(Instant::now()))
    }
}

/// Pool statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub threads: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub timed_out: u64,
}

/// Counts a job as in flight until dropped, including when the job unwinds
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct WorkerPool {
    pool: rayon::ThreadPool,
    threads: usize,
    in_flight: Arc<AtomicUsize>,
    completed: AtomicU64,
    timed_out: AtomicU64,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Result<Self, AggregateError> {
        let threads = threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("shoal-worker-{}", i))
            .panic_handler(|_| error!("Worker job panicked"))
            .build()
            .map_err(|e| AggregateError::WorkerDispatchFailure(e.to_string()))?;

        debug!("Started worker pool with {} threads", threads);

        Ok(Self {
            pool,
            threads,
            in_flight: Arc::new(AtomicUsize::new(0)),
            completed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        })
    }

    /// One thread per CPU
    pub fn with_default_threads() -> Result<Self, AggregateError> {
        Self::new(num_cpus::get())
    }

    /// Evaluate `expr` for every member of one group off the async runtime.
    ///
    /// Output order matches `members`.
    pub async fn evaluate(
        &self,
        expr: Arc<CompiledExpr>,
        store: Arc<ValueStore>,
        members: Arc<[usize]>,
        deadline: Deadline,
    ) -> Result<Vec<f64>, AggregateError> {
        let (tx, rx) = oneshot::channel();
        let job_deadline = deadline.clone();
        let guard = InFlightGuard::enter(self.in_flight.clone());

        self.pool.spawn(move || {
            let result = evaluate_parallel(&expr, &members, &store, &job_deadline);
            drop(guard);
            // Receiver is gone when the caller already timed out
            let _ = tx.send(result);
        });

        let received = match deadline.remaining() {
            Some(remaining) => match tokio::time::timeout(remaining, rx).await {
                Ok(received) => received,
                Err(_) => {
                    deadline.cancel();
                    self.timed_out.fetch_add(1, Ordering::Relaxed);
                    warn!("Worker job exceeded its deadline and was cancelled");
                    return Err(AggregateError::Timeout);
                }
            },
            None => rx.await,
        };

        let result = received.map_err(|_| {
            AggregateError::WorkerDispatchFailure("worker dropped the job without a result".to_string())
        })?;
        self.completed.fetch_add(1, Ordering::Relaxed);
        result
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            threads: self.threads,
            in_flight: self.in_flight.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.threads)
            .finish()
    }
}

/// Group sums are computed sequentially first, then records are split
/// across the pool in chunks
fn evaluate_parallel(
    expr: &CompiledExpr,
    members: &[usize],
    store: &ValueStore,
    deadline: &Deadline,
) -> Result<Vec<f64>, AggregateError> {
    let sums = GroupContext::new(members, store).prime(expr)?;

    let chunks: Vec<Result<Vec<f64>, AggregateError>> = members
        .par_chunks(CHUNK_SIZE)
        .map(|chunk| {
            if deadline.is_expired() {
                return Err(AggregateError::Timeout);
            }
            chunk
                .iter()
                .map(|&index| {
                    evaluate_primed(expr, RecordView::new(index, store), &sums)
                        .map_err(AggregateError::from)
                })
                .collect()
        })
        .collect();

    let mut values = Vec::with_capacity(members.len());
    for chunk in chunks {
        values.extend(chunk?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ValueStoreBuilder;
    use crate::expr::compile;

    fn store(len: usize) -> Arc<ValueStore> {
        Arc::new(
            ValueStoreBuilder::new()
                .column("sales", (0..len).map(|i| i as f64).collect())
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_parallel_matches_input_order() {
        let pool = WorkerPool::new(4).unwrap();
        let store = store(5000);
        let members: Arc<[usize]> = (0..5000).rev().collect::<Vec<_>>().into();
        let expr = Arc::new(compile("sales * 2").unwrap());

        let values = pool
            .evaluate(expr, store, members.clone(), Deadline::none())
            .await
            .unwrap();

        assert_eq!(values.len(), 5000);
        assert_eq!(values[0], 9998.0);
        assert_eq!(values[4999], 0.0);
        assert_eq!(pool.stats().completed, 1);
        assert_eq!(pool.stats().in_flight, 0);
    }

    #[test]
    fn test_in_flight_released_when_job_panics() {
        let counter = Arc::new(AtomicUsize::new(0));
        let guard = InFlightGuard::enter(counter.clone());
        assert_eq!(counter.load(Ordering::Relaxed), 1);

        let job = move || {
            let _guard = guard;
            panic!("job failed");
        };
        assert!(std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err());
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_in_flight_settles_after_jobs() {
        let pool = WorkerPool::new(2).unwrap();
        let store = store(10);
        let expr = Arc::new(compile("sales + 1").unwrap());
        for _ in 0..3 {
            let members: Arc<[usize]> = (0..10).collect::<Vec<_>>().into();
            pool.evaluate(expr.clone(), store.clone(), members, Deadline::none())
                .await
                .unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_expired_deadline_times_out() {
        let pool = WorkerPool::new(2).unwrap();
        let store = store(100);
        let members: Arc<[usize]> = (0..100).collect::<Vec<_>>().into();
        let expr = Arc::new(compile("sales").unwrap());

        let deadline = Deadline::after(Duration::ZERO);
        let err = pool.evaluate(expr, store, members, deadline).await.unwrap_err();
        assert!(matches!(err, AggregateError::Timeout));
    }

    #[tokio::test]
    async fn test_unknown_statistic_from_worker() {
        let pool = WorkerPool::new(1).unwrap();
        let members: Arc<[usize]> = vec![0].into();
        let expr = Arc::new(compile("profit").unwrap());
        let err = pool
            .evaluate(expr, store(1), members, Deadline::none())
            .await
            .unwrap_err();
        assert!(matches!(err, AggregateError::UnknownStatistic(name) if name == "profit"));
    }

    #[test]
    fn test_deadline() {
        assert!(!Deadline::none().is_expired());
        assert!(Deadline::none().remaining().is_none());

        let deadline = Deadline::after(Duration::from_secs(60));
        assert!(!deadline.is_expired());
        deadline.clone().cancel();
        assert!(deadline.is_expired());
    }
}
