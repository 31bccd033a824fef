//! Worker Pool - bounded concurrent execution on a tokio Semaphore.
//!
//! The `WorkerPool` provides:
//! - Configurable concurrency limits using tokio Semaphore
//! - Fire-and-forget spawning tracked by a `TaskTracker`
//! - Graceful shutdown with a grace period, then cancellation
//! - Pool statistics and monitoring

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::telemetry::JobMetrics;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Maximum number of concurrent workers
    pub max_workers: usize,
    /// Name for this pool (for logging/metrics)
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 64,
            name: "default".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(name: impl Into<String>, max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            name: name.into(),
        }
    }
}

struct PoolStats {
    tasks_submitted: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_cancelled: AtomicU64,
    total_wait_time_us: AtomicU64,
    total_exec_time_us: AtomicU64,
    peak_concurrent: AtomicUsize,
    current_concurrent: AtomicUsize,
}

impl PoolStats {
    fn new() -> Self {
        Self {
            tasks_submitted: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_cancelled: AtomicU64::new(0),
            total_wait_time_us: AtomicU64::new(0),
            total_exec_time_us: AtomicU64::new(0),
            peak_concurrent: AtomicUsize::new(0),
            current_concurrent: AtomicUsize::new(0),
        }
    }

    fn record_acquire(&self, wait_time: Duration) {
        self.total_wait_time_us
            .fetch_add(wait_time.as_micros() as u64, Ordering::Relaxed);
        let current = self.current_concurrent.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_concurrent.fetch_max(current, Ordering::Relaxed);
    }

    fn record_finish(&self, completed: bool, exec_time: Duration) {
        let counter = if completed {
            &self.tasks_completed
        } else {
            &self.tasks_cancelled
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_exec_time_us
            .fetch_add(exec_time.as_micros() as u64, Ordering::Relaxed);
        self.current_concurrent.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Bounded pool for background work.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    semaphore: Arc<Semaphore>,
    stats: Arc<PoolStats>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    created_at: Instant,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_workers));

        tracing::info!(
            pool_name = %config.name,
            max_workers = config.max_workers,
            "Worker pool created"
        );

        Self {
            config,
            semaphore,
            stats: Arc::new(PoolStats::new()),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            created_at: Instant::now(),
        }
    }

    pub fn active_workers(&self) -> usize {
        self.config.max_workers - self.semaphore.available_permits()
    }

    /// Spawn a task in the background (fire and forget).
    ///
    /// Returns immediately; the task runs once a permit is free. The future is
    /// dropped if the pool is cancelled first.
    pub fn spawn_background<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        let stats = Arc::clone(&self.stats);
        let cancel = self.cancel.clone();
        let pool_name = self.config.name.clone();
        let max_workers = self.config.max_workers;

        stats.tasks_submitted.fetch_add(1, Ordering::Relaxed);
        self.tracker.spawn(async move {
            let start = Instant::now();

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stats.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => {
                        tracing::error!(pool_name = %pool_name, "Semaphore closed");
                        return;
                    }
                },
            };

            stats.record_acquire(start.elapsed());
            let in_use = max_workers - semaphore.available_permits();
            JobMetrics::set_worker_utilization(&pool_name, in_use as f64 / max_workers as f64);

            let exec_start = Instant::now();
            let completed = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = f() => true,
            };
            stats.record_finish(completed, exec_start.elapsed());
            drop(permit);
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel all background tasks. The pool accepts no further work afterwards.
    pub fn cancel_all(&self) {
        self.cancel.cancel();

        tracing::info!(
            pool_name = %self.config.name,
            "All background tasks cancelled"
        );
    }

    /// Wait up to `grace` for background tasks, then cancel the rest.
    ///
    /// Returns `true` when everything finished within the grace period.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        let drained = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        if !drained {
            tracing::warn!(
                pool_name = %self.config.name,
                remaining = self.tracker.len(),
                "Grace period elapsed, cancelling remaining tasks"
            );
            self.cancel_all();
            self.tracker.wait().await;
        }
        drained
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let stats = &self.stats;
        let tasks_submitted = stats.tasks_submitted.load(Ordering::Relaxed);
        let tasks_completed = stats.tasks_completed.load(Ordering::Relaxed);
        let tasks_cancelled = stats.tasks_cancelled.load(Ordering::Relaxed);
        let finished = tasks_completed + tasks_cancelled;

        let avg_wait_time_us = if tasks_submitted > 0 {
            stats.total_wait_time_us.load(Ordering::Relaxed) / tasks_submitted
        } else {
            0
        };

        let avg_exec_time_us = if finished > 0 {
            stats.total_exec_time_us.load(Ordering::Relaxed) / finished
        } else {
            0
        };

        WorkerPoolStats {
            name: self.config.name.clone(),
            max_workers: self.config.max_workers,
            active_workers: self.active_workers(),
            pending_tasks: self.tracker.len(),
            tasks_submitted,
            tasks_completed,
            tasks_cancelled,
            peak_concurrent: stats.peak_concurrent.load(Ordering::Relaxed),
            avg_wait_time_us,
            avg_exec_time_us,
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

/// Statistics for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolStats {
    pub name: String,
    pub max_workers: usize,
    pub active_workers: usize,
    /// Spawned and not yet finished, including those waiting for a permit
    pub pending_tasks: usize,
    pub tasks_submitted: u64,
    /// Background tasks that ran to completion
    pub tasks_completed: u64,
    pub tasks_cancelled: u64,
    pub peak_concurrent: usize,
    pub avg_wait_time_us: u64,
    pub avg_exec_time_us: u64,
    pub uptime_secs: u64,
}

impl WorkerPoolStats {
    pub fn utilization(&self) -> f64 {
        (self.active_workers as f64 / self.max_workers as f64) * 100.0
    }
}
