//! Per-job-type task executor.
//!
//! Two loops run per executor:
//! - the **consumer loop** owns the queue consumer and its subscription; it
//!   polls batches, filters them against the lifecycle sets and hands the
//!   remaining tasks to the worker pool
//! - the **lifecycle listener** follows the bus, maintains the discarded /
//!   failed / deleted sets, cancels affected running tasks and forwards
//!   partition reassignments to the consumer loop

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::expiring_set::ExpiringSet;
use super::processor::{TaskContext, TaskError, TaskProcessor};
use super::worker_pool::{WorkerPool, WorkerPoolConfig, WorkerPoolStats};
use crate::aggregator::StatsPublisher;
use crate::config::ExecutorConfig;
use crate::dispatch::{PartitionService, QueueConsumer, QueueKey, TopicPartitionInfo};
use crate::error::{ErrorCode, FanoutError, Result};
use crate::events::{
    BusSubscription, ClusterEvent, ComponentLifecycleEvent, JobLifecycleEvent, LifecycleBus,
    TenantLifecycleEvent,
};
use crate::jobs::{JobType, NodeId, Task, TaskOutcome, TaskResult, TenantId};
use crate::telemetry::JobMetrics;

type Assignment = BTreeSet<TopicPartitionInfo>;

/// A task currently executing on this node.
#[derive(Debug, Clone)]
struct RunningTask {
    tenant_id: TenantId,
    key: String,
    token: CancellationToken,
}

/// How an execution ended.
enum Execution {
    Succeeded { attempts: u32 },
    Failed { attempts: u32, error: TaskError },
    Cancelled { attempts: u32 },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Shared State
// ═══════════════════════════════════════════════════════════════════════════════

struct ExecutorInner {
    job_type: JobType,
    node_id: NodeId,
    queue_key: QueueKey,
    config: ExecutorConfig,
    processor: Arc<dyn TaskProcessor>,
    publisher: StatsPublisher,
    pool: WorkerPool,
    running: DashMap<Uuid, RunningTask>,
    discarded_keys: ExpiringSet<String>,
    failed_keys: ExpiringSet<String>,
    deleted_tenants: ExpiringSet<TenantId>,
    shutdown: CancellationToken,
}

/// Removes a task from the running map however its future ends.
struct RunningGuard {
    inner: Arc<ExecutorInner>,
    task_id: Uuid,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.inner.running.remove(&self.task_id);
        JobMetrics::set_running_tasks(self.inner.job_type.as_str(), self.inner.running.len());
    }
}

impl ExecutorInner {
    fn job_type_label(&self) -> &'static str {
        self.job_type.as_str()
    }

    /// Route one polled task: drop, discard or execute.
    async fn submit(self: &Arc<Self>, task: Task) {
        if self.deleted_tenants.contains(&task.tenant_id) {
            tracing::debug!(
                tenant_id = %task.tenant_id,
                job_id = %task.job_id,
                "Dropping task of deleted tenant"
            );
            JobMetrics::record_task_dropped(self.job_type_label(), "tenant_deleted");
            return;
        }
        if self.failed_keys.contains(&task.key) {
            tracing::debug!(
                job_id = %task.job_id,
                tasks_key = %task.key,
                "Dropping task of failed job execution"
            );
            JobMetrics::record_task_dropped(self.job_type_label(), "job_failed");
            return;
        }
        if self.discarded_keys.contains(&task.key) {
            let result = TaskResult::discarded(&task);
            self.report_task_result(&task, result).await;
            return;
        }

        let token = CancellationToken::new();
        self.running.insert(
            task.id,
            RunningTask {
                tenant_id: task.tenant_id,
                key: task.key.clone(),
                token: token.clone(),
            },
        );
        JobMetrics::set_running_tasks(self.job_type_label(), self.running.len());

        let inner = Arc::clone(self);
        self.pool.spawn_background(move || async move {
            let _guard = RunningGuard {
                inner: Arc::clone(&inner),
                task_id: task.id,
            };
            inner.execute(task, token).await;
        });
    }

    async fn execute(&self, task: Task, token: CancellationToken) {
        let started = Instant::now();
        let execution = self.run_attempts(&task, &token).await;
        let duration = started.elapsed();

        let result = match execution {
            Execution::Succeeded { attempts } => TaskResult::success(&task, attempts),
            Execution::Failed { attempts, error } => {
                tracing::warn!(
                    tenant_id = %task.tenant_id,
                    job_id = %task.job_id,
                    tasks_key = %task.key,
                    attempt = attempts,
                    error = %error,
                    "Task failed"
                );
                TaskResult::failure(&task, error.to_string(), attempts)
            }
            Execution::Cancelled { attempts } => {
                let mut result = TaskResult::discarded(&task);
                result.attempts = attempts;
                result
            }
        };

        JobMetrics::record_task_result(self.job_type_label(), result.outcome.as_str(), duration);
        self.report_task_result(&task, result).await;
    }

    /// Attempts `task.attempt + 1 ..= retries + 1`, each raced against the
    /// processor timeout and the task's cancellation token. A non-retryable
    /// error ends the loop early.
    async fn run_attempts(&self, task: &Task, token: &CancellationToken) -> Execution {
        let max_attempts = task.max_attempts();
        let mut last_error = TaskError::new("No attempts left");
        let mut attempts = task.attempt;

        for attempt in (task.attempt + 1)..=max_attempts {
            attempts = attempt;
            let ctx = TaskContext::new(attempt, token.clone());
            let timeout = self.processor.timeout(task);

            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => return Execution::Cancelled { attempts },
                outcome = tokio::time::timeout(timeout, self.processor.process(task, &ctx)) => outcome,
            };

            match outcome {
                Ok(Ok(())) => return Execution::Succeeded { attempts },
                Ok(Err(error)) => last_error = error,
                Err(_) => last_error = TaskError::timeout(timeout),
            }

            if !last_error.is_retryable() {
                break;
            }
            if attempt < max_attempts {
                tracing::debug!(
                    job_id = %task.job_id,
                    tasks_key = %task.key,
                    attempt,
                    max_attempts,
                    error = %last_error,
                    "Task attempt failed, retrying"
                );
                JobMetrics::record_task_retry(self.job_type_label());
            }
        }

        Execution::Failed {
            attempts,
            error: last_error,
        }
    }

    /// Last gate before a result leaves the node.
    ///
    /// Deleted tenants and failed executions report nothing; a discarded
    /// execution reports DISCARDED whatever the task's own outcome was.
    async fn report_task_result(&self, task: &Task, mut result: TaskResult) {
        if self.deleted_tenants.contains(&task.tenant_id) {
            JobMetrics::record_task_dropped(self.job_type_label(), "tenant_deleted");
            return;
        }
        if self.failed_keys.contains(&task.key) {
            JobMetrics::record_task_dropped(self.job_type_label(), "job_failed");
            return;
        }
        if self.discarded_keys.contains(&task.key) && result.outcome != TaskOutcome::Discarded {
            let attempts = result.attempts;
            result = TaskResult::discarded(task);
            result.attempts = attempts;
        }
        if self.pool.is_cancelled() {
            tracing::debug!(
                job_id = %task.job_id,
                tasks_key = %task.key,
                "Executor stopped, not reporting task result"
            );
            return;
        }

        result.finish_ts = Utc::now();
        if result.outcome == TaskOutcome::Discarded {
            JobMetrics::record_task_dropped(self.job_type_label(), "discarded");
        }
        if let Err(e) = self
            .publisher
            .report_task_result(task.tenant_id, task.job_id, result)
            .await
        {
            tracing::error!(
                tenant_id = %task.tenant_id,
                job_id = %task.job_id,
                tasks_key = %task.key,
                error = %e,
                "Failed to report task result"
            );
        }
    }

    fn on_cluster_event(&self, event: ClusterEvent, assignments: &mpsc::UnboundedSender<Assignment>) {
        match event {
            ClusterEvent::PartitionsChanged(change)
                if change.node_id == self.node_id && change.queue_key == self.queue_key =>
            {
                tracing::info!(
                    queue = %self.queue_key,
                    partitions = change.partitions.len(),
                    "Partition assignment changed"
                );
                let _ = assignments.send(change.partitions);
            }
            ClusterEvent::Component(ComponentLifecycleEvent::Job {
                job_id,
                tasks_key,
                event,
                ..
            }) => match event {
                JobLifecycleEvent::Stopped => {
                    self.discarded_keys.insert(tasks_key.clone());
                    let cancelled = self.cancel_running(|running| running.key == tasks_key);
                    tracing::debug!(
                        job_id = %job_id,
                        tasks_key = %tasks_key,
                        cancelled,
                        "Job execution stopped"
                    );
                }
                JobLifecycleEvent::Failed => {
                    self.failed_keys.insert(tasks_key);
                }
            },
            ClusterEvent::Component(ComponentLifecycleEvent::Tenant {
                tenant_id,
                event: TenantLifecycleEvent::Deleted,
            }) => {
                self.deleted_tenants.insert(tenant_id);
                let cancelled = self.cancel_running(|running| running.tenant_id == tenant_id);
                tracing::info!(tenant_id = %tenant_id, cancelled, "Tenant deleted");
            }
            _ => {}
        }
    }

    fn cancel_running(&self, matches: impl Fn(&RunningTask) -> bool) -> usize {
        let mut cancelled = 0;
        for entry in self.running.iter() {
            if matches(entry.value()) {
                entry.value().token.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    fn purge_lifecycle_sets(&self) {
        let purged = self.discarded_keys.purge_expired()
            + self.failed_keys.purge_expired()
            + self.deleted_tenants.purge_expired();
        if purged > 0 {
            tracing::debug!(job_type = %self.job_type, purged, "Purged expired lifecycle entries");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Executor
// ═══════════════════════════════════════════════════════════════════════════════

/// Consumes one job type's task topic on this node.
pub struct TaskExecutor {
    inner: Arc<ExecutorInner>,
    partitions: Arc<PartitionService>,
    bus: LifecycleBus,
    consumer: Mutex<Option<Box<dyn QueueConsumer<Task>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskExecutor {
    pub fn new(
        config: ExecutorConfig,
        processor: Arc<dyn TaskProcessor>,
        consumer: Box<dyn QueueConsumer<Task>>,
        publisher: StatsPublisher,
        partitions: Arc<PartitionService>,
        bus: LifecycleBus,
    ) -> Self {
        let job_type = processor.job_type();
        let pool = WorkerPool::new(WorkerPoolConfig::new(
            format!("executor-{}", job_type.queue_name()),
            config.max_concurrent_tasks,
        ));

        let inner = ExecutorInner {
            job_type,
            node_id: partitions.node_id().clone(),
            queue_key: QueueKey::tasks(job_type),
            processor,
            publisher,
            pool,
            running: DashMap::new(),
            discarded_keys: ExpiringSet::new(config.lifecycle_ttl),
            failed_keys: ExpiringSet::new(config.lifecycle_ttl),
            deleted_tenants: ExpiringSet::new(config.lifecycle_ttl),
            shutdown: CancellationToken::new(),
            config,
        };

        Self {
            inner: Arc::new(inner),
            partitions,
            bus,
            consumer: Mutex::new(Some(consumer)),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn job_type(&self) -> JobType {
        self.inner.job_type
    }

    /// Tasks currently executing.
    pub fn running_count(&self) -> usize {
        self.inner.running.len()
    }

    pub fn pool_stats(&self) -> WorkerPoolStats {
        self.inner.pool.stats()
    }

    pub fn is_discarded(&self, tasks_key: &str) -> bool {
        self.inner.discarded_keys.contains(&tasks_key.to_string())
    }

    /// Start the consumer loop and the lifecycle listener.
    pub fn start(&self) -> Result<()> {
        let consumer = self.consumer.lock().take().ok_or_else(|| {
            FanoutError::internal(format!(
                "Executor for {} already started",
                self.inner.job_type
            ))
        })?;

        // Subscribe before registering so no reassignment is missed.
        let events = self.bus.subscribe();
        let initial = self.partitions.register_queue(self.inner.queue_key.clone());
        let (tx, rx) = mpsc::unbounded_channel();

        tracing::info!(
            job_type = %self.inner.job_type,
            partitions = initial.len(),
            max_concurrent_tasks = self.inner.config.max_concurrent_tasks,
            "Task executor starting"
        );

        let consumer_loop = tokio::spawn(run_consumer(Arc::clone(&self.inner), consumer, rx, initial));
        let listener = tokio::spawn(run_lifecycle_listener(Arc::clone(&self.inner), events, tx));

        self.handles.lock().extend([consumer_loop, listener]);
        Ok(())
    }

    /// Stop polling, give in-flight tasks the configured grace period, then
    /// cancel whatever is left.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::error!(job_type = %self.inner.job_type, error = %e, "Executor loop panicked");
            }
        }

        let drained = self.inner.pool.shutdown(self.inner.config.shutdown_timeout).await;
        let stats = self.inner.pool.stats();
        tracing::info!(
            job_type = %self.inner.job_type,
            drained,
            completed = stats.tasks_completed,
            cancelled = stats.tasks_cancelled,
            peak_concurrent = stats.peak_concurrent,
            "Task executor stopped"
        );
    }
}

async fn run_consumer(
    inner: Arc<ExecutorInner>,
    mut consumer: Box<dyn QueueConsumer<Task>>,
    mut assignments: mpsc::UnboundedReceiver<Assignment>,
    initial: Assignment,
) {
    if let Err(e) = consumer.subscribe(initial).await {
        e.log();
    }

    loop {
        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            Some(partitions) = assignments.recv() => {
                if let Err(e) = consumer.subscribe(partitions).await {
                    e.log();
                }
            }
            polled = consumer.poll(inner.config.poll_interval) => match polled {
                Ok(batch) if batch.is_empty() => {}
                Ok(batch) => {
                    tracing::trace!(job_type = %inner.job_type, size = batch.len(), "Polled task batch");
                    for msg in batch {
                        inner.submit(msg.value).await;
                    }
                    if let Err(e) = consumer.commit().await {
                        e.log();
                    }
                }
                Err(e) if e.code() == ErrorCode::QueueClosed => {
                    tracing::info!(job_type = %inner.job_type, "Task queue closed");
                    break;
                }
                Err(e) => {
                    e.log();
                    tokio::time::sleep(inner.config.poll_interval).await;
                }
            },
        }
    }

    consumer.unsubscribe().await;
    tracing::debug!(job_type = %inner.job_type, "Consumer loop stopped");
}

async fn run_lifecycle_listener(
    inner: Arc<ExecutorInner>,
    mut events: BusSubscription,
    assignments: mpsc::UnboundedSender<Assignment>,
) {
    let period = inner.config.purge_interval.max(Duration::from_millis(1));
    let mut purge = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => inner.on_cluster_event(event, &assignments),
                None => break,
            },
            _ = purge.tick() => inner.purge_lifecycle_sets(),
        }
    }
    tracing::debug!(job_type = %inner.job_type, "Lifecycle listener stopped");
}
