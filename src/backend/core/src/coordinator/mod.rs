//! Job coordination.
//!
//! The coordinator reacts to job status changes published by the store:
//!
//! ```text
//!   submit_job ──► PENDING ──► decompose (bounded pool) ──► RUNNING ──► tasks + total
//!                    ▲                    │ error
//!                    │                    ▼
//!   reprocess_job ───┘                  FAILED ──► Job{Failed} on the bus
//!
//!   cancel_job ──► CANCELLED ──► Job{Stopped} on the bus
//! ```
//!
//! Decomposition never runs on the bus listener itself; it is handed to a
//! worker pool sized to the number of cores. In a cluster every coordinator
//! sees every PENDING job and `mark_as_running` decides which one decomposes it.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aggregator::StatsPublisher;
use crate::config::CoordinatorConfig;
use crate::decomposer::TaskSink;
use crate::dispatch::TaskDispatcher;
use crate::error::{ErrorCode, FanoutError, Result};
use crate::events::{BusSubscription, ClusterEvent, JobLifecycleEvent, LifecycleBus};
use crate::executor::{WorkerPool, WorkerPoolConfig};
use crate::jobs::{new_tasks_key, Job, JobId, JobResult, JobStatus, JobTypeRegistry, TenantId};
use crate::store::JobStore;
use crate::telemetry::{JobMetrics, OperationTimer};

struct CoordinatorInner {
    config: CoordinatorConfig,
    store: Arc<dyn JobStore>,
    registry: Arc<JobTypeRegistry>,
    dispatcher: TaskDispatcher,
    publisher: StatsPublisher,
    bus: LifecycleBus,
    pool: WorkerPool,
    shutdown: CancellationToken,
}

/// Message stored as a job's general error.
fn general_error_message(error: &FanoutError) -> String {
    match (error.code(), error.internal_message()) {
        (ErrorCode::DecompositionFailed, _) | (_, None) => error.user_message().to_string(),
        (_, Some(internal)) => format!("{}: {}", error.user_message(), internal),
    }
}

impl CoordinatorInner {
    fn on_job_status_changed(self: &Arc<Self>, job: Job) {
        match job.status {
            JobStatus::Pending => {
                let inner = Arc::clone(self);
                self.pool
                    .spawn_background(move || async move { inner.decompose(job).await });
            }
            JobStatus::Completed | JobStatus::Failed => {
                if !self.owns_job(&job) {
                    return;
                }
                if job.status == JobStatus::Failed {
                    self.bus.publish_job_event(
                        job.tenant_id,
                        job.id,
                        job.tasks_key(),
                        JobLifecycleEvent::Failed,
                    );
                }
                let inner = Arc::clone(self);
                self.pool
                    .spawn_background(move || async move { inner.finish(job).await });
            }
            JobStatus::Running | JobStatus::Cancelled => {}
        }
    }

    /// Terminal transitions are handled by the owner of the job's stats partition.
    fn owns_job(&self, job: &Job) -> bool {
        let partitions = self.dispatcher.partitions();
        let tpi = partitions.resolve_stats(job.tenant_id, job.id);
        partitions.owner_of(tpi.partition).as_ref() == Some(partitions.node_id())
    }

    async fn decompose(&self, job: Job) {
        let timer = OperationTimer::start("decompose").label("job_type", job.job_type.as_str());

        let job = match self.store.mark_as_running(job.tenant_id, job.id).await {
            Ok(job) => job,
            Err(e) => {
                // Cancelled or removed before decomposition started.
                tracing::info!(
                    tenant_id = %job.tenant_id,
                    job_id = %job.id,
                    error = %e,
                    "Skipping decomposition"
                );
                return;
            }
        };

        let sink = TaskSink::new(self.dispatcher.clone());
        let outcome = self.run_decomposer(&job, &sink).await;
        JobMetrics::record_tasks_submitted(job.job_type.as_str(), sink.submitted());

        match outcome {
            Ok(()) => {
                tracing::info!(
                    tenant_id = %job.tenant_id,
                    job_id = %job.id,
                    tasks_key = %job.tasks_key(),
                    submitted = sink.submitted(),
                    reprocess = job.is_reprocessing(),
                    "Job decomposed"
                );
            }
            Err(e) => {
                let message = general_error_message(&e);
                tracing::warn!(
                    tenant_id = %job.tenant_id,
                    job_id = %job.id,
                    tasks_key = %job.tasks_key(),
                    submitted = sink.submitted(),
                    error = %message,
                    "Job decomposition failed"
                );
                if let Err(e) = self.store.mark_as_failed(job.tenant_id, job.id, &message).await {
                    e.log();
                }
            }
        }
        timer.finish();
    }

    async fn run_decomposer(&self, job: &Job, sink: &TaskSink) -> Result<()> {
        let decomposer = self.registry.decomposer(job.job_type)?;
        match &job.configuration.to_reprocess {
            None => {
                let count = decomposer.process(job, sink).await?;
                self.publisher
                    .report_total_tasks_count(job.tenant_id, job.id, job.tasks_key(), count)
                    .await
            }
            Some(failures) => decomposer.reprocess(job, failures, sink).await,
        }
    }

    async fn finish(&self, job: Job) {
        match self.registry.decomposer(job.job_type) {
            Ok(decomposer) => decomposer.on_job_finished(&job).await,
            Err(e) => e.log(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Coordinator
// ═══════════════════════════════════════════════════════════════════════════════

pub struct JobCoordinator {
    inner: Arc<CoordinatorInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn JobStore>,
        registry: Arc<JobTypeRegistry>,
        dispatcher: TaskDispatcher,
        publisher: StatsPublisher,
        bus: LifecycleBus,
    ) -> Self {
        let pool = WorkerPool::new(WorkerPoolConfig::new(
            "decomposition",
            config.decomposition_pool_size,
        ));
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                store,
                registry,
                dispatcher,
                publisher,
                bus,
                pool,
                shutdown: CancellationToken::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Start following job status changes.
    pub fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Err(FanoutError::internal("Job coordinator already started"));
        }
        let events = self.inner.bus.subscribe();
        *handle = Some(tokio::spawn(run_listener(Arc::clone(&self.inner), events)));
        tracing::info!(
            job_types = ?self.inner.registry.job_types(),
            decomposition_pool_size = self.inner.config.decomposition_pool_size,
            "Job coordinator started"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Job coordinator listener panicked");
            }
        }
        let drained = self.inner.pool.shutdown(self.inner.config.shutdown_timeout).await;
        tracing::info!(drained, "Job coordinator stopped");
    }

    /// Validate and persist a new job as PENDING with a fresh tasks key.
    pub async fn submit_job(&self, mut job: Job) -> Result<Job> {
        self.inner.registry.get(job.job_type)?;
        job.validate()?;

        job.configuration.tasks_key = new_tasks_key();
        job.configuration.to_reprocess = None;
        job.result = JobResult::default();
        job.status = JobStatus::Pending;
        job.updated_at = Utc::now();

        let job = self.inner.store.save_job(job).await?;
        JobMetrics::record_job_submitted(job.job_type.as_str());
        tracing::info!(
            tenant_id = %job.tenant_id,
            job_id = %job.id,
            job_type = %job.job_type,
            tasks_key = %job.tasks_key(),
            "Job submitted"
        );
        Ok(job)
    }

    /// Cancel a job; running tasks of its current execution report DISCARDED.
    pub async fn cancel_job(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job> {
        let job = self.inner.store.cancel_job(tenant_id, job_id).await?;
        self.inner.bus.publish_job_event(
            tenant_id,
            job_id,
            job.tasks_key(),
            JobLifecycleEvent::Stopped,
        );
        tracing::info!(
            tenant_id = %tenant_id,
            job_id = %job_id,
            tasks_key = %job.tasks_key(),
            "Job cancelled"
        );
        Ok(job)
    }

    /// Re-run a FAILED job.
    ///
    /// A job that failed with a general error restarts from scratch. Otherwise
    /// only its failed tasks run again under a new tasks key; successes are kept.
    pub async fn reprocess_job(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job> {
        let (job, superseded) = self.inner.store.reprocess_job(tenant_id, job_id).await?;

        let general_error = superseded.is_none();
        if let Some(old_key) = superseded {
            self.inner.bus.publish_job_event(
                tenant_id,
                job_id,
                old_key,
                JobLifecycleEvent::Stopped,
            );
        }

        JobMetrics::record_job_reprocessed(job.job_type.as_str(), general_error);
        tracing::info!(
            tenant_id = %tenant_id,
            job_id = %job_id,
            tasks_key = %job.tasks_key(),
            general_error,
            "Job reprocessing"
        );
        Ok(job)
    }
}

async fn run_listener(inner: Arc<CoordinatorInner>, mut events: BusSubscription) {
    loop {
        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(ClusterEvent::JobStatusChanged(job)) => inner.on_job_status_changed(*job),
                Some(_) => {}
                None => break,
            },
        }
    }
    tracing::debug!("Job coordinator listener stopped");
}
