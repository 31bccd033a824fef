//! Synthetic job type used to exercise the pipeline end to end.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{JobDecomposer, TaskSink};
use crate::error::{ErrorCode, ErrorContext, FanoutError, Result};
use crate::executor::{TaskContext, TaskError, TaskProcessor};
use crate::jobs::{Job, JobParams, JobType, Task, TaskResult};
use crate::telemetry::JobMetrics;

/// Shape of a synthetic job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyntheticJobConfig {
    #[serde(default)]
    pub successful_tasks_count: u32,

    /// Tasks failing once per entry of `errors`, then succeeding
    #[serde(default)]
    pub retryable_failures_count: u32,

    /// Tasks failing on every attempt
    #[serde(default)]
    pub permanent_failures_count: u32,

    #[serde(default)]
    pub errors: Vec<String>,

    /// Retries granted to every task
    #[serde(default)]
    pub retries: u32,

    #[serde(default)]
    pub task_processing_time_ms: u64,

    /// Per-attempt timeout; 0 falls back to one minute
    #[serde(default)]
    pub task_processing_timeout_ms: u64,

    /// Fail the decomposition with this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub general_error: Option<String>,

    /// Tasks submitted before the general error is raised
    #[serde(default)]
    pub submitted_tasks_before_general_error: u32,
}

impl SyntheticJobConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retryable_failures_count > 0 && self.errors.is_empty() {
            return Err(FanoutError::validation(
                "Synthetic job with retryable failures needs at least one error",
            ));
        }
        Ok(())
    }

    pub fn total_tasks(&self) -> u32 {
        self.successful_tasks_count + self.retryable_failures_count + self.permanent_failures_count
    }
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Work description carried by a synthetic task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyntheticTaskPayload {
    #[serde(default)]
    pub processing_time_ms: u64,

    #[serde(default)]
    pub timeout_ms: u64,

    /// Error of attempt `n` is `errors[n - 1]`
    #[serde(default)]
    pub errors: Vec<String>,

    #[serde(default)]
    pub fail_always: bool,
}

impl SyntheticTaskPayload {
    fn into_value(self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn config_of(job: &Job) -> Result<&SyntheticJobConfig> {
    match job.params() {
        JobParams::Synthetic(config) => Ok(config),
        other => Err(FanoutError::validation(format!(
            "Expected synthetic job parameters, got {}",
            other.job_type()
        ))),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Decomposer
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct SyntheticDecomposer {
    finished_jobs: AtomicU64,
}

impl SyntheticDecomposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs that reached COMPLETED or FAILED.
    pub fn finished_jobs(&self) -> u64 {
        self.finished_jobs.load(Ordering::Relaxed)
    }

    fn task(job: &Job, config: &SyntheticJobConfig, errors: Vec<String>, fail_always: bool) -> Task {
        let payload = SyntheticTaskPayload {
            processing_time_ms: config.task_processing_time_ms,
            timeout_ms: config.task_processing_timeout_ms,
            errors,
            fail_always,
        };
        Task::for_job(job, None, payload.into_value()).with_retries(config.retries)
    }
}

#[async_trait]
impl JobDecomposer for SyntheticDecomposer {
    fn job_type(&self) -> JobType {
        JobType::Synthetic
    }

    async fn process(&self, job: &Job, sink: &TaskSink) -> Result<u32> {
        let config = config_of(job)?;

        if let Some(general_error) = &config.general_error {
            for _ in 0..config.submitted_tasks_before_general_error {
                sink.submit(Self::task(job, config, Vec::new(), false)).await?;
            }
            return Err(FanoutError::decomposition_failed(general_error.clone()));
        }

        for _ in 0..config.successful_tasks_count {
            sink.submit(Self::task(job, config, Vec::new(), false)).await?;
        }
        for _ in 0..config.retryable_failures_count {
            sink.submit(Self::task(job, config, config.errors.clone(), false))
                .await?;
        }
        for _ in 0..config.permanent_failures_count {
            sink.submit(Self::task(job, config, config.errors.clone(), true))
                .await?;
        }

        tracing::debug!(
            tenant_id = %job.tenant_id,
            job_id = %job.id,
            tasks_key = %job.tasks_key(),
            submitted = sink.submitted(),
            "Synthetic job decomposed"
        );
        Ok(sink.submitted())
    }

    /// Retryable failures are transient: their rerun succeeds. Permanent
    /// failures fail again.
    async fn reprocess(&self, job: &Job, failures: &[TaskResult], sink: &TaskSink) -> Result<()> {
        let config = config_of(job)?;
        for failure in failures {
            let descriptor = failure.descriptor.as_ref().ok_or_else(|| {
                FanoutError::task_validation("Failed task result has no task descriptor to reprocess")
            })?;
            let mut payload: SyntheticTaskPayload =
                serde_json::from_value(descriptor.payload.clone())
                    .with_error_code(ErrorCode::TaskValidationFailed)?;
            if !payload.fail_always {
                payload.errors.clear();
            }
            let task = Task::for_job(job, descriptor.entity_id, payload.into_value())
                .with_retries(config.retries);
            sink.submit(task).await?;
        }
        Ok(())
    }

    async fn on_job_finished(&self, job: &Job) {
        self.finished_jobs.fetch_add(1, Ordering::Relaxed);
        JobMetrics::record_job_finished(job.job_type.as_str(), job.status.as_str());
        tracing::info!(
            tenant_id = %job.tenant_id,
            job_id = %job.id,
            status = %job.status,
            success = job.result.success_count,
            failed = job.result.failed_count,
            discarded = job.result.discarded_count,
            "Synthetic job finished"
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Processor
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct SyntheticTaskProcessor;

impl SyntheticTaskProcessor {
    pub fn new() -> Self {
        Self
    }

    /// A task without payload is a no-op.
    fn payload(task: &Task) -> std::result::Result<SyntheticTaskPayload, TaskError> {
        if task.payload.is_null() {
            return Ok(SyntheticTaskPayload::default());
        }
        serde_json::from_value(task.payload.clone())
            .map_err(|e| TaskError::invalid(format!("Malformed synthetic task payload: {}", e)))
    }
}

#[async_trait]
impl TaskProcessor for SyntheticTaskProcessor {
    fn job_type(&self) -> JobType {
        JobType::Synthetic
    }

    async fn process(&self, task: &Task, ctx: &TaskContext) -> std::result::Result<(), TaskError> {
        let payload = Self::payload(task)?;

        if payload.processing_time_ms > 0 {
            let delay = tokio::time::sleep(Duration::from_millis(payload.processing_time_ms));
            if ctx.cancellable(delay).await.is_none() {
                return Err(TaskError::cancelled());
            }
        }

        if payload.fail_always {
            let message = payload
                .errors
                .first()
                .cloned()
                .unwrap_or_else(|| "Permanent failure".to_string());
            return Err(TaskError::new(message));
        }

        match payload.errors.get((ctx.attempt() as usize).saturating_sub(1)) {
            Some(error) => Err(TaskError::new(error.clone())),
            None => Ok(()),
        }
    }

    fn timeout(&self, task: &Task) -> Duration {
        match Self::payload(task).map(|payload| payload.timeout_ms) {
            Ok(0) | Err(_) => DEFAULT_TIMEOUT,
            Ok(ms) => Duration::from_millis(ms),
        }
    }
}
