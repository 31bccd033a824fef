//! Job decomposition.
//!
//! A decomposer turns a job into independent tasks and submits them through a
//! [`TaskSink`]. It runs on the coordinator, never concurrently for the same
//! job execution.
//!
//! - **SyntheticDecomposer**: configurable successes, failures, delays and general errors
//! - **EntityFanoutDecomposer**: one task per entity, resolving groups page by page

pub mod entity_fanout;
pub mod synthetic;

pub use entity_fanout::{
    EntityFanoutConfig, EntityFanoutDecomposer, EntityHandler, EntityResolver,
    EntityTaskPayload, EntityTaskProcessor, EntityType, FanoutTarget, InMemoryEntityDirectory,
    LoggingEntityHandler, Page, PageLink,
};
pub use synthetic::{SyntheticDecomposer, SyntheticJobConfig, SyntheticTaskProcessor};

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::dispatch::{TaskDispatcher, TopicPartitionInfo};
use crate::error::{FanoutError, Result};
use crate::jobs::{Job, JobType, Task, TaskResult};

/// Turns a job into tasks.
#[async_trait]
pub trait JobDecomposer: Send + Sync {
    fn job_type(&self) -> JobType;

    /// Submit every task of a fresh execution and return how many were submitted.
    ///
    /// An error marks the job FAILED with the error message as its general error.
    async fn process(&self, job: &Job, sink: &TaskSink) -> Result<u32>;

    /// Resubmit the recorded failures of a previous execution.
    ///
    /// The expected total is already known from the retained results, so no
    /// count is returned.
    async fn reprocess(&self, job: &Job, failures: &[TaskResult], sink: &TaskSink) -> Result<()>;

    /// Called once the job reached COMPLETED or FAILED.
    async fn on_job_finished(&self, _job: &Job) {}
}

/// Submission side of a decomposition; counts what it dispatched.
pub struct TaskSink {
    dispatcher: TaskDispatcher,
    submitted: AtomicU32,
}

impl TaskSink {
    pub fn new(dispatcher: TaskDispatcher) -> Self {
        Self {
            dispatcher,
            submitted: AtomicU32::new(0),
        }
    }

    /// Validate and dispatch one task.
    pub async fn submit(&self, task: Task) -> Result<TopicPartitionInfo> {
        let tpi = self.dispatcher.dispatch(task).await?;
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(tpi)
    }

    /// Rebuild and dispatch a task for every failure, stamped with the job's
    /// current tasks key.
    pub async fn resubmit_failures(
        &self,
        job: &Job,
        failures: &[TaskResult],
        retries: u32,
    ) -> Result<u32> {
        let mut count = 0;
        for failure in failures {
            let descriptor = failure.descriptor.as_ref().ok_or_else(|| {
                FanoutError::task_validation("Failed task result has no task descriptor to reprocess")
                    .with_context("job_id", job.id.to_string())
            })?;
            self.submit(Task::from_descriptor(job, descriptor, retries))
                .await?;
            count += 1;
        }
        Ok(count)
    }

    /// Tasks submitted so far.
    pub fn submitted(&self) -> u32 {
        self.submitted.load(Ordering::Relaxed)
    }
}
