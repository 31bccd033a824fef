//! Job persistence.
//!
//! The store is the single writer of job records: every status change goes
//! through it and is announced on the lifecycle bus as
//! [`ClusterEvent::JobStatusChanged`](crate::events::ClusterEvent).

pub mod memory;

pub use memory::InMemoryJobStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::jobs::{Job, JobId, JobStats, TenantId};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job record, or replace one whose status may move to the new one.
    async fn save_job(&self, job: Job) -> Result<Job>;

    async fn find_job_by_id(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>>;

    /// Move a PENDING or RUNNING job to CANCELLED.
    async fn cancel_job(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job>;

    /// Move a PENDING job to RUNNING.
    async fn mark_as_running(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job>;

    /// Reset a FAILED job to PENDING under a new tasks key, atomically.
    ///
    /// Returns the updated job and, when only failed tasks are rerun, the
    /// superseded tasks key. See [`Job::prepare_reprocess`].
    async fn reprocess_job(&self, tenant_id: TenantId, job_id: JobId) -> Result<(Job, Option<String>)>;

    /// Move a PENDING or RUNNING job to FAILED with a general error.
    async fn mark_as_failed(&self, tenant_id: TenantId, job_id: JobId, error: &str) -> Result<Job>;

    /// Merge a batch of progress into the job.
    async fn process_stats(&self, tenant_id: TenantId, job_id: JobId, stats: JobStats) -> Result<Job>;
}
