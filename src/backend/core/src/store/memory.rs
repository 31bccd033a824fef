//! In-memory job store.

use async_trait::async_trait;
use dashmap::DashMap;

use super::JobStore;
use crate::error::{FanoutError, Result};
use crate::events::LifecycleBus;
use crate::jobs::{Job, JobId, JobStats, JobStatus, TenantId};

/// Jobs kept in a `DashMap`. Each mutation runs under the job's entry lock and
/// publishes the status change before releasing it, so events of one job are
/// observed in the order they were applied.
pub struct InMemoryJobStore {
    jobs: DashMap<JobId, Job>,
    bus: LifecycleBus,
}

impl InMemoryJobStore {
    pub fn new(bus: LifecycleBus) -> Self {
        Self {
            jobs: DashMap::new(),
            bus,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Apply `f` to the job under its entry lock, announcing a status change.
    fn update<F>(&self, tenant_id: TenantId, job_id: JobId, f: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) -> Result<()>,
    {
        let mut entry = self
            .jobs
            .get_mut(&job_id)
            .filter(|job| job.tenant_id == tenant_id)
            .ok_or_else(|| FanoutError::job_not_found(job_id))?;

        let before = entry.status;
        f(entry.value_mut())?;
        let job = entry.value().clone();

        if job.status != before {
            tracing::debug!(
                tenant_id = %tenant_id,
                job_id = %job_id,
                from = %before,
                to = %job.status,
                "Job status changed"
            );
            self.bus.publish_job_status(&job);
        }
        Ok(job)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn save_job(&self, job: Job) -> Result<Job> {
        job.validate()?;
        let previous = match self.jobs.entry(job.id) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().tenant_id != job.tenant_id {
                    return Err(FanoutError::job_not_found(job.id));
                }
                let previous = occupied.get().status;
                if previous != job.status && !previous.can_transition_to(job.status) {
                    return Err(FanoutError::invalid_transition(previous, job.status));
                }
                occupied.insert(job.clone());
                if previous != job.status {
                    self.bus.publish_job_status(&job);
                }
                Some(previous)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(job.clone());
                self.bus.publish_job_status(&job);
                None
            }
        };
        tracing::debug!(
            tenant_id = %job.tenant_id,
            job_id = %job.id,
            status = %job.status,
            previous = ?previous,
            "Job saved"
        );
        Ok(job)
    }

    async fn find_job_by_id(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>> {
        Ok(self
            .jobs
            .get(&job_id)
            .filter(|job| job.tenant_id == tenant_id)
            .map(|job| job.value().clone()))
    }

    async fn cancel_job(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job> {
        self.update(tenant_id, job_id, |job| job.set_status(JobStatus::Cancelled))
    }

    async fn mark_as_running(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job> {
        self.update(tenant_id, job_id, |job| job.set_status(JobStatus::Running))
    }

    async fn reprocess_job(&self, tenant_id: TenantId, job_id: JobId) -> Result<(Job, Option<String>)> {
        let mut superseded = None;
        let job = self.update(tenant_id, job_id, |job| {
            superseded = job.prepare_reprocess()?;
            Ok(())
        })?;
        Ok((job, superseded))
    }

    async fn mark_as_failed(&self, tenant_id: TenantId, job_id: JobId, error: &str) -> Result<Job> {
        self.update(tenant_id, job_id, |job| {
            job.set_status(JobStatus::Failed)?;
            job.result.general_error = Some(error.to_string());
            Ok(())
        })
    }

    async fn process_stats(&self, tenant_id: TenantId, job_id: JobId, stats: JobStats) -> Result<Job> {
        self.update(tenant_id, job_id, |job| {
            job.apply_stats(&stats);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decomposer::SyntheticJobConfig;
    use crate::error::ErrorCode;
    use crate::events::ClusterEvent;
    use crate::jobs::{JobParams, Task, TaskResult};

    fn job() -> Job {
        Job::new(
            TenantId::new(),
            JobParams::Synthetic(SyntheticJobConfig::default()),
            "store test",
        )
    }

    async fn next_status(sub: &mut crate::events::BusSubscription) -> JobStatus {
        match sub.recv().await {
            Some(ClusterEvent::JobStatusChanged(job)) => job.status,
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_save_publishes_and_find_is_tenant_scoped() {
        let bus = LifecycleBus::new(16);
        let mut sub = bus.subscribe();
        let store = InMemoryJobStore::new(bus);
        let job = store.save_job(job()).await.unwrap();

        assert_eq!(next_status(&mut sub).await, JobStatus::Pending);
        assert!(store.find_job_by_id(job.tenant_id, job.id).await.unwrap().is_some());
        assert!(store.find_job_by_id(TenantId::new(), job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let bus = LifecycleBus::new(16);
        let mut sub = bus.subscribe();
        let store = InMemoryJobStore::new(bus);
        let job = store.save_job(job()).await.unwrap();
        next_status(&mut sub).await;

        let running = store.mark_as_running(job.tenant_id, job.id).await.unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.result.start_ts.is_some());
        assert_eq!(next_status(&mut sub).await, JobStatus::Running);

        let failed = store
            .mark_as_failed(job.tenant_id, job.id, "general failure")
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.result.general_error.as_deref(), Some("general failure"));

        let err = store.cancel_job(job.tenant_id, job.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
    }

    #[tokio::test]
    async fn test_process_stats_completes_job_once() {
        let bus = LifecycleBus::new(16);
        let store = InMemoryJobStore::new(bus.clone());
        let job = store.save_job(job()).await.unwrap();
        store.mark_as_running(job.tenant_id, job.id).await.unwrap();
        let mut sub = bus.subscribe();

        let task = Task::for_job(&job, None, serde_json::Value::Null);
        let mut stats = JobStats::new(job.tenant_id, job.id);
        stats.task_results.push(TaskResult::success(&task, 1));
        let updated = store.process_stats(job.tenant_id, job.id, stats).await.unwrap();
        assert_eq!(updated.status, JobStatus::Running);

        let mut stats = JobStats::new(job.tenant_id, job.id);
        stats.total_tasks_count = Some(1);
        stats.total_tasks_key = Some(job.tasks_key().to_string());
        let updated = store.process_stats(job.tenant_id, job.id, stats).await.unwrap();
        assert_eq!(updated.status, JobStatus::Completed);
        assert_eq!(next_status(&mut sub).await, JobStatus::Completed);

        // Late duplicates are ignored once terminal.
        let mut stats = JobStats::new(job.tenant_id, job.id);
        stats.task_results.push(TaskResult::success(&task, 1));
        let updated = store.process_stats(job.tenant_id, job.id, stats).await.unwrap();
        assert_eq!(updated.result.success_count, 1);
    }

    async fn failed_job(store: &InMemoryJobStore) -> Job {
        let job = store.save_job(job()).await.unwrap();
        store.mark_as_running(job.tenant_id, job.id).await.unwrap();
        let task = Task::for_job(&job, None, serde_json::Value::Null);
        let mut stats = JobStats::new(job.tenant_id, job.id);
        stats.task_results.push(TaskResult::failure(&task, "boom", 1));
        stats.total_tasks_count = Some(1);
        stats.total_tasks_key = Some(job.tasks_key().to_string());
        let failed = store.process_stats(job.tenant_id, job.id, stats).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        failed
    }

    #[tokio::test]
    async fn test_reprocess_applies_once() {
        let store = InMemoryJobStore::new(LifecycleBus::new(16));
        let failed = failed_job(&store).await;

        let (pending, superseded) = store.reprocess_job(failed.tenant_id, failed.id).await.unwrap();
        assert_eq!(pending.status, JobStatus::Pending);
        assert_eq!(superseded.as_deref(), Some(failed.tasks_key()));
        assert_eq!(pending.configuration.to_reprocess.as_ref().map(Vec::len), Some(1));

        let err = store
            .reprocess_job(failed.tenant_id, failed.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);

        let current = store.find_job_by_id(failed.tenant_id, failed.id).await.unwrap().unwrap();
        assert_eq!(current.tasks_key(), pending.tasks_key());
    }

    #[tokio::test]
    async fn test_save_rejects_invalid_transition() {
        let store = InMemoryJobStore::new(LifecycleBus::new(16));
        let job = store.save_job(job()).await.unwrap();
        let running = store.mark_as_running(job.tenant_id, job.id).await.unwrap();

        // A stale PENDING copy cannot overwrite the running record.
        let err = store.save_job(job.clone()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);

        let current = store.find_job_by_id(job.tenant_id, job.id).await.unwrap().unwrap();
        assert_eq!(current.status, JobStatus::Running);
        assert_eq!(current.result.start_ts, running.result.start_ts);

        // Same-status saves are plain updates.
        let mut renamed = current.clone();
        renamed.description = "renamed".to_string();
        assert_eq!(store.save_job(renamed).await.unwrap().description, "renamed");
    }

    #[tokio::test]
    async fn test_missing_job() {
        let store = InMemoryJobStore::new(LifecycleBus::new(4));
        let err = store
            .mark_as_running(TenantId::new(), JobId::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::JobNotFound);
    }
}
