//! Producer side of the stats topic.

use std::sync::Arc;

use crate::dispatch::{PartitionService, QueueMsg, QueueProducer};
use crate::error::Result;
use crate::jobs::{JobId, JobStatsMsg, TaskResult, TenantId};

/// Publishes task results and expected totals, keyed by job id.
#[derive(Clone)]
pub struct StatsPublisher {
    partitions: Arc<PartitionService>,
    producer: Arc<dyn QueueProducer<JobStatsMsg>>,
}

impl StatsPublisher {
    pub fn new(
        partitions: Arc<PartitionService>,
        producer: Arc<dyn QueueProducer<JobStatsMsg>>,
    ) -> Self {
        Self {
            partitions,
            producer,
        }
    }

    pub async fn report_task_result(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        result: TaskResult,
    ) -> Result<()> {
        tracing::trace!(
            tenant_id = %tenant_id,
            job_id = %job_id,
            tasks_key = %result.key,
            outcome = %result.outcome,
            "Reporting task result"
        );
        self.send(JobStatsMsg::task_result(tenant_id, job_id, result))
            .await
    }

    /// Report how many tasks the execution identified by `tasks_key` submitted.
    pub async fn report_total_tasks_count(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        tasks_key: &str,
        count: u32,
    ) -> Result<()> {
        tracing::debug!(
            tenant_id = %tenant_id,
            job_id = %job_id,
            tasks_key = %tasks_key,
            count,
            "Reporting total tasks count"
        );
        self.send(JobStatsMsg::total_tasks_count(tenant_id, job_id, tasks_key, count))
            .await
    }

    async fn send(&self, msg: JobStatsMsg) -> Result<()> {
        let tpi = self.partitions.resolve_stats(msg.tenant_id, msg.job_id);
        self.producer.send(&tpi, QueueMsg::new(msg.job_id.0, msg)).await
    }
}
