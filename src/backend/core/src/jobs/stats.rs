//! Progress messages and their per-job aggregate.

use serde::{Deserialize, Serialize};

use super::job::{JobId, TenantId};
use super::task::TaskResult;

/// Body of a stats message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatsBody {
    TaskResult(TaskResult),
    TotalTasksCount { tasks_key: String, count: u32 },
}

/// A single message on the stats topic, keyed by job id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatsMsg {
    pub tenant_id: TenantId,
    pub job_id: JobId,
    pub body: StatsBody,
}

impl JobStatsMsg {
    pub fn task_result(tenant_id: TenantId, job_id: JobId, result: TaskResult) -> Self {
        Self {
            tenant_id,
            job_id,
            body: StatsBody::TaskResult(result),
        }
    }

    pub fn total_tasks_count(
        tenant_id: TenantId,
        job_id: JobId,
        tasks_key: impl Into<String>,
        count: u32,
    ) -> Self {
        Self {
            tenant_id,
            job_id,
            body: StatsBody::TotalTasksCount {
                tasks_key: tasks_key.into(),
                count,
            },
        }
    }
}

/// Transient aggregate of one job's stats within a processing window.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStats {
    pub tenant_id: TenantId,
    pub job_id: JobId,
    pub total_tasks_count: Option<u32>,

    /// Tasks key the total was reported for
    pub total_tasks_key: Option<String>,
    pub task_results: Vec<TaskResult>,
}

impl JobStats {
    pub fn new(tenant_id: TenantId, job_id: JobId) -> Self {
        Self {
            tenant_id,
            job_id,
            total_tasks_count: None,
            total_tasks_key: None,
            task_results: Vec::new(),
        }
    }

    pub fn merge(&mut self, body: StatsBody) {
        match body {
            StatsBody::TaskResult(result) => self.task_results.push(result),
            StatsBody::TotalTasksCount { tasks_key, count } => {
                self.total_tasks_count = Some(count);
                self.total_tasks_key = Some(tasks_key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_tasks_count.is_none() && self.task_results.is_empty()
    }
}
