//! Tasks and task results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::job::{EntityId, Job, JobId, JobType, TenantId};
use crate::error::{FanoutError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Task
// ═══════════════════════════════════════════════════════════════════════════════

/// One independent unit of work produced by a decomposer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Identity of this delivery; used to track and cancel it while running
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub job_id: JobId,

    /// Tasks key of the job execution that produced this task
    pub key: String,
    pub job_type: JobType,

    /// Attempts already made before this delivery
    pub attempt: u32,

    /// Additional attempts allowed after the first
    pub retries: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,

    /// Type-specific work description
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Task {
    /// Build a task for the job's current execution.
    pub fn for_job(job: &Job, entity_id: Option<EntityId>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: job.tenant_id,
            job_id: job.id,
            key: job.configuration.tasks_key.clone(),
            job_type: job.job_type,
            attempt: 0,
            retries: 0,
            entity_id,
            payload,
        }
    }

    /// Rebuild a task from a recorded failure, for the job's current execution.
    pub fn from_descriptor(job: &Job, descriptor: &TaskDescriptor, retries: u32) -> Self {
        Self::for_job(job, descriptor.entity_id, descriptor.payload.clone()).with_retries(retries)
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Total attempts this task may make.
    pub fn max_attempts(&self) -> u32 {
        self.retries + 1
    }

    pub fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor {
            entity_id: self.entity_id,
            payload: self.payload.clone(),
        }
    }

    /// Reject tasks that cannot be routed or attributed.
    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.is_nil() {
            return Err(FanoutError::task_validation("Task tenant id must be set"));
        }
        if self.job_id.is_nil() {
            return Err(FanoutError::task_validation("Task job id must be set"));
        }
        if self.key.trim().is_empty() {
            return Err(FanoutError::task_validation("Task key must not be empty"));
        }
        if self.attempt > self.retries + 1 {
            return Err(FanoutError::task_validation(format!(
                "Task attempt {} exceeds the {} allowed",
                self.attempt,
                self.retries + 1
            )));
        }
        Ok(())
    }
}

/// What is needed to re-run a failed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,

    #[serde(default)]
    pub payload: serde_json::Value,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Task Result
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    Success,
    Failure,
    /// Skipped because the job execution was cancelled
    Discarded,
}

impl TaskOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Discarded => "DISCARDED",
        }
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one task, reported once per delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Tasks key of the execution the task belonged to
    pub key: String,
    pub outcome: TaskOutcome,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub finish_ts: DateTime<Utc>,

    /// Attempts made, including the last one
    #[serde(default)]
    pub attempts: u32,

    /// Present on failures so the task can be reprocessed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<TaskDescriptor>,
}

impl TaskResult {
    pub fn success(task: &Task, attempts: u32) -> Self {
        Self {
            key: task.key.clone(),
            outcome: TaskOutcome::Success,
            error: None,
            finish_ts: Utc::now(),
            attempts,
            descriptor: None,
        }
    }

    pub fn failure(task: &Task, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            key: task.key.clone(),
            outcome: TaskOutcome::Failure,
            error: Some(error.into()),
            finish_ts: Utc::now(),
            attempts,
            descriptor: Some(task.descriptor()),
        }
    }

    pub fn discarded(task: &Task) -> Self {
        Self {
            key: task.key.clone(),
            outcome: TaskOutcome::Discarded,
            error: None,
            finish_ts: Utc::now(),
            attempts: task.attempt,
            descriptor: None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.outcome == TaskOutcome::Failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decomposer::SyntheticJobConfig;
    use crate::jobs::job::JobParams;

    fn job() -> Job {
        Job::new(
            TenantId::new(),
            JobParams::Synthetic(SyntheticJobConfig::default()),
            "task tests",
        )
    }

    #[test]
    fn test_task_for_job_copies_identity() {
        let job = job();
        let task = Task::for_job(&job, None, serde_json::json!({"n": 1}));
        assert_eq!(task.tenant_id, job.tenant_id);
        assert_eq!(task.job_id, job.id);
        assert_eq!(task.key, job.tasks_key());
        assert_eq!(task.job_type, JobType::Synthetic);
        assert_eq!(task.max_attempts(), 1);
        assert!(task.validate().is_ok());
    }

    #[test]
    fn test_task_validation() {
        let job = job();
        let mut task = Task::for_job(&job, None, serde_json::Value::Null);
        task.key = "  ".to_string();
        assert!(task.validate().is_err());

        let mut task = Task::for_job(&job, None, serde_json::Value::Null);
        task.tenant_id = TenantId::from_uuid(Uuid::nil());
        let err = task.validate().unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::TaskValidationFailed);
    }

    #[test]
    fn test_failure_carries_descriptor() {
        let job = job();
        let entity = EntityId::new();
        let task = Task::for_job(&job, Some(entity), serde_json::json!({"op": "reboot"}));
        let result = TaskResult::failure(&task, "offline", 3);

        assert!(result.is_failure());
        assert_eq!(result.attempts, 3);
        let descriptor = result.descriptor.expect("descriptor");
        assert_eq!(descriptor.entity_id, Some(entity));

        let rebuilt = Task::from_descriptor(&job, &descriptor, 2);
        assert_eq!(rebuilt.entity_id, Some(entity));
        assert_eq!(rebuilt.payload, serde_json::json!({"op": "reboot"}));
        assert_eq!(rebuilt.retries, 2);
    }
}
