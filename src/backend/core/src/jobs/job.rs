//! Job records and their lifecycle.
//!
//! - **Identifiers**: tenant, job and entity ids plus cluster node ids
//! - **JobType / JobParams**: which decomposer/processor pair applies and its configuration
//! - **JobStatus**: the status machine with its allowed transitions
//! - **JobResult**: per-task outcomes and aggregate counters
//! - **Job::apply_stats**: the single place where progress flips a job to a terminal status

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::stats::JobStats;
use super::task::{TaskOutcome, TaskResult};
use crate::decomposer::{EntityFanoutConfig, SyntheticJobConfig};
use crate::error::{FanoutError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// Tenant owning jobs and entities.
    TenantId
);
uuid_id!(
    /// Unique identifier of a job record.
    JobId
);
uuid_id!(
    /// Domain entity a task operates on (device, asset, group...).
    EntityId
);

/// Identifier of a cluster member hosting executors.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Type
// ═══════════════════════════════════════════════════════════════════════════════

/// Kind of job. Determines the decomposer and task processor that apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    /// Test-only job with configurable successes, failures and delays
    Synthetic,
    /// Applies one action to a single entity or to every member of a group
    EntityFanout,
}

impl JobType {
    pub const ALL: [JobType; 2] = [JobType::Synthetic, JobType::EntityFanout];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Synthetic => "SYNTHETIC",
            Self::EntityFanout => "ENTITY_FANOUT",
        }
    }

    /// Queue name used for this type's task topic.
    pub const fn queue_name(&self) -> &'static str {
        match self {
            Self::Synthetic => "synthetic",
            Self::EntityFanout => "entity_fanout",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Persisted, waiting for decomposition
    Pending,
    /// Decomposition started; results are being collected
    Running,
    /// Every expected result arrived and none failed
    Completed,
    /// At least one task failed, or decomposition raised a general error
    Failed,
    /// Stopped on request; late results are still recorded
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a job in this status may move to `next`.
    ///
    /// FAILED -> PENDING is the reprocess path and the only way out of a terminal status.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Pending)
        )
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Type-specific job parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobParams {
    Synthetic(SyntheticJobConfig),
    EntityFanout(EntityFanoutConfig),
}

impl JobParams {
    pub fn job_type(&self) -> JobType {
        match self {
            Self::Synthetic(_) => JobType::Synthetic,
            Self::EntityFanout(_) => JobType::EntityFanout,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Synthetic(config) => config.validate(),
            Self::EntityFanout(config) => config.validate(),
        }
    }
}

/// Job configuration carried on the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfiguration {
    /// Stamped onto every task of the current execution; rotated on each (re)run
    pub tasks_key: String,

    /// Failed results to re-run instead of a full decomposition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_reprocess: Option<Vec<TaskResult>>,

    pub params: JobParams,
}

impl JobConfiguration {
    pub fn new(params: JobParams) -> Self {
        Self {
            tasks_key: new_tasks_key(),
            to_reprocess: None,
            params,
        }
    }
}

/// Generate a fresh tasks key.
pub fn new_tasks_key() -> String {
    Uuid::new_v4().to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Result
// ═══════════════════════════════════════════════════════════════════════════════

/// Aggregated outcome of a job's tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub success_count: u32,
    pub failed_count: u32,
    pub discarded_count: u32,

    /// Number of tasks the decomposer submitted; unknown until reported
    pub total_count: Option<u32>,

    pub results: Vec<TaskResult>,

    /// Set when decomposition itself failed
    pub general_error: Option<String>,

    pub start_ts: Option<DateTime<Utc>>,
    pub finish_ts: Option<DateTime<Utc>>,
    pub cancellation_ts: Option<DateTime<Utc>>,
}

impl JobResult {
    /// Append a result and bump the matching counter.
    pub fn record(&mut self, result: TaskResult) {
        match result.outcome {
            TaskOutcome::Success => self.success_count += 1,
            TaskOutcome::Failure => self.failed_count += 1,
            TaskOutcome::Discarded => self.discarded_count += 1,
        }
        self.results.push(result);
    }

    /// Number of results received so far.
    pub fn completed_count(&self) -> u32 {
        self.results.len() as u32
    }

    /// True once a total is known and at least that many results arrived.
    pub fn is_complete(&self) -> bool {
        self.total_count
            .map(|total| self.completed_count() >= total)
            .unwrap_or(false)
    }

    /// Recompute the counters from `results`.
    pub fn recount(&mut self) {
        self.success_count = 0;
        self.failed_count = 0;
        self.discarded_count = 0;
        for result in &self.results {
            match result.outcome {
                TaskOutcome::Success => self.success_count += 1,
                TaskOutcome::Failure => self.failed_count += 1,
                TaskOutcome::Discarded => self.discarded_count += 1,
            }
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &TaskResult> {
        self.results
            .iter()
            .filter(|r| r.outcome == TaskOutcome::Failure)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A tenant-scoped job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub job_type: JobType,

    /// Entity the job is about, if any (used for display and filtering)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,

    pub description: String,
    pub status: JobStatus,
    pub configuration: JobConfiguration,
    pub result: JobResult,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new PENDING job; the type is taken from the parameters.
    pub fn new(tenant_id: TenantId, params: JobParams, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            tenant_id,
            job_type: params.job_type(),
            entity_id: None,
            description: description.into(),
            status: JobStatus::Pending,
            configuration: JobConfiguration::new(params),
            result: JobResult::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_entity(mut self, entity_id: EntityId) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    pub fn tasks_key(&self) -> &str {
        &self.configuration.tasks_key
    }

    pub fn params(&self) -> &JobParams {
        &self.configuration.params
    }

    pub fn is_reprocessing(&self) -> bool {
        self.configuration.to_reprocess.is_some()
    }

    /// Check the record is internally consistent before it is persisted.
    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.is_nil() {
            return Err(FanoutError::validation("Job tenant id must be set"));
        }
        let params_type = self.configuration.params.job_type();
        if params_type != self.job_type {
            return Err(FanoutError::validation(format!(
                "Job type {} does not match configuration type {}",
                self.job_type, params_type
            )));
        }
        self.configuration.params.validate()
    }

    /// Move to `next`, stamping the matching timestamp.
    pub fn set_status(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(FanoutError::invalid_transition(self.status, next));
        }
        let now = Utc::now();
        match next {
            JobStatus::Running => self.result.start_ts = Some(now),
            JobStatus::Completed | JobStatus::Failed => self.result.finish_ts = Some(now),
            JobStatus::Cancelled => self.result.cancellation_ts = Some(now),
            JobStatus::Pending => {
                self.result.start_ts = None;
                self.result.finish_ts = None;
            }
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Replace the tasks key, returning the old one.
    pub fn rotate_tasks_key(&mut self) -> String {
        std::mem::replace(&mut self.configuration.tasks_key, new_tasks_key())
    }

    /// Reset a FAILED job to PENDING for another execution under a new tasks key.
    ///
    /// After a general error the job restarts from scratch. Otherwise successes
    /// are kept and only the recorded failures are scheduled again; the
    /// superseded tasks key is returned in that case. The record is left
    /// untouched when an error is returned.
    pub fn prepare_reprocess(&mut self) -> Result<Option<String>> {
        if self.status != JobStatus::Failed {
            return Err(FanoutError::validation(format!(
                "Only failed jobs can be reprocessed, job is {}",
                self.status
            )));
        }

        if self.result.general_error.is_some() {
            self.rotate_tasks_key();
            self.configuration.to_reprocess = None;
            self.result = JobResult::default();
            self.set_status(JobStatus::Pending)?;
            return Ok(None);
        }

        let failures: Vec<TaskResult> = self.result.failures().cloned().collect();
        if self.result.failed_count as usize > failures.len() {
            return Err(FanoutError::reprocess_inconsistent(
                self.result.failed_count,
                failures.len(),
            ));
        }

        self.result
            .results
            .retain(|result| result.outcome == TaskOutcome::Success);
        self.result.recount();
        self.result.total_count = Some(self.result.success_count + failures.len() as u32);
        self.configuration.to_reprocess = Some(failures);

        let old_key = self.rotate_tasks_key();
        self.set_status(JobStatus::Pending)?;
        Ok(Some(old_key))
    }

    /// Merge a batch of progress into the record.
    ///
    /// Results carrying a stale tasks key are ignored. COMPLETED and FAILED
    /// jobs ignore all stats; CANCELLED jobs record results but never
    /// transition. A RUNNING job flips to FAILED or COMPLETED once the known
    /// total is reached, which happens at most once per execution.
    ///
    /// Returns `true` when the status changed.
    pub fn apply_stats(&mut self, stats: &JobStats) -> bool {
        if matches!(self.status, JobStatus::Completed | JobStatus::Failed) {
            return false;
        }

        if let Some(total) = stats.total_tasks_count {
            let key_matches = stats
                .total_tasks_key
                .as_deref()
                .map_or(true, |key| key == self.configuration.tasks_key);
            if key_matches {
                self.result.total_count = Some(total);
            }
        }

        for result in &stats.task_results {
            if result.key != self.configuration.tasks_key {
                tracing::debug!(
                    job_id = %self.id,
                    stale_key = %result.key,
                    "Ignoring task result from a previous execution"
                );
                continue;
            }
            self.result.record(result.clone());
        }
        self.updated_at = Utc::now();

        if self.status == JobStatus::Running && self.result.is_complete() {
            let next = if self.result.failed_count > 0 {
                JobStatus::Failed
            } else {
                JobStatus::Completed
            };
            self.status = next;
            self.result.finish_ts = Some(self.updated_at);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::task::Task;

    fn synthetic_job() -> Job {
        Job::new(
            TenantId::new(),
            JobParams::Synthetic(SyntheticJobConfig::default()),
            "test job",
        )
    }

    fn result_for(job: &Job, outcome: TaskOutcome) -> TaskResult {
        let task = Task::for_job(job, None, serde_json::Value::Null);
        match outcome {
            TaskOutcome::Success => TaskResult::success(&task, 1),
            TaskOutcome::Failure => TaskResult::failure(&task, "boom", 1),
            TaskOutcome::Discarded => TaskResult::discarded(&task),
        }
    }

    fn stats(job: &Job, total: Option<u32>, results: Vec<TaskResult>) -> JobStats {
        let mut stats = JobStats::new(job.tenant_id, job.id);
        stats.total_tasks_count = total;
        stats.task_results = results;
        stats
    }

    #[test]
    fn test_status_transitions() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Failed.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_set_status_rejects_illegal_transition() {
        let mut job = synthetic_job();
        let err = job.set_status(JobStatus::Completed).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidStateTransition);
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn test_validate_mismatched_type() {
        let mut job = synthetic_job();
        job.job_type = JobType::EntityFanout;
        assert!(job.validate().is_err());
    }

    #[test]
    fn test_apply_stats_completes_when_total_reached() {
        let mut job = synthetic_job();
        job.set_status(JobStatus::Running).unwrap();

        let first = stats(&job, None, vec![result_for(&job, TaskOutcome::Success)]);
        assert!(!job.apply_stats(&first));

        let second = stats(&job, Some(2), vec![result_for(&job, TaskOutcome::Success)]);
        assert!(job.apply_stats(&second));
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.success_count, 2);
        assert!(job.result.finish_ts.is_some());
    }

    #[test]
    fn test_apply_stats_fails_on_any_failure() {
        let mut job = synthetic_job();
        job.set_status(JobStatus::Running).unwrap();

        let batch = stats(
            &job,
            Some(2),
            vec![
                result_for(&job, TaskOutcome::Success),
                result_for(&job, TaskOutcome::Failure),
            ],
        );
        assert!(job.apply_stats(&batch));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.result.failed_count, 1);
    }

    #[test]
    fn test_apply_stats_total_after_results() {
        let mut job = synthetic_job();
        job.set_status(JobStatus::Running).unwrap();

        let results = stats(
            &job,
            None,
            vec![
                result_for(&job, TaskOutcome::Success),
                result_for(&job, TaskOutcome::Success),
            ],
        );
        assert!(!job.apply_stats(&results));
        assert_eq!(job.status, JobStatus::Running);

        let total = stats(&job, Some(2), Vec::new());
        assert!(job.apply_stats(&total));
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn test_prepare_reprocess_keeps_successes() {
        let mut job = synthetic_job();
        job.set_status(JobStatus::Running).unwrap();
        let batch = stats(
            &job,
            Some(2),
            vec![
                result_for(&job, TaskOutcome::Success),
                result_for(&job, TaskOutcome::Failure),
            ],
        );
        job.apply_stats(&batch);
        let failed_key = job.tasks_key().to_string();

        let superseded = job.prepare_reprocess().unwrap();
        assert_eq!(superseded.as_deref(), Some(failed_key.as_str()));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.result.results.len(), 1);
        assert_eq!(job.result.total_count, Some(2));
        assert_eq!(job.configuration.to_reprocess.as_ref().map(Vec::len), Some(1));

        let err = job.prepare_reprocess().unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ValidationError);
    }

    #[test]
    fn test_prepare_reprocess_inconsistent_leaves_job_untouched() {
        let mut job = synthetic_job();
        job.set_status(JobStatus::Running).unwrap();
        job.apply_stats(&stats(&job, Some(1), vec![result_for(&job, TaskOutcome::Failure)]));
        job.result.failed_count = 2;
        let before = job.clone();

        let err = job.prepare_reprocess().unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ReprocessInconsistent);
        assert_eq!(job, before);
    }

    #[test]
    fn test_apply_stats_ignores_stale_key() {
        let mut job = synthetic_job();
        job.set_status(JobStatus::Running).unwrap();
        let stale = result_for(&job, TaskOutcome::Failure);
        job.rotate_tasks_key();

        let batch = stats(&job, Some(1), vec![stale]);
        assert!(!job.apply_stats(&batch));
        assert!(job.result.results.is_empty());
        assert_eq!(job.result.failed_count, 0);
    }

    #[test]
    fn test_apply_stats_terminal_job_ignored() {
        let mut job = synthetic_job();
        job.set_status(JobStatus::Running).unwrap();
        assert!(job.apply_stats(&stats(&job, Some(0), Vec::new())));
        assert_eq!(job.status, JobStatus::Completed);

        let late = stats(&job, None, vec![result_for(&job, TaskOutcome::Failure)]);
        assert!(!job.apply_stats(&late));
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.result.results.is_empty());
    }

    #[test]
    fn test_apply_stats_cancelled_records_without_transition() {
        let mut job = synthetic_job();
        job.set_status(JobStatus::Running).unwrap();
        job.set_status(JobStatus::Cancelled).unwrap();

        let batch = stats(&job, Some(1), vec![result_for(&job, TaskOutcome::Discarded)]);
        assert!(!job.apply_stats(&batch));
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.result.discarded_count, 1);
    }

    #[test]
    fn test_recount() {
        let mut job = synthetic_job();
        job.result.results = vec![
            result_for(&job, TaskOutcome::Success),
            result_for(&job, TaskOutcome::Failure),
            result_for(&job, TaskOutcome::Failure),
        ];
        job.result.recount();
        assert_eq!(job.result.success_count, 1);
        assert_eq!(job.result.failed_count, 2);
        assert_eq!(job.result.failures().count(), 2);
    }

    #[test]
    fn test_job_params_serde_tag() {
        let params = JobParams::Synthetic(SyntheticJobConfig::default());
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["type"], "SYNTHETIC");
    }
}
