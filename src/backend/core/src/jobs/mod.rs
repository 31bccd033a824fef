//! Job data model.
//!
//! ```text
//! ┌──────────────┐  decompose  ┌──────────────┐  execute  ┌──────────────┐
//! │     Job      │────────────▶│     Task     │──────────▶│  TaskResult  │
//! │ (tasks_key,  │             │ (key, retries│           │ (key, outcome│
//! │  params)     │◀────────────│  payload)    │           │  descriptor) │
//! └──────────────┘  JobStats   └──────────────┘           └──────────────┘
//! ```
//!
//! - **Job**: tenant-scoped record with status, configuration and aggregate result
//! - **Task**: one independent unit of work stamped with its job's tasks key
//! - **TaskResult**: exactly one per task delivery; failures keep what is needed to re-run
//! - **JobStats**: per-job batch of results and the expected total
//! - **JobTypeRegistry**: job type -> decomposer + processor

pub mod job;
pub mod registry;
pub mod stats;
pub mod task;

pub use job::{
    new_tasks_key, EntityId, Job, JobConfiguration, JobId, JobParams, JobResult, JobStatus,
    JobType, NodeId, TenantId,
};
pub use registry::{JobTypeEntry, JobTypeRegistry};
pub use stats::{JobStats, JobStatsMsg, StatsBody};
pub use task::{Task, TaskDescriptor, TaskOutcome, TaskResult};
