#![allow(clippy::result_large_err)]
//! # Fanout Core
//!
//! Partitioned job decomposition and task execution.
//!
//! ## Architecture
//!
//! - **Coordinator**: accepts jobs, decomposes them on a bounded pool, handles cancel and reprocess
//! - **Decomposers**: per job type, turn one job into independent tasks
//! - **Dispatch**: stable hash routing of tasks and stats onto partitioned queues
//! - **Executors**: per job type, run tasks with retries, timeouts and cooperative cancellation
//! - **Aggregator**: folds task results into job progress and drives terminal transitions
//! - **Store**: the single writer of job records, announcing status changes on the bus
//! - **Telemetry**: structured logging and Prometheus metrics

pub mod aggregator;
pub mod config;
pub mod coordinator;
pub mod decomposer;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod executor;
pub mod jobs;
pub mod node;
pub mod store;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, FanoutError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::coordinator::JobCoordinator;
    pub use crate::decomposer::{
        EntityFanoutConfig, EntityFanoutDecomposer, EntityTaskProcessor, EntityType, FanoutTarget,
        JobDecomposer, SyntheticDecomposer, SyntheticJobConfig, SyntheticTaskProcessor, TaskSink,
    };
    pub use crate::dispatch::{
        InMemoryQueue, PartitionService, PartitioningStrategy, QueueConsumer, QueueKey,
        QueueProducer, TopicPartitionInfo,
    };
    pub use crate::error::{ErrorCode, FanoutError, Result};
    pub use crate::events::{ClusterEvent, JobLifecycleEvent, LifecycleBus};
    pub use crate::executor::{TaskContext, TaskError, TaskExecutor, TaskProcessor};
    pub use crate::jobs::{
        Job, JobId, JobParams, JobResult, JobStatus, JobType, NodeId, Task, TaskOutcome,
        TaskResult, TenantId,
    };
    pub use crate::node::{JobsNode, JobsNodeBuilder};
    pub use crate::store::{InMemoryJobStore, JobStore};
}
