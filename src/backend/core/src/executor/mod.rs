//! Task execution.
//!
//! - **TaskExecutor**: consumes one job type's task topic and runs tasks with retries
//! - **TaskProcessor**: per-type execution contract with its context and error type
//! - **WorkerPool**: bounded concurrency for task execution and decomposition
//! - **ExpiringSet**: TTL set backing the discarded / failed / deleted filters

pub mod expiring_set;
pub mod processor;
pub mod task_executor;
pub mod worker_pool;

pub use expiring_set::ExpiringSet;
pub use processor::{TaskContext, TaskError, TaskProcessor};
pub use task_executor::TaskExecutor;
pub use worker_pool::{WorkerPool, WorkerPoolConfig, WorkerPoolStats};
