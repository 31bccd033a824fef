//! Partitioned dispatch.
//!
//! - **PartitionService**: stable hash routing and partition ownership per node
//! - **QueueProducer / QueueConsumer**: the partitioned transport seam
//! - **InMemoryQueue**: in-process transport with committed offsets
//! - **TaskDispatcher**: validate + route + send for decomposer output

pub mod dispatcher;
pub mod partition;
pub mod queue;

pub use dispatcher::TaskDispatcher;
pub use partition::{
    partition_for, PartitionService, PartitioningStrategy, QueueKey, ServiceType,
    TopicPartitionInfo, JOB_STATS_QUEUE,
};
pub use queue::{InMemoryConsumer, InMemoryQueue, QueueConsumer, QueueMsg, QueueProducer};
