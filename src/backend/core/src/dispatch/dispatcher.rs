//! Task dispatch onto partitioned task topics.

use std::sync::Arc;

use super::partition::{PartitionService, TopicPartitionInfo};
use super::queue::{QueueMsg, QueueProducer};
use crate::error::Result;
use crate::jobs::Task;

/// Validates tasks and routes them to their job type's topic partition.
#[derive(Clone)]
pub struct TaskDispatcher {
    partitions: Arc<PartitionService>,
    producer: Arc<dyn QueueProducer<Task>>,
}

impl TaskDispatcher {
    pub fn new(partitions: Arc<PartitionService>, producer: Arc<dyn QueueProducer<Task>>) -> Self {
        Self {
            partitions,
            producer,
        }
    }

    pub fn partitions(&self) -> &Arc<PartitionService> {
        &self.partitions
    }

    /// Validate and enqueue a task, returning where it was sent.
    pub async fn dispatch(&self, task: Task) -> Result<TopicPartitionInfo> {
        task.validate()?;
        let tpi = self.partitions.resolve_task(&task);
        tracing::trace!(
            job_id = %task.job_id,
            task_id = %task.id,
            partition = %tpi,
            "Dispatching task"
        );
        self.producer.send(&tpi, QueueMsg::new(task.id, task)).await?;
        Ok(tpi)
    }
}
