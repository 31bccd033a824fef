//! Composition root of a jobs node.
//!
//! A node wires one coordinator, one executor per registered job type and one
//! progress aggregator around a shared lifecycle bus, job store and queues.
//! Several nodes built over the same bus, store and queues form a cluster;
//! partitions are split between them through [`JobsNode::update_cluster`].

use std::sync::Arc;

use crate::aggregator::{ProgressAggregator, StatsPublisher};
use crate::config::Config;
use crate::coordinator::JobCoordinator;
use crate::decomposer::JobDecomposer;
use crate::dispatch::{InMemoryQueue, PartitionService, TaskDispatcher};
use crate::error::{FanoutError, Result};
use crate::events::LifecycleBus;
use crate::executor::{TaskExecutor, TaskProcessor};
use crate::jobs::{JobStatsMsg, JobType, JobTypeRegistry, NodeId, Task};
use crate::store::{InMemoryJobStore, JobStore};

const STATS_CONSUMER_GROUP: &str = "job-stats-aggregator";

/// Builder for [`JobsNode`].
pub struct JobsNodeBuilder {
    config: Config,
    registry: JobTypeRegistry,
    bus: Option<LifecycleBus>,
    store: Option<Arc<dyn JobStore>>,
    task_queue: Option<InMemoryQueue<Task>>,
    stats_queue: Option<InMemoryQueue<JobStatsMsg>>,
}

impl JobsNodeBuilder {
    /// Register a job type.
    pub fn register(
        mut self,
        decomposer: Arc<dyn JobDecomposer>,
        processor: Arc<dyn TaskProcessor>,
    ) -> Result<Self> {
        self.registry.register(decomposer, processor)?;
        Ok(self)
    }

    /// Share a bus with other nodes.
    pub fn with_bus(mut self, bus: LifecycleBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Share a store with other nodes. The store must publish on the same bus.
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_queues(
        mut self,
        task_queue: InMemoryQueue<Task>,
        stats_queue: InMemoryQueue<JobStatsMsg>,
    ) -> Self {
        self.task_queue = Some(task_queue);
        self.stats_queue = Some(stats_queue);
        self
    }

    pub fn build(self) -> Result<JobsNode> {
        self.config.validate()?;
        if self.registry.is_empty() {
            return Err(FanoutError::configuration("At least one job type must be registered"));
        }

        let config = self.config;
        let node_id = NodeId::new(config.node.node_id.clone());
        let bus = self
            .bus
            .unwrap_or_else(|| LifecycleBus::new(config.node.bus_capacity));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryJobStore::new(bus.clone())));
        let task_queue = self.task_queue.unwrap_or_default();
        let stats_queue = self.stats_queue.unwrap_or_default();
        let registry = Arc::new(self.registry);

        let partitions = Arc::new(PartitionService::new(
            config.dispatch.clone(),
            node_id.clone(),
            bus.clone(),
        ));
        let dispatcher = TaskDispatcher::new(Arc::clone(&partitions), Arc::new(task_queue.clone()));
        let publisher = StatsPublisher::new(Arc::clone(&partitions), Arc::new(stats_queue.clone()));

        let mut executors = Vec::with_capacity(registry.len());
        for job_type in registry.job_types() {
            let processor = registry.processor(job_type)?;
            let consumer = task_queue.consumer(
                format!("executor-{}", job_type.queue_name()),
                config.dispatch.max_poll_records,
            );
            executors.push(TaskExecutor::new(
                config.executor.clone(),
                processor,
                Box::new(consumer),
                publisher.clone(),
                Arc::clone(&partitions),
                bus.clone(),
            ));
        }

        let aggregator = ProgressAggregator::new(
            config.aggregator.clone(),
            Arc::clone(&store),
            Box::new(stats_queue.consumer(STATS_CONSUMER_GROUP, config.dispatch.max_poll_records)),
            Arc::clone(&partitions),
            bus.clone(),
        );

        let coordinator = JobCoordinator::new(
            config.coordinator.clone(),
            Arc::clone(&store),
            Arc::clone(&registry),
            dispatcher,
            publisher,
            bus.clone(),
        );

        Ok(JobsNode {
            node_id,
            bus,
            store,
            partitions,
            coordinator,
            executors,
            aggregator,
            task_queue,
            stats_queue,
        })
    }
}

/// A running member of the jobs cluster.
pub struct JobsNode {
    node_id: NodeId,
    bus: LifecycleBus,
    store: Arc<dyn JobStore>,
    partitions: Arc<PartitionService>,
    coordinator: JobCoordinator,
    executors: Vec<TaskExecutor>,
    aggregator: ProgressAggregator,
    task_queue: InMemoryQueue<Task>,
    stats_queue: InMemoryQueue<JobStatsMsg>,
}

impl JobsNode {
    pub fn builder(config: Config) -> JobsNodeBuilder {
        JobsNodeBuilder {
            config,
            registry: JobTypeRegistry::new(),
            bus: None,
            store: None,
            task_queue: None,
            stats_queue: None,
        }
    }

    /// Start consumers first so nothing the coordinator dispatches is missed.
    pub fn start(&self) -> Result<()> {
        self.aggregator.start()?;
        for executor in &self.executors {
            executor.start()?;
        }
        self.coordinator.start()?;
        tracing::info!(
            node_id = %self.node_id,
            executors = self.executors.len(),
            "Jobs node started"
        );
        Ok(())
    }

    /// Stop components in reverse start order.
    pub async fn stop(&self) {
        self.coordinator.stop().await;
        for executor in self.executors.iter().rev() {
            executor.stop().await;
        }
        self.aggregator.stop().await;
        tracing::info!(node_id = %self.node_id, "Jobs node stopped");
    }

    /// Apply a new cluster membership.
    pub fn update_cluster(&self, nodes: impl IntoIterator<Item = NodeId>) {
        self.partitions.update_cluster(nodes);
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn coordinator(&self) -> &JobCoordinator {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn bus(&self) -> &LifecycleBus {
        &self.bus
    }

    pub fn partitions(&self) -> &Arc<PartitionService> {
        &self.partitions
    }

    pub fn executor(&self, job_type: JobType) -> Option<&TaskExecutor> {
        self.executors.iter().find(|e| e.job_type() == job_type)
    }

    pub fn task_queue(&self) -> &InMemoryQueue<Task> {
        &self.task_queue
    }

    pub fn stats_queue(&self) -> &InMemoryQueue<JobStatsMsg> {
        &self.stats_queue
    }
}
