//! Partition resolution and ownership.
//!
//! A message's partition is a stable hash of its routing id modulo the
//! partition count of its service type. Partition `p` of every queue is owned
//! by `sorted_nodes[p % n]`, so all members agree on ownership from the same
//! membership list without coordination.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::events::{ClusterEvent, LifecycleBus, PartitionChangeEvent};
use crate::jobs::{JobId, JobType, NodeId, Task, TenantId};

/// Queue name of the stats topic.
pub const JOB_STATS_QUEUE: &str = "job_stats";

// ═══════════════════════════════════════════════════════════════════════════════
// Addressing
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    /// Task topics, one per job type
    TaskProcessor,
    /// The shared stats topic
    JobStats,
}

impl ServiceType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TaskProcessor => "tasks",
            Self::JobStats => "stats",
        }
    }
}

/// Identifies one logical queue (topic) of a service type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueKey {
    pub service_type: ServiceType,
    pub queue_name: String,
}

impl QueueKey {
    pub fn new(service_type: ServiceType, queue_name: impl Into<String>) -> Self {
        Self {
            service_type,
            queue_name: queue_name.into(),
        }
    }

    pub fn tasks(job_type: JobType) -> Self {
        Self::new(ServiceType::TaskProcessor, job_type.queue_name())
    }

    pub fn stats() -> Self {
        Self::new(ServiceType::JobStats, JOB_STATS_QUEUE)
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_type.as_str(), self.queue_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopicPartitionInfo {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartitionInfo {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartitionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// What a task's partition is derived from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitioningStrategy {
    /// All tasks of a tenant share a partition
    #[default]
    Tenant,
    /// Tasks spread by target entity; falls back to the tenant when absent
    Entity,
}

/// Stable partition of `id` among `partitions`.
///
/// Uses the first eight bytes of the SHA-256 of the UUID bytes so the result
/// is identical across processes and builds.
pub fn partition_for(id: &Uuid, partitions: u32) -> u32 {
    if partitions <= 1 {
        return 0;
    }
    let digest = Sha256::digest(id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % u64::from(partitions)) as u32
}

// ═══════════════════════════════════════════════════════════════════════════════
// Partition Service
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct ClusterState {
    /// Sorted, deduplicated members
    nodes: Vec<NodeId>,
    queues: BTreeSet<QueueKey>,
}

pub struct PartitionService {
    config: DispatchConfig,
    node_id: NodeId,
    bus: LifecycleBus,
    state: RwLock<ClusterState>,
}

impl PartitionService {
    /// Create a service for a cluster that initially consists of this node only.
    pub fn new(config: DispatchConfig, node_id: NodeId, bus: LifecycleBus) -> Self {
        let state = ClusterState {
            nodes: vec![node_id.clone()],
            queues: BTreeSet::new(),
        };
        Self {
            config,
            node_id,
            bus,
            state: RwLock::new(state),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn strategy(&self) -> PartitioningStrategy {
        self.config.partitioning_strategy
    }

    pub fn topic(&self, queue_key: &QueueKey) -> String {
        format!(
            "{}.{}.{}",
            self.config.topic_prefix,
            queue_key.service_type.as_str(),
            queue_key.queue_name
        )
    }

    pub fn partition_count(&self, service_type: ServiceType) -> u32 {
        match service_type {
            ServiceType::TaskProcessor => self.config.task_partitions,
            ServiceType::JobStats => self.config.stats_partitions,
        }
    }

    /// Resolve the topic partition for a message routed by `routing_id`,
    /// or by the tenant when no routing id is given.
    pub fn resolve(
        &self,
        service_type: ServiceType,
        queue_name: &str,
        tenant_id: TenantId,
        routing_id: Option<Uuid>,
    ) -> TopicPartitionInfo {
        let queue_key = QueueKey::new(service_type, queue_name);
        let id = routing_id.unwrap_or(tenant_id.0);
        TopicPartitionInfo::new(
            self.topic(&queue_key),
            partition_for(&id, self.partition_count(service_type)),
        )
    }

    /// Partition of a task under the configured strategy.
    pub fn resolve_task(&self, task: &Task) -> TopicPartitionInfo {
        let routing_id = match self.config.partitioning_strategy {
            PartitioningStrategy::Entity => task.entity_id.map(|e| e.0),
            PartitioningStrategy::Tenant => None,
        };
        self.resolve(
            ServiceType::TaskProcessor,
            task.job_type.queue_name(),
            task.tenant_id,
            routing_id,
        )
    }

    /// Partition of a job's stats; every message of one job lands on the same one.
    pub fn resolve_stats(&self, tenant_id: TenantId, job_id: JobId) -> TopicPartitionInfo {
        self.resolve(ServiceType::JobStats, JOB_STATS_QUEUE, tenant_id, Some(job_id.0))
    }

    /// Every partition of a queue.
    pub fn all_partitions(&self, queue_key: &QueueKey) -> BTreeSet<TopicPartitionInfo> {
        let topic = self.topic(queue_key);
        (0..self.partition_count(queue_key.service_type))
            .map(|p| TopicPartitionInfo::new(topic.clone(), p))
            .collect()
    }

    /// Partitions of a queue owned by this node.
    pub fn my_partitions(&self, queue_key: &QueueKey) -> BTreeSet<TopicPartitionInfo> {
        let state = self.state.read();
        self.owned_by(&state.nodes, queue_key)
    }

    fn owned_by(&self, nodes: &[NodeId], queue_key: &QueueKey) -> BTreeSet<TopicPartitionInfo> {
        if nodes.is_empty() {
            return BTreeSet::new();
        }
        self.all_partitions(queue_key)
            .into_iter()
            .filter(|tpi| nodes[tpi.partition as usize % nodes.len()] == self.node_id)
            .collect()
    }

    /// Owner of a partition among the current members.
    pub fn owner_of(&self, partition: u32) -> Option<NodeId> {
        let state = self.state.read();
        if state.nodes.is_empty() {
            return None;
        }
        Some(state.nodes[partition as usize % state.nodes.len()].clone())
    }

    /// Track a queue consumed on this node and return its current assignment.
    pub fn register_queue(&self, queue_key: QueueKey) -> BTreeSet<TopicPartitionInfo> {
        let mut state = self.state.write();
        let partitions = self.owned_by(&state.nodes, &queue_key);
        tracing::debug!(
            queue = %queue_key,
            partitions = partitions.len(),
            "Queue registered for partition tracking"
        );
        state.queues.insert(queue_key);
        partitions
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.state.read().nodes.clone()
    }

    /// Apply a new membership list and publish the resulting assignment of
    /// every registered queue.
    pub fn update_cluster(&self, nodes: impl IntoIterator<Item = NodeId>) {
        let mut sorted: Vec<NodeId> = nodes.into_iter().collect();
        sorted.sort();
        sorted.dedup();

        let events: Vec<PartitionChangeEvent> = {
            let mut state = self.state.write();
            if state.nodes == sorted {
                return;
            }
            state.nodes = sorted;
            state
                .queues
                .iter()
                .map(|queue_key| PartitionChangeEvent {
                    node_id: self.node_id.clone(),
                    queue_key: queue_key.clone(),
                    partitions: self.owned_by(&state.nodes, queue_key),
                })
                .collect()
        };

        tracing::info!(
            node_id = %self.node_id,
            queues = events.len(),
            "Cluster membership changed, republishing partition assignment"
        );
        for event in events {
            self.bus.publish(ClusterEvent::PartitionsChanged(event));
        }
    }
}
