//! Cluster-wide lifecycle bus.
//!
//! Carries job status changes (to the coordinator), job/tenant lifecycle
//! events (to every executor) and partition reassignments (to consumers).
//!
//! Every subscriber owns an unbounded mpsc channel, so no event is ever dropped
//! for a slow subscriber. `capacity` is only a backlog threshold: a subscriber
//! whose unread backlog reaches it is reported once per crossing.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::dispatch::{QueueKey, TopicPartitionInfo};
use crate::jobs::{Job, JobId, NodeId, TenantId};

// ═══════════════════════════════════════════════════════════════════════════════
// Events
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobLifecycleEvent {
    /// Execution identified by the tasks key was cancelled or superseded
    Stopped,
    /// Execution identified by the tasks key finished as FAILED
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TenantLifecycleEvent {
    Deleted,
}

/// Lifecycle change of a job execution or a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentLifecycleEvent {
    Job {
        tenant_id: TenantId,
        job_id: JobId,
        tasks_key: String,
        event: JobLifecycleEvent,
    },
    Tenant {
        tenant_id: TenantId,
        event: TenantLifecycleEvent,
    },
}

/// New partition assignment of one node for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionChangeEvent {
    pub node_id: NodeId,
    pub queue_key: QueueKey,
    pub partitions: BTreeSet<TopicPartitionInfo>,
}

#[derive(Debug, Clone)]
pub enum ClusterEvent {
    JobStatusChanged(Box<Job>),
    Component(ComponentLifecycleEvent),
    PartitionsChanged(PartitionChangeEvent),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Bus
// ═══════════════════════════════════════════════════════════════════════════════

struct Subscriber {
    id: usize,
    sender: mpsc::UnboundedSender<ClusterEvent>,
    backlog: Arc<AtomicUsize>,
}

#[derive(Debug)]
struct BusInner {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicUsize,
    capacity: usize,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("backlog", &self.backlog.load(Ordering::Relaxed))
            .finish()
    }
}

/// Handle to the lifecycle bus; cheap to clone.
#[derive(Debug, Clone)]
pub struct LifecycleBus {
    inner: Arc<BusInner>,
}

impl LifecycleBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicUsize::new(0),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Publish an event; returns how many subscribers will see it.
    ///
    /// Subscribers are fed in the order they subscribed while the list is
    /// locked, so concurrent publishers never interleave differently for two
    /// subscribers. Closed subscriptions are pruned.
    pub fn publish(&self, event: ClusterEvent) -> usize {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|sub| {
            if sub.sender.send(event.clone()).is_err() {
                return false;
            }
            let backlog = sub.backlog.fetch_add(1, Ordering::Relaxed) + 1;
            if backlog == self.inner.capacity {
                tracing::warn!(
                    subscriber = sub.id,
                    backlog,
                    "Lifecycle bus subscriber is falling behind"
                );
            }
            true
        });
        subscribers.len()
    }

    pub fn subscribe(&self) -> BusSubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push(Subscriber {
            id,
            sender,
            backlog: Arc::clone(&backlog),
        });
        BusSubscription { receiver, backlog }
    }

    pub fn publish_job_status(&self, job: &Job) -> usize {
        self.publish(ClusterEvent::JobStatusChanged(Box::new(job.clone())))
    }

    pub fn publish_job_event(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        tasks_key: impl Into<String>,
        event: JobLifecycleEvent,
    ) -> usize {
        let tasks_key = tasks_key.into();
        tracing::debug!(
            tenant_id = %tenant_id,
            job_id = %job_id,
            tasks_key = %tasks_key,
            event = ?event,
            "Publishing job lifecycle event"
        );
        self.publish(ClusterEvent::Component(ComponentLifecycleEvent::Job {
            tenant_id,
            job_id,
            tasks_key,
            event,
        }))
    }

    pub fn publish_tenant_deleted(&self, tenant_id: TenantId) -> usize {
        tracing::info!(tenant_id = %tenant_id, "Publishing tenant deletion");
        self.publish(ClusterEvent::Component(ComponentLifecycleEvent::Tenant {
            tenant_id,
            event: TenantLifecycleEvent::Deleted,
        }))
    }

    pub fn receiver_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .iter()
            .filter(|sub| !sub.sender.is_closed())
            .count()
    }
}

impl Default for LifecycleBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// A subscriber's view of the bus. Dropping it unsubscribes.
pub struct BusSubscription {
    receiver: mpsc::UnboundedReceiver<ClusterEvent>,
    backlog: Arc<AtomicUsize>,
}

impl BusSubscription {
    /// Next event, or `None` once the bus is gone and the backlog is drained.
    pub async fn recv(&mut self) -> Option<ClusterEvent> {
        let event = self.receiver.recv().await?;
        self.backlog.fetch_sub(1, Ordering::Relaxed);
        Some(event)
    }

    /// Events published but not yet received.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }
}
