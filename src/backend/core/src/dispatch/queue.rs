//! Partitioned queue transport.
//!
//! Producers append to a topic partition; consumers own a set of partitions,
//! poll batches and commit their position. Delivery is at-least-once: a
//! consumer that re-subscribes resumes from the last committed offset.
//!
//! Offsets are absolute. Once every consumer group that has subscribed to a
//! topic has committed past a message it is dropped from the partition log,
//! so a log only retains what some group has yet to commit.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::partition::TopicPartitionInfo;
use crate::error::{ErrorCode, FanoutError, Result};

/// A keyed message on a partition.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMsg<T> {
    pub key: Uuid,
    pub value: T,
}

impl<T> QueueMsg<T> {
    pub fn new(key: Uuid, value: T) -> Self {
        Self { key, value }
    }
}

/// Trait for queue producers.
#[async_trait]
pub trait QueueProducer<T: Send + 'static>: Send + Sync {
    async fn send(&self, tpi: &TopicPartitionInfo, msg: QueueMsg<T>) -> Result<()>;
}

/// Trait for queue consumers. A consumer is owned by exactly one loop.
#[async_trait]
pub trait QueueConsumer<T: Send + 'static>: Send {
    /// Replace the owned partitions; positions restart at the committed offsets.
    async fn subscribe(&mut self, partitions: BTreeSet<TopicPartitionInfo>) -> Result<()>;

    /// Wait up to `max_wait` for messages on the owned partitions.
    async fn poll(&mut self, max_wait: Duration) -> Result<Vec<QueueMsg<T>>>;

    /// Commit everything returned by previous polls.
    async fn commit(&mut self) -> Result<()>;

    async fn unsubscribe(&mut self);

    fn subscription(&self) -> &BTreeSet<TopicPartitionInfo>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Queue
// ═══════════════════════════════════════════════════════════════════════════════

/// Retained suffix of a partition; `base` is the offset of the first entry.
struct PartitionLog<T> {
    base: usize,
    entries: VecDeque<QueueMsg<T>>,
}

impl<T> Default for PartitionLog<T> {
    fn default() -> Self {
        Self {
            base: 0,
            entries: VecDeque::new(),
        }
    }
}

impl<T> PartitionLog<T> {
    fn end(&self) -> usize {
        self.base + self.entries.len()
    }

    /// Drop entries below `offset`.
    fn truncate_before(&mut self, offset: usize) {
        let drop = offset.saturating_sub(self.base).min(self.entries.len());
        self.entries.drain(..drop);
        self.base += drop;
    }
}

struct QueueState<T> {
    logs: HashMap<TopicPartitionInfo, PartitionLog<T>>,
    committed: HashMap<(String, TopicPartitionInfo), usize>,
    /// Groups that have subscribed to each topic
    groups: HashMap<String, HashSet<String>>,
    closed: bool,
}

impl<T> QueueState<T> {
    fn committed(&self, group: &str, tpi: &TopicPartitionInfo) -> usize {
        self.committed
            .get(&(group.to_string(), tpi.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// Trim `tpi` to the lowest offset committed by any group on its topic.
    fn compact(&mut self, tpi: &TopicPartitionInfo) {
        let low = self
            .groups
            .get(&tpi.topic)
            .and_then(|groups| groups.iter().map(|group| self.committed(group, tpi)).min())
            .unwrap_or(0);
        if let Some(log) = self.logs.get_mut(tpi) {
            log.truncate_before(low);
        }
    }
}

struct QueueInner<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

/// In-process partitioned queue: append-only partition logs with
/// per-consumer-group committed offsets.
pub struct InMemoryQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for InMemoryQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> InMemoryQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    logs: HashMap::new(),
                    committed: HashMap::new(),
                    groups: HashMap::new(),
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Create a consumer in `group` returning at most `max_poll_records` per poll.
    pub fn consumer(&self, group: impl Into<String>, max_poll_records: usize) -> InMemoryConsumer<T> {
        InMemoryConsumer {
            inner: Arc::clone(&self.inner),
            group: group.into(),
            subscription: BTreeSet::new(),
            positions: HashMap::new(),
            max_poll_records: max_poll_records.max(1),
        }
    }

    /// Messages retained on a partition.
    pub fn len(&self, tpi: &TopicPartitionInfo) -> usize {
        self.inner
            .state
            .lock()
            .logs
            .get(tpi)
            .map_or(0, |log| log.entries.len())
    }

    pub fn total_len(&self) -> usize {
        self.inner
            .state
            .lock()
            .logs
            .values()
            .map(|log| log.entries.len())
            .sum()
    }

    /// Offset the next message appended to `tpi` will get.
    pub fn end_offset(&self, tpi: &TopicPartitionInfo) -> usize {
        self.inner.state.lock().logs.get(tpi).map_or(0, PartitionLog::end)
    }

    /// Messages not yet committed by `group` across every partition.
    pub fn lag(&self, group: &str) -> usize {
        let state = self.inner.state.lock();
        state
            .logs
            .iter()
            .map(|(tpi, log)| log.end().saturating_sub(state.committed(group, tpi).max(log.base)))
            .sum()
    }

    /// Reject further sends and wake all pollers.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.notify.notify_waiters();
    }
}

impl<T: Clone + Send + 'static> Default for InMemoryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> QueueProducer<T> for InMemoryQueue<T> {
    async fn send(&self, tpi: &TopicPartitionInfo, msg: QueueMsg<T>) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(FanoutError::new(
                    ErrorCode::QueueClosed,
                    format!("Queue closed, cannot send to {}", tpi),
                ));
            }
            state.logs.entry(tpi.clone()).or_default().entries.push_back(msg);
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }
}

/// Consumer over an [`InMemoryQueue`].
pub struct InMemoryConsumer<T> {
    inner: Arc<QueueInner<T>>,
    group: String,
    subscription: BTreeSet<TopicPartitionInfo>,
    positions: HashMap<TopicPartitionInfo, usize>,
    max_poll_records: usize,
}

impl<T: Clone> InMemoryConsumer<T> {
    /// Take up to `max_poll_records` messages past the current positions.
    fn fetch(&mut self) -> Vec<QueueMsg<T>> {
        let state = self.inner.state.lock();
        let mut batch = Vec::new();
        for tpi in &self.subscription {
            let remaining = self.max_poll_records - batch.len();
            if remaining == 0 {
                break;
            }
            let Some(log) = state.logs.get(tpi) else {
                continue;
            };
            let position = self.positions.entry(tpi.clone()).or_insert(log.base);
            *position = (*position).max(log.base);
            let end = log.end().min(*position + remaining);
            if *position < end {
                let from = *position - log.base;
                batch.extend(log.entries.range(from..end - log.base).cloned());
                *position = end;
            }
        }
        batch
    }

    fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> QueueConsumer<T> for InMemoryConsumer<T> {
    async fn subscribe(&mut self, partitions: BTreeSet<TopicPartitionInfo>) -> Result<()> {
        // The group holds back compaction of these topics from now on; a group
        // joining after messages were trimmed starts at the oldest retained one.
        let mut state = self.inner.state.lock();
        for tpi in &partitions {
            state
                .groups
                .entry(tpi.topic.clone())
                .or_default()
                .insert(self.group.clone());
        }
        self.positions = partitions
            .iter()
            .map(|tpi| {
                let base = state.logs.get(tpi).map_or(0, |log| log.base);
                (tpi.clone(), state.committed(&self.group, tpi).max(base))
            })
            .collect();
        self.subscription = partitions;
        tracing::debug!(
            group = %self.group,
            partitions = self.subscription.len(),
            "Consumer subscribed"
        );
        Ok(())
    }

    async fn poll(&mut self, max_wait: Duration) -> Result<Vec<QueueMsg<T>>> {
        let deadline = Instant::now() + max_wait;
        let inner = Arc::clone(&self.inner);
        loop {
            // Register interest before checking so a concurrent send is not missed.
            let notified = inner.notify.notified();

            let batch = self.fetch();
            if !batch.is_empty() {
                return Ok(batch);
            }
            if self.is_closed() {
                return Err(FanoutError::new(ErrorCode::QueueClosed, "Queue closed"));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn commit(&mut self) -> Result<()> {
        let mut state = self.inner.state.lock();
        for (tpi, position) in &self.positions {
            state
                .committed
                .insert((self.group.clone(), tpi.clone()), *position);
            state.compact(tpi);
        }
        Ok(())
    }

    async fn unsubscribe(&mut self) {
        self.subscription.clear();
        self.positions.clear();
    }

    fn subscription(&self) -> &BTreeSet<TopicPartitionInfo> {
        &self.subscription
    }
}
