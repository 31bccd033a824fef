//! Progress aggregation.
//!
//! Task results and expected totals travel on the stats topic, keyed by job
//! id. The aggregator drains its partitions once per processing interval,
//! folds the batch into one [`JobStats`] per job and hands each to the store.
//! A failing job never blocks the others; the batch is committed regardless.

pub mod publisher;

pub use publisher::StatsPublisher;

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AggregatorConfig;
use crate::dispatch::{PartitionService, QueueConsumer, QueueKey, QueueMsg, TopicPartitionInfo};
use crate::error::{ErrorCode, FanoutError, Result};
use crate::events::{BusSubscription, ClusterEvent, LifecycleBus};
use crate::jobs::{JobId, JobStats, JobStatsMsg, NodeId, TenantId};
use crate::store::JobStore;
use crate::telemetry::{JobMetrics, OperationTimer};

/// Outcome of one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub messages: usize,
    pub jobs: usize,
    pub failures: usize,
}

pub struct ProgressAggregator {
    config: AggregatorConfig,
    store: Arc<dyn JobStore>,
    partitions: Arc<PartitionService>,
    bus: LifecycleBus,
    consumer: Mutex<Option<Box<dyn QueueConsumer<JobStatsMsg>>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl ProgressAggregator {
    pub fn new(
        config: AggregatorConfig,
        store: Arc<dyn JobStore>,
        consumer: Box<dyn QueueConsumer<JobStatsMsg>>,
        partitions: Arc<PartitionService>,
        bus: LifecycleBus,
    ) -> Self {
        Self {
            config,
            store,
            partitions,
            bus,
            consumer: Mutex::new(Some(consumer)),
            handle: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn start(&self) -> Result<()> {
        let consumer = self
            .consumer
            .lock()
            .take()
            .ok_or_else(|| FanoutError::internal("Progress aggregator already started"))?;

        let events = self.bus.subscribe();
        let initial = self.partitions.register_queue(QueueKey::stats());

        tracing::info!(
            partitions = initial.len(),
            interval_ms = self.config.stats_processing_interval.as_millis() as u64,
            "Progress aggregator starting"
        );

        let worker = AggregatorLoop {
            node_id: self.partitions.node_id().clone(),
            store: Arc::clone(&self.store),
            interval: self.config.stats_processing_interval.max(Duration::from_millis(1)),
            shutdown: self.shutdown.clone(),
        };
        *self.handle.lock() = Some(tokio::spawn(worker.run(consumer, events, initial)));
        Ok(())
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Progress aggregator loop panicked");
            }
        }
        tracing::info!("Progress aggregator stopped");
    }
}

struct AggregatorLoop {
    node_id: NodeId,
    store: Arc<dyn JobStore>,
    interval: Duration,
    shutdown: CancellationToken,
}

impl AggregatorLoop {
    async fn run(
        self,
        mut consumer: Box<dyn QueueConsumer<JobStatsMsg>>,
        mut events: BusSubscription,
        initial: BTreeSet<TopicPartitionInfo>,
    ) {
        if let Err(e) = consumer.subscribe(initial).await {
            e.log();
        }

        let stats_key = QueueKey::stats();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(ClusterEvent::PartitionsChanged(change))
                        if change.node_id == self.node_id && change.queue_key == stats_key =>
                    {
                        tracing::info!(partitions = change.partitions.len(), "Stats partitions reassigned");
                        if let Err(e) = consumer.subscribe(change.partitions).await {
                            e.log();
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = ticker.tick() => {
                    if !self.drain(consumer.as_mut()).await {
                        break;
                    }
                }
            }
        }

        consumer.unsubscribe().await;
        tracing::debug!("Progress aggregator loop stopped");
    }

    /// Process everything currently available. Returns `false` once the
    /// queue is closed.
    async fn drain(&self, consumer: &mut dyn QueueConsumer<JobStatsMsg>) -> bool {
        loop {
            let batch = match consumer.poll(Duration::ZERO).await {
                Ok(batch) => batch,
                Err(e) if e.code() == ErrorCode::QueueClosed => return false,
                Err(e) => {
                    e.log();
                    return true;
                }
            };
            if batch.is_empty() {
                return true;
            }

            process_batch(self.store.as_ref(), batch).await;
            if let Err(e) = consumer.commit().await {
                e.log();
            }
        }
    }
}

/// Fold a batch into per-job stats and apply each to the store.
///
/// Results of one job keep their arrival order.
pub async fn process_batch(store: &dyn JobStore, batch: Vec<QueueMsg<JobStatsMsg>>) -> BatchSummary {
    let timer = OperationTimer::start("stats_batch");
    let messages = batch.len();

    let mut order: Vec<(TenantId, JobId)> = Vec::new();
    let mut grouped: HashMap<(TenantId, JobId), JobStats> = HashMap::new();
    for msg in batch {
        let JobStatsMsg {
            tenant_id,
            job_id,
            body,
        } = msg.value;
        grouped
            .entry((tenant_id, job_id))
            .or_insert_with(|| {
                order.push((tenant_id, job_id));
                JobStats::new(tenant_id, job_id)
            })
            .merge(body);
    }

    let mut failures = 0;
    for key in &order {
        let Some(stats) = grouped.remove(key) else {
            continue;
        };
        let (tenant_id, job_id) = *key;
        if let Err(e) = store.process_stats(tenant_id, job_id, stats).await {
            failures += 1;
            tracing::warn!(
                tenant_id = %tenant_id,
                job_id = %job_id,
                error = %e,
                "Failed to apply job stats"
            );
        }
    }

    JobMetrics::record_stats_batch(messages, failures);
    let elapsed = timer.finish();
    tracing::trace!(
        messages,
        jobs = order.len(),
        failures,
        elapsed_ms = elapsed.as_millis() as u64,
        "Stats batch processed"
    );

    BatchSummary {
        messages,
        jobs: order.len(),
        failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decomposer::SyntheticJobConfig;
    use crate::jobs::{Job, JobParams, JobStatus, Task, TaskResult};
    use crate::store::InMemoryJobStore;
    use uuid::Uuid;

    fn msg(value: JobStatsMsg) -> QueueMsg<JobStatsMsg> {
        QueueMsg::new(value.job_id.0, value)
    }

    #[tokio::test]
    async fn test_batch_groups_by_job_and_tolerates_failures() {
        let store = InMemoryJobStore::new(LifecycleBus::new(64));
        let job = store
            .save_job(Job::new(
                TenantId::new(),
                JobParams::Synthetic(SyntheticJobConfig::default()),
                "aggregated",
            ))
            .await
            .unwrap();
        store.mark_as_running(job.tenant_id, job.id).await.unwrap();

        let task = Task::for_job(&job, None, serde_json::Value::Null);
        let missing = JobId::from_uuid(Uuid::new_v4());
        let batch = vec![
            msg(JobStatsMsg::task_result(job.tenant_id, job.id, TaskResult::success(&task, 1))),
            msg(JobStatsMsg::task_result(job.tenant_id, missing, TaskResult::success(&task, 1))),
            msg(JobStatsMsg::task_result(job.tenant_id, job.id, TaskResult::success(&task, 1))),
            msg(JobStatsMsg::total_tasks_count(job.tenant_id, job.id, job.tasks_key(), 2)),
        ];

        let summary = process_batch(&store, batch).await;
        assert_eq!(
            summary,
            BatchSummary {
                messages: 4,
                jobs: 2,
                failures: 1
            }
        );

        let stored = store.find_job_by_id(job.tenant_id, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.result.success_count, 2);
    }
}
