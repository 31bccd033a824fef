//! Cancellation, tenant deletion and tasks key rotation.

mod common;

use common::{synthetic_job, synthetic_node, wait_for_job, wait_until};
use fanout_core::decomposer::SyntheticJobConfig;
use fanout_core::dispatch::{QueueConsumer, QueueKey, QueueMsg, QueueProducer};
use fanout_core::jobs::{JobStatus, JobType, StatsBody, Task, TaskOutcome};
use std::time::Duration;

fn slow_tasks(count: u32) -> SyntheticJobConfig {
    SyntheticJobConfig {
        successful_tasks_count: count,
        task_processing_time_ms: 30_000,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_cancel_discards_running_tasks() {
    let node = synthetic_node();
    let executor = node.executor(JobType::Synthetic).unwrap();

    let job = node.coordinator().submit_job(synthetic_job(slow_tasks(10))).await.unwrap();
    wait_for_job(node.store(), &job, |j| j.result.total_count == Some(10)).await;
    wait_until("all tasks running", || executor.running_count() == 10).await;

    let cancelled = node.coordinator().cancel_job(job.tenant_id, job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.result.cancellation_ts.is_some());

    let done = wait_for_job(node.store(), &job, |j| j.result.discarded_count == 10).await;
    assert_eq!(done.status, JobStatus::Cancelled);
    assert_eq!(done.result.success_count, 0);
    assert_eq!(done.result.failed_count, 0);
    assert_eq!(executor.running_count(), 0);
    assert!(executor.is_discarded(job.tasks_key()));

    node.stop().await;
}

#[tokio::test]
async fn test_cancel_before_decomposition_runs_nothing() {
    let node = synthetic_node();
    let job = node.coordinator().submit_job(synthetic_job(slow_tasks(10))).await.unwrap();
    node.coordinator().cancel_job(job.tenant_id, job.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let job = wait_for_job(node.store(), &job, |j| j.status == JobStatus::Cancelled).await;
    assert_eq!(job.result.success_count, 0);
    assert_eq!(job.result.failed_count, 0);
    assert!(job.result.start_ts.is_none());

    node.stop().await;
}

#[tokio::test]
async fn test_cancel_terminal_job_rejected() {
    let node = synthetic_node();
    let job = node
        .coordinator()
        .submit_job(synthetic_job(SyntheticJobConfig::default()))
        .await
        .unwrap();
    wait_for_job(node.store(), &job, |j| j.status == JobStatus::Completed).await;

    let err = node.coordinator().cancel_job(job.tenant_id, job.id).await.unwrap_err();
    assert_eq!(err.code(), fanout_core::ErrorCode::InvalidStateTransition);

    node.stop().await;
}

#[tokio::test]
async fn test_tenant_deletion_drops_results() {
    let node = synthetic_node();
    let executor = node.executor(JobType::Synthetic).unwrap();

    let job = node.coordinator().submit_job(synthetic_job(slow_tasks(5))).await.unwrap();
    wait_until("all tasks running", || executor.running_count() == 5).await;

    node.bus().publish_tenant_deleted(job.tenant_id);
    wait_until("running tasks cancelled", || executor.running_count() == 0).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let job = wait_for_job(node.store(), &job, |_| true).await;
    assert_eq!(job.status, JobStatus::Running);
    assert!(job.result.results.is_empty());

    node.stop().await;
}

#[tokio::test]
async fn test_old_key_tasks_never_report_after_reprocess() {
    let node = synthetic_node();
    let executor = node.executor(JobType::Synthetic).unwrap();

    let job = node
        .coordinator()
        .submit_job(synthetic_job(SyntheticJobConfig {
            successful_tasks_count: 1,
            retryable_failures_count: 1,
            errors: vec!["flaky".to_string()],
            ..Default::default()
        }))
        .await
        .unwrap();
    let failed = wait_for_job(node.store(), &job, |j| j.status == JobStatus::Failed).await;
    let old_key = failed.tasks_key().to_string();

    let pending = node.coordinator().reprocess_job(job.tenant_id, job.id).await.unwrap();
    wait_for_job(node.store(), &job, |j| {
        j.tasks_key() == pending.tasks_key() && j.status == JobStatus::Completed
    })
    .await;
    wait_until("old key discarded", || executor.is_discarded(&old_key)).await;

    // Observe the stats topic from the beginning under a separate group.
    let mut observer = node.stats_queue().consumer("observer", 10_000);
    observer
        .subscribe(node.partitions().all_partitions(&QueueKey::stats()))
        .await
        .unwrap();
    while !observer.poll(Duration::ZERO).await.unwrap().is_empty() {}

    // A straggler of the previous execution arrives late.
    let straggler = Task::for_job(&failed, None, serde_json::Value::Null);
    assert_eq!(straggler.key, old_key);
    let tpi = node.partitions().resolve_task(&straggler);
    node.task_queue()
        .send(&tpi, QueueMsg::new(straggler.id, straggler))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let late = observer.poll(Duration::ZERO).await.unwrap();
    assert!(late.iter().all(|msg| match &msg.value.body {
        StatsBody::TaskResult(result) => {
            result.key != old_key || result.outcome == TaskOutcome::Discarded
        }
        StatsBody::TotalTasksCount { .. } => true,
    }));

    let job = wait_for_job(node.store(), &job, |_| true).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.results.len(), 2);

    node.stop().await;
}
