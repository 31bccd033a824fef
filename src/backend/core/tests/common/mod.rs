//! Shared fixtures for node-level tests.

#![allow(dead_code)]

use fanout_core::config::Config;
use fanout_core::decomposer::{SyntheticDecomposer, SyntheticJobConfig, SyntheticTaskProcessor};
use fanout_core::jobs::{Job, JobParams, TenantId};
use fanout_core::node::{JobsNode, JobsNodeBuilder};
use fanout_core::store::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration with short intervals so tests settle quickly.
pub fn test_config(node_id: &str) -> Config {
    let mut config = Config::default();
    config.node.node_id = node_id.to_string();
    config.coordinator.decomposition_pool_size = 2;
    config.coordinator.shutdown_timeout = Duration::from_millis(500);
    config.executor.poll_interval = Duration::from_millis(20);
    config.executor.shutdown_timeout = Duration::from_millis(500);
    config.aggregator.stats_processing_interval = Duration::from_millis(20);
    config
}

pub fn synthetic_builder(config: Config) -> JobsNodeBuilder {
    JobsNode::builder(config)
        .register(
            Arc::new(SyntheticDecomposer::new()),
            Arc::new(SyntheticTaskProcessor::new()),
        )
        .unwrap()
}

/// A started single-node cluster running synthetic jobs.
pub fn synthetic_node() -> JobsNode {
    let node = synthetic_builder(test_config("node-a")).build().unwrap();
    node.start().unwrap();
    node
}

pub fn synthetic_job(config: SyntheticJobConfig) -> Job {
    Job::new(TenantId::new(), JobParams::Synthetic(config), "synthetic test job")
}

/// Poll the store until `done` holds for the job.
pub async fn wait_for_job<F>(store: &Arc<dyn JobStore>, job: &Job, mut done: F) -> Job
where
    F: FnMut(&Job) -> bool,
{
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        let current = store
            .find_job_by_id(job.tenant_id, job.id)
            .await
            .unwrap()
            .expect("job should exist");
        if done(&current) {
            return current;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for job {}: status {}, result {:?}",
            job.id,
            current.status,
            current.result
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until `cond` holds.
pub async fn wait_until<F>(what: &str, mut cond: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
