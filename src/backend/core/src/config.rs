//! Configuration management.
//!
//! Values come from an optional file plus `FANOUT__*` environment variables,
//! e.g. `FANOUT__EXECUTOR__MAX_CONCURRENT_TASKS=32`.

use serde::Deserialize;
use std::time::Duration;

use crate::dispatch::PartitioningStrategy;
use crate::error::{FanoutError, Result};
use crate::telemetry::TelemetryConfig;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub aggregator: AggregatorConfig,

    #[serde(default)]
    pub jobs: JobTypesConfig,

    #[serde(default)]
    pub observability: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Identity of this node in the cluster
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Capacity of the lifecycle bus
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            bus_capacity: default_bus_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Prefix of every topic name
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Partitions per task topic
    #[serde(default = "default_task_partitions")]
    pub task_partitions: u32,

    /// Partitions of the stats topic
    #[serde(default = "default_stats_partitions")]
    pub stats_partitions: u32,

    /// How tasks are routed to partitions
    #[serde(default)]
    pub partitioning_strategy: PartitioningStrategy,

    /// Upper bound of messages returned by one poll
    #[serde(default = "default_max_poll_records")]
    pub max_poll_records: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            topic_prefix: default_topic_prefix(),
            task_partitions: default_task_partitions(),
            stats_partitions: default_stats_partitions(),
            partitioning_strategy: PartitioningStrategy::default(),
            max_poll_records: default_max_poll_records(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// Concurrent decompositions; defaults to the number of cores
    #[serde(default = "default_decomposition_pool_size")]
    pub decomposition_pool_size: usize,

    /// Grace period for running decompositions on stop
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            decomposition_pool_size: default_decomposition_pool_size(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Tasks executing concurrently per job type
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Longest a single poll waits for messages
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How long discarded keys, failed keys and deleted tenants are remembered
    #[serde(default = "default_lifecycle_ttl", with = "humantime_serde")]
    pub lifecycle_ttl: Duration,

    /// How often the lifecycle sets are purged
    #[serde(default = "default_purge_interval", with = "humantime_serde")]
    pub purge_interval: Duration,

    /// Grace period for in-flight tasks on stop
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            poll_interval: default_poll_interval(),
            lifecycle_ttl: default_lifecycle_ttl(),
            purge_interval: default_purge_interval(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    /// Window between stats batches
    #[serde(default = "default_stats_processing_interval", with = "humantime_serde")]
    pub stats_processing_interval: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            stats_processing_interval: default_stats_processing_interval(),
        }
    }
}

/// Settings of the built-in job types.
#[derive(Debug, Clone, Deserialize)]
pub struct JobTypesConfig {
    /// Per-task timeout of entity fan-out tasks
    #[serde(default = "default_entity_task_timeout", with = "humantime_serde")]
    pub entity_task_timeout: Duration,

    /// Page size used when resolving group members
    #[serde(default = "default_entity_page_size")]
    pub entity_page_size: usize,

    /// Retries of each entity fan-out task
    #[serde(default)]
    pub entity_task_retries: u32,
}

impl Default for JobTypesConfig {
    fn default() -> Self {
        Self {
            entity_task_timeout: default_entity_task_timeout(),
            entity_page_size: default_entity_page_size(),
            entity_task_retries: 0,
        }
    }
}

// Default value functions
fn default_node_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "fanout-node-1".to_string())
}
fn default_bus_capacity() -> usize { 4096 }
fn default_topic_prefix() -> String { "fanout".to_string() }
fn default_task_partitions() -> u32 { 12 }
fn default_stats_partitions() -> u32 { 4 }
fn default_max_poll_records() -> usize { 512 }
fn default_decomposition_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
fn default_max_concurrent_tasks() -> usize { 64 }
fn default_poll_interval() -> Duration { Duration::from_millis(100) }
fn default_lifecycle_ttl() -> Duration { Duration::from_secs(60 * 60) }
fn default_purge_interval() -> Duration { Duration::from_secs(60) }
fn default_shutdown_timeout() -> Duration { Duration::from_secs(10) }
fn default_stats_processing_interval() -> Duration { Duration::from_millis(250) }
fn default_entity_task_timeout() -> Duration { Duration::from_secs(30) }
fn default_entity_page_size() -> usize { 512 }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("FANOUT").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a file, with environment overrides on top.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("FANOUT").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.node_id.trim().is_empty() {
            return Err(FanoutError::configuration("node.node_id must not be empty"));
        }
        if self.dispatch.task_partitions == 0 || self.dispatch.stats_partitions == 0 {
            return Err(FanoutError::configuration("partition counts must be positive"));
        }
        if self.dispatch.max_poll_records == 0 {
            return Err(FanoutError::configuration("dispatch.max_poll_records must be positive"));
        }
        if self.coordinator.decomposition_pool_size == 0 {
            return Err(FanoutError::configuration(
                "coordinator.decomposition_pool_size must be positive",
            ));
        }
        if self.executor.max_concurrent_tasks == 0 {
            return Err(FanoutError::configuration(
                "executor.max_concurrent_tasks must be positive",
            ));
        }
        if self.jobs.entity_page_size == 0 {
            return Err(FanoutError::configuration("jobs.entity_page_size must be positive"));
        }
        Ok(())
    }
}
