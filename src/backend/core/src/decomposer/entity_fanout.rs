//! Entity fan-out: apply one action to a single entity or to every member of
//! a group.
//!
//! Group membership is resolved page by page through an [`EntityResolver`] so
//! arbitrarily large groups never have to be held in memory at once.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{JobDecomposer, TaskSink};
use crate::config::JobTypesConfig;
use crate::error::{FanoutError, Result};
use crate::executor::{TaskContext, TaskError, TaskProcessor};
use crate::jobs::{EntityId, Job, JobParams, JobType, Task, TaskResult, TenantId};
use crate::telemetry::JobMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FanoutTarget {
    /// A single entity; decomposes into exactly one task
    Entity(EntityId),
    /// Every member of a group
    Group(EntityId),
}

impl FanoutTarget {
    pub fn id(&self) -> EntityId {
        match self {
            Self::Entity(id) | Self::Group(id) => *id,
        }
    }
}

/// Kind of entity a fan-out addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    #[default]
    Device,
    Asset,
    Customer,
    Dashboard,
    User,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Device => "DEVICE",
            Self::Asset => "ASSET",
            Self::Customer => "CUSTOMER",
            Self::Dashboard => "DASHBOARD",
            Self::User => "USER",
        }
    }

    /// Only devices and assets accept fan-out actions.
    pub fn supports_fanout(&self) -> bool {
        matches!(self, Self::Device | Self::Asset)
    }

    fn check_supported(&self) -> Result<()> {
        if self.supports_fanout() {
            Ok(())
        } else {
            Err(FanoutError::validation(unsupported_type_message(*self)))
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn unsupported_type_message(entity_type: EntityType) -> String {
    format!("Entity type '{}' is not supported for fan-out", entity_type)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityFanoutConfig {
    pub target: FanoutTarget,

    /// Type of the targeted entity, or of every member when targeting a group
    #[serde(default)]
    pub entity_type: EntityType,

    /// Action handed to the entity handler for every target
    #[serde(default)]
    pub action: serde_json::Value,
}

impl EntityFanoutConfig {
    pub fn validate(&self) -> Result<()> {
        if self.target.id().is_nil() {
            return Err(FanoutError::validation("Fan-out target id must be set"));
        }
        self.entity_type.check_supported()?;
        if self.action.is_null() {
            return Err(FanoutError::validation("Fan-out action must be set"));
        }
        Ok(())
    }
}

/// Payload of every entity fan-out task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityTaskPayload {
    pub entity_type: EntityType,
    pub action: serde_json::Value,
}

impl EntityTaskPayload {
    fn from_task(task: &Task) -> std::result::Result<Self, TaskError> {
        serde_json::from_value(task.payload.clone())
            .map_err(|e| TaskError::invalid(format!("Malformed entity task payload: {}", e)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Pagination
// ═══════════════════════════════════════════════════════════════════════════════

/// Page request (0-indexed page).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLink {
    pub page: usize,
    pub page_size: usize,
}

impl PageLink {
    pub fn new(page_size: usize) -> Self {
        Self {
            page: 0,
            page_size: page_size.max(1),
        }
    }

    pub fn offset(&self) -> usize {
        self.page * self.page_size
    }

    pub fn next(self) -> Self {
        Self {
            page: self.page + 1,
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total_elements: usize,
    pub has_next: bool,
}

impl<T: Clone> Page<T> {
    /// Cut the page described by `link` out of `items`.
    pub fn from_slice(items: &[T], link: PageLink) -> Self {
        let start = link.offset().min(items.len());
        let end = (start + link.page_size).min(items.len());
        Self {
            data: items[start..end].to_vec(),
            total_elements: items.len(),
            has_next: end < items.len(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Collaborators
// ═══════════════════════════════════════════════════════════════════════════════

/// Resolves group membership.
#[async_trait]
pub trait EntityResolver: Send + Sync {
    async fn find_members(
        &self,
        tenant_id: TenantId,
        group_id: EntityId,
        link: PageLink,
    ) -> Result<Page<EntityId>>;
}

/// Applies a fan-out action to one entity.
#[async_trait]
pub trait EntityHandler: Send + Sync {
    async fn handle(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        action: &serde_json::Value,
        ctx: &TaskContext,
    ) -> std::result::Result<(), TaskError>;
}

/// Group directory held in memory.
#[derive(Debug, Default)]
pub struct InMemoryEntityDirectory {
    groups: DashMap<(TenantId, EntityId), Vec<EntityId>>,
    lookups: AtomicU64,
}

impl InMemoryEntityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the members of a group.
    pub fn set_group(&self, tenant_id: TenantId, group_id: EntityId, members: Vec<EntityId>) {
        self.groups.insert((tenant_id, group_id), members);
    }

    pub fn add_member(&self, tenant_id: TenantId, group_id: EntityId, member: EntityId) {
        self.groups
            .entry((tenant_id, group_id))
            .or_default()
            .push(member);
    }

    /// Pages served so far.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EntityResolver for InMemoryEntityDirectory {
    async fn find_members(
        &self,
        tenant_id: TenantId,
        group_id: EntityId,
        link: PageLink,
    ) -> Result<Page<EntityId>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let members = self
            .groups
            .get(&(tenant_id, group_id))
            .ok_or_else(|| FanoutError::not_found("entity_group", group_id.to_string()))?;
        Ok(Page::from_slice(&members, link))
    }
}

/// Handler that logs each action and counts it.
#[derive(Debug, Default)]
pub struct LoggingEntityHandler {
    handled: AtomicU64,
}

impl LoggingEntityHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EntityHandler for LoggingEntityHandler {
    async fn handle(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        action: &serde_json::Value,
        ctx: &TaskContext,
    ) -> std::result::Result<(), TaskError> {
        self.handled.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            tenant_id = %tenant_id,
            entity_id = %entity_id,
            attempt = ctx.attempt(),
            action = %action,
            "Applying fan-out action"
        );
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Decomposer
// ═══════════════════════════════════════════════════════════════════════════════

pub struct EntityFanoutDecomposer {
    resolver: Arc<dyn EntityResolver>,
    page_size: usize,
    retries: u32,
}

impl EntityFanoutDecomposer {
    pub fn new(resolver: Arc<dyn EntityResolver>, config: &JobTypesConfig) -> Self {
        Self {
            resolver,
            page_size: config.entity_page_size.max(1),
            retries: config.entity_task_retries,
        }
    }

    fn config_of(job: &Job) -> Result<&EntityFanoutConfig> {
        match job.params() {
            JobParams::EntityFanout(config) => Ok(config),
            other => Err(FanoutError::validation(format!(
                "Expected entity fan-out parameters, got {}",
                other.job_type()
            ))),
        }
    }

    fn task(&self, job: &Job, entity_id: EntityId, payload: &serde_json::Value) -> Task {
        Task::for_job(job, Some(entity_id), payload.clone()).with_retries(self.retries)
    }
}

#[async_trait]
impl JobDecomposer for EntityFanoutDecomposer {
    fn job_type(&self) -> JobType {
        JobType::EntityFanout
    }

    async fn process(&self, job: &Job, sink: &TaskSink) -> Result<u32> {
        let config = Self::config_of(job)?;
        config.entity_type.check_supported()?;
        let payload = serde_json::to_value(EntityTaskPayload {
            entity_type: config.entity_type,
            action: config.action.clone(),
        })
        .map_err(|e| FanoutError::decomposition_failed(format!("Cannot encode task payload: {}", e)))?;

        let group_id = match config.target {
            FanoutTarget::Entity(entity_id) => {
                sink.submit(self.task(job, entity_id, &payload)).await?;
                return Ok(sink.submitted());
            }
            FanoutTarget::Group(group_id) => group_id,
        };

        let mut link = PageLink::new(self.page_size);
        loop {
            let page = self
                .resolver
                .find_members(job.tenant_id, group_id, link)
                .await?;
            for member in &page.data {
                sink.submit(self.task(job, *member, &payload)).await?;
            }
            if !page.has_next {
                break;
            }
            link = link.next();
        }

        tracing::debug!(
            tenant_id = %job.tenant_id,
            job_id = %job.id,
            group_id = %group_id,
            submitted = sink.submitted(),
            "Group fan-out decomposed"
        );
        Ok(sink.submitted())
    }

    async fn reprocess(&self, job: &Job, failures: &[TaskResult], sink: &TaskSink) -> Result<()> {
        sink.resubmit_failures(job, failures, self.retries).await?;
        Ok(())
    }

    async fn on_job_finished(&self, job: &Job) {
        JobMetrics::record_job_finished(job.job_type.as_str(), job.status.as_str());
        tracing::info!(
            tenant_id = %job.tenant_id,
            job_id = %job.id,
            status = %job.status,
            success = job.result.success_count,
            failed = job.result.failed_count,
            "Entity fan-out job finished"
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Processor
// ═══════════════════════════════════════════════════════════════════════════════

pub struct EntityTaskProcessor {
    handler: Arc<dyn EntityHandler>,
    timeout: Duration,
}

impl EntityTaskProcessor {
    pub fn new(handler: Arc<dyn EntityHandler>, config: &JobTypesConfig) -> Self {
        Self {
            handler,
            timeout: config.entity_task_timeout,
        }
    }
}

#[async_trait]
impl TaskProcessor for EntityTaskProcessor {
    fn job_type(&self) -> JobType {
        JobType::EntityFanout
    }

    async fn process(&self, task: &Task, ctx: &TaskContext) -> std::result::Result<(), TaskError> {
        let entity_id = task
            .entity_id
            .ok_or_else(|| TaskError::invalid("Task has no target entity"))?;
        let payload = EntityTaskPayload::from_task(task)?;
        if !payload.entity_type.supports_fanout() {
            return Err(TaskError::invalid(unsupported_type_message(payload.entity_type)));
        }
        self.handler
            .handle(task.tenant_id, entity_id, &payload.action, ctx)
            .await
    }

    fn timeout(&self, _task: &Task) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::dispatch::{InMemoryQueue, PartitionService, QueueConsumer, QueueKey, TaskDispatcher};
    use crate::events::LifecycleBus;
    use crate::jobs::NodeId;
    use tokio_util::sync::CancellationToken;

    fn sink() -> (TaskSink, InMemoryQueue<Task>) {
        let partitions = Arc::new(PartitionService::new(
            DispatchConfig::default(),
            NodeId::new("node-a"),
            LifecycleBus::new(8),
        ));
        let queue = InMemoryQueue::<Task>::new();
        (
            TaskSink::new(TaskDispatcher::new(partitions, Arc::new(queue.clone()))),
            queue,
        )
    }

    fn fanout_job(tenant_id: TenantId, target: FanoutTarget) -> Job {
        Job::new(
            tenant_id,
            JobParams::EntityFanout(EntityFanoutConfig {
                target,
                entity_type: EntityType::Device,
                action: serde_json::json!({"op": "reboot"}),
            }),
            "fan-out",
        )
    }

    #[test]
    fn test_page_from_slice() {
        let items: Vec<u32> = (0..5).collect();
        let first = Page::from_slice(&items, PageLink::new(2));
        assert_eq!(first.data, vec![0, 1]);
        assert!(first.has_next);

        let last = Page::from_slice(&items, PageLink::new(2).next().next());
        assert_eq!(last.data, vec![4]);
        assert!(!last.has_next);
        assert_eq!(last.total_elements, 5);
    }

    #[test]
    fn test_config_validation() {
        let config = EntityFanoutConfig {
            target: FanoutTarget::Entity(EntityId::new()),
            entity_type: EntityType::Asset,
            action: serde_json::Value::Null,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unsupported_entity_type_fails_validation() {
        let config = EntityFanoutConfig {
            target: FanoutTarget::Group(EntityId::new()),
            entity_type: EntityType::Customer,
            action: serde_json::json!({"op": "sync"}),
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ValidationError);
        assert!(err.to_string().contains("'CUSTOMER' is not supported"));

        let parsed: EntityFanoutConfig = serde_json::from_value(serde_json::json!({
            "target": {"kind": "ENTITY", "id": EntityId::new()},
            "action": {"op": "sync"}
        }))
        .unwrap();
        assert_eq!(parsed.entity_type, EntityType::Device);
        assert!(parsed.validate().is_ok());
    }

    #[tokio::test]
    async fn test_single_entity_short_circuits() {
        let directory = Arc::new(InMemoryEntityDirectory::new());
        let decomposer = EntityFanoutDecomposer::new(directory.clone(), &JobTypesConfig::default());
        let (sink, queue) = sink();

        let job = fanout_job(TenantId::new(), FanoutTarget::Entity(EntityId::new()));
        assert_eq!(decomposer.process(&job, &sink).await.unwrap(), 1);
        assert_eq!(queue.total_len(), 1);
        assert_eq!(directory.lookups(), 0);
    }

    #[tokio::test]
    async fn test_group_resolved_page_by_page() {
        let tenant = TenantId::new();
        let group = EntityId::new();
        let directory = Arc::new(InMemoryEntityDirectory::new());
        directory.set_group(tenant, group, (0..1100).map(|_| EntityId::new()).collect());

        let decomposer = EntityFanoutDecomposer::new(directory.clone(), &JobTypesConfig::default());
        let (sink, queue) = sink();

        let job = fanout_job(tenant, FanoutTarget::Group(group));
        assert_eq!(decomposer.process(&job, &sink).await.unwrap(), 1100);
        assert_eq!(queue.total_len(), 1100);
        assert_eq!(directory.lookups(), 3);
    }

    #[tokio::test]
    async fn test_unknown_group_fails_decomposition() {
        let directory = Arc::new(InMemoryEntityDirectory::new());
        let decomposer = EntityFanoutDecomposer::new(directory, &JobTypesConfig::default());
        let (sink, _queue) = sink();

        let job = fanout_job(TenantId::new(), FanoutTarget::Group(EntityId::new()));
        let err = decomposer.process(&job, &sink).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::RecordNotFound);
    }

    #[tokio::test]
    async fn test_processor_delegates_to_handler() {
        let handler = Arc::new(LoggingEntityHandler::new());
        let processor = EntityTaskProcessor::new(handler.clone(), &JobTypesConfig::default());
        let job = fanout_job(TenantId::new(), FanoutTarget::Entity(EntityId::new()));
        let ctx = TaskContext::new(1, CancellationToken::new());

        let payload = serde_json::json!({"entity_type": "ASSET", "action": {"op": "ping"}});
        let task = Task::for_job(&job, Some(EntityId::new()), payload.clone());
        processor.process(&task, &ctx).await.unwrap();
        assert_eq!(handler.handled(), 1);

        let orphan = Task::for_job(&job, None, payload);
        let err = processor.process(&orphan, &ctx).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::TaskValidationFailed);
        assert_eq!(processor.timeout(&task), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_processor_rejects_unsupported_entity_type() {
        let handler = Arc::new(LoggingEntityHandler::new());
        let processor = EntityTaskProcessor::new(handler.clone(), &JobTypesConfig::default());
        let job = fanout_job(TenantId::new(), FanoutTarget::Entity(EntityId::new()));
        let ctx = TaskContext::new(1, CancellationToken::new());

        let task = Task::for_job(
            &job,
            Some(EntityId::new()),
            serde_json::json!({"entity_type": "DASHBOARD", "action": {"op": "ping"}}),
        );
        let err = processor.process(&task, &ctx).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::TaskValidationFailed);
        assert!(!err.is_retryable());
        assert!(err.message.contains("'DASHBOARD' is not supported"));

        let malformed = Task::for_job(&job, Some(EntityId::new()), serde_json::json!({"op": "ping"}));
        let err = processor.process(&malformed, &ctx).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::TaskValidationFailed);
        assert_eq!(handler.handled(), 0);
    }

    #[tokio::test]
    async fn test_decomposed_tasks_carry_entity_type() {
        let directory = Arc::new(InMemoryEntityDirectory::new());
        let decomposer = EntityFanoutDecomposer::new(directory, &JobTypesConfig::default());
        let (sink, queue) = sink();

        let job = fanout_job(TenantId::new(), FanoutTarget::Entity(EntityId::new()));
        decomposer.process(&job, &sink).await.unwrap();

        let partitions = PartitionService::new(
            DispatchConfig::default(),
            NodeId::new("node-a"),
            LifecycleBus::new(8),
        );
        let mut consumer = queue.consumer("inspect", 10);
        consumer
            .subscribe(partitions.all_partitions(&QueueKey::tasks(JobType::EntityFanout)))
            .await
            .unwrap();
        let mut batch = consumer.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 1);
        let task = batch.remove(0).value;
        let payload: EntityTaskPayload = serde_json::from_value(task.payload).unwrap();
        assert_eq!(payload.entity_type, EntityType::Device);
        assert_eq!(payload.action, serde_json::json!({"op": "reboot"}));
    }
}
