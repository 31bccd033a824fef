//! Job type registry.
//!
//! Maps each [`JobType`] to its decomposer and task processor. Built once at
//! startup and shared read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use super::job::JobType;
use crate::decomposer::JobDecomposer;
use crate::error::{FanoutError, Result};
use crate::executor::TaskProcessor;

/// The decomposer/processor pair registered for one job type.
#[derive(Clone)]
pub struct JobTypeEntry {
    pub decomposer: Arc<dyn JobDecomposer>,
    pub processor: Arc<dyn TaskProcessor>,
}

#[derive(Clone, Default)]
pub struct JobTypeRegistry {
    entries: HashMap<JobType, JobTypeEntry>,
}

impl JobTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decomposer and processor for the type they both declare.
    pub fn register(
        &mut self,
        decomposer: Arc<dyn JobDecomposer>,
        processor: Arc<dyn TaskProcessor>,
    ) -> Result<()> {
        let job_type = decomposer.job_type();
        if processor.job_type() != job_type {
            return Err(FanoutError::configuration(format!(
                "Decomposer handles {} but task processor handles {}",
                job_type,
                processor.job_type()
            )));
        }
        if self.entries.contains_key(&job_type) {
            return Err(FanoutError::configuration(format!(
                "Job type {} registered twice",
                job_type
            )));
        }

        tracing::debug!(job_type = %job_type, "Job type registered");
        self.entries.insert(
            job_type,
            JobTypeEntry {
                decomposer,
                processor,
            },
        );
        Ok(())
    }

    pub fn get(&self, job_type: JobType) -> Result<&JobTypeEntry> {
        self.entries
            .get(&job_type)
            .ok_or_else(|| FanoutError::job_type_not_registered(job_type))
    }

    pub fn decomposer(&self, job_type: JobType) -> Result<Arc<dyn JobDecomposer>> {
        self.get(job_type).map(|e| Arc::clone(&e.decomposer))
    }

    pub fn processor(&self, job_type: JobType) -> Result<Arc<dyn TaskProcessor>> {
        self.get(job_type).map(|e| Arc::clone(&e.processor))
    }

    pub fn contains(&self, job_type: JobType) -> bool {
        self.entries.contains_key(&job_type)
    }

    /// Registered types in a stable order.
    pub fn job_types(&self) -> Vec<JobType> {
        JobType::ALL
            .into_iter()
            .filter(|t| self.entries.contains_key(t))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for JobTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobTypeRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
