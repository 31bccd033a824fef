//! Task processor contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorCode, FanoutError};
use crate::jobs::{JobType, Task};

// ═══════════════════════════════════════════════════════════════════════════════
// Task Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error returned by a task attempt.
///
/// Codes come from the task range of [`ErrorCode`]; only retryable codes are
/// attempted again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub message: String,
    pub code: ErrorCode,
}

impl TaskError {
    /// A failed attempt, retried while the task has attempts left.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: ErrorCode::TaskExecutionFailed,
        }
    }

    /// The task itself is malformed; further attempts cannot succeed.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(message).with_code(ErrorCode::TaskValidationFailed)
    }

    /// The attempt observed its cancellation token and gave up.
    pub fn cancelled() -> Self {
        Self::new("Task cancelled").with_code(ErrorCode::TaskCancelled)
    }

    /// The attempt did not finish within `timeout`.
    pub fn timeout(timeout: Duration) -> Self {
        Self::new(format!("Task timed out after {}ms", timeout.as_millis()))
            .with_code(ErrorCode::TaskTimeout)
    }

    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = code;
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.code == ErrorCode::TaskTimeout
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if self.code != ErrorCode::TaskExecutionFailed {
            write!(f, " (code: {})", self.code)?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskError {}

impl From<FanoutError> for TaskError {
    fn from(error: FanoutError) -> Self {
        let code = match error.code() {
            code if code.category() == "task" => code,
            ErrorCode::ValidationError => ErrorCode::TaskValidationFailed,
            _ => ErrorCode::TaskExecutionFailed,
        };
        Self::new(error.user_message()).with_code(code)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Task Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-attempt execution context.
#[derive(Debug, Clone)]
pub struct TaskContext {
    attempt: u32,
    token: CancellationToken,
}

impl TaskContext {
    pub fn new(attempt: u32, token: CancellationToken) -> Self {
        Self { attempt, token }
    }

    /// Current attempt number (1-indexed).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the task is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Run `future` unless the task is cancelled first.
    pub async fn cancellable<F, T>(&self, future: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            result = future => Some(result),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Processor Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Executes tasks of one job type.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    fn job_type(&self) -> JobType;

    /// Run one attempt of `task`.
    ///
    /// Errors are retried by the executor while the task has attempts left.
    async fn process(&self, task: &Task, ctx: &TaskContext) -> Result<(), TaskError>;

    /// Upper bound of one attempt.
    fn timeout(&self, task: &Task) -> Duration;
}
