//! Error handling for Fanout Core.
//!
//! This module provides:
//! - A single error type with codes, context and chaining
//! - Machine-readable error codes grouped by category
//! - User-facing vs internal messages
//! - Severity-aware logging through `tracing`
//! - An error counter through `metrics`
//!
//! # Usage
//!
//! ```rust,ignore
//! use fanout_core::error::{ErrorCode, ErrorContext, Result};
//!
//! fn load() -> Result<String> {
//!     std::fs::read_to_string("fanout.toml").with_error_code(ErrorCode::ConfigurationError)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Fanout operations.
pub type Result<T> = std::result::Result<T, FanoutError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and safe to persist alongside job results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Job Errors (1000-1099)
    JobNotFound,
    InvalidStateTransition,
    ReprocessInconsistent,
    DecompositionFailed,

    // Task Errors (1100-1199)
    TaskValidationFailed,
    TaskExecutionFailed,
    TaskTimeout,
    TaskCancelled,

    // Queue Errors (2000-2099)
    QueueError,
    QueueClosed,

    // Store Errors (2100-2199)
    StoreError,
    RecordNotFound,

    // Validation Errors (4100-4199)
    ValidationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,
    JobTypeNotRegistered,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::JobNotFound => 1000,
            Self::InvalidStateTransition => 1001,
            Self::ReprocessInconsistent => 1002,
            Self::DecompositionFailed => 1003,

            Self::TaskValidationFailed => 1100,
            Self::TaskExecutionFailed => 1101,
            Self::TaskTimeout => 1102,
            Self::TaskCancelled => 1103,

            Self::QueueError => 2000,
            Self::QueueClosed => 2001,

            Self::StoreError => 2100,
            Self::RecordNotFound => 2101,

            Self::ValidationError => 4100,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,
            Self::JobTypeNotRegistered => 5003,

            Self::InternalError => 9000,
        }
    }

    /// Whether another attempt of the same operation may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TaskExecutionFailed | Self::TaskTimeout | Self::QueueError | Self::StoreError
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "job",
            1100..=1199 => "task",
            2000..=2099 => "queue",
            2100..=2199 => "store",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, illegal transitions)
    Low,
    /// Operational issues (task failures, timeouts)
    Medium,
    /// System errors (store or queue failures)
    High,
    /// Critical errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ValidationError
            | ErrorCode::TaskValidationFailed
            | ErrorCode::TaskCancelled
            | ErrorCode::JobNotFound
            | ErrorCode::RecordNotFound
            | ErrorCode::InvalidStateTransition
            | ErrorCode::ReprocessInconsistent => Self::Low,

            ErrorCode::TaskExecutionFailed
            | ErrorCode::TaskTimeout
            | ErrorCode::DecompositionFailed => Self::Medium,

            ErrorCode::QueueError
            | ErrorCode::QueueClosed
            | ErrorCode::StoreError
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration
            | ErrorCode::JobTypeNotRegistered => Self::High,

            ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (job, tenant, task)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Fanout Core.
#[derive(Error, Debug)]
pub struct FanoutError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Message safe to store on a job record
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for FanoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl FanoutError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a not found error.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::RecordNotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Job Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a job not found error.
    pub fn job_not_found(job_id: impl fmt::Display) -> Self {
        let id = job_id.to_string();
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", id))
            .with_details(ErrorDetails::new().with_entity("job", id))
    }

    /// Create an invalid job status transition error.
    pub fn invalid_transition(from: impl fmt::Debug, to: impl fmt::Debug) -> Self {
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Invalid status transition: {:?} -> {:?}", from, to),
        )
    }

    /// Create an error for a job type without a registered decomposer/processor pair.
    pub fn job_type_not_registered(job_type: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::JobTypeNotRegistered,
            format!("Job type not registered: {}", job_type),
        )
        .with_details(
            ErrorDetails::new()
                .with_suggestion("Register a decomposer and task processor for this job type at startup"),
        )
    }

    /// Create a decomposition failure; the message becomes the job's general error.
    pub fn decomposition_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DecompositionFailed, message.into())
    }

    /// Create a reprocess consistency error.
    pub fn reprocess_inconsistent(failed_count: u32, failures: usize) -> Self {
        Self::new(
            ErrorCode::ReprocessInconsistent,
            format!(
                "Failed tasks count {} exceeds the {} recorded failure results",
                failed_count, failures
            ),
        )
        .with_context("failed_count", failed_count)
        .with_context("recorded_failures", failures)
    }

    /// Create a task validation error.
    pub fn task_validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TaskValidationFailed, message.into())
    }

    /// Create a queue error.
    pub fn queue(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::QueueError, "Queue operation failed", message)
    }

    /// Create a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::StoreError, "Job store operation failed", message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "fanout_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Convert the error into a `FanoutError` carrying `code`.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| FanoutError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| FanoutError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<config::ConfigError> for FanoutError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::TaskTimeout.is_retryable());
        assert!(ErrorCode::TaskExecutionFailed.is_retryable());
        assert!(ErrorCode::StoreError.is_retryable());
        assert!(!ErrorCode::TaskValidationFailed.is_retryable());
        assert!(!ErrorCode::TaskCancelled.is_retryable());
        assert!(!ErrorCode::ValidationError.is_retryable());
        assert!(!ErrorCode::JobTypeNotRegistered.is_retryable());
    }

    #[test]
    fn test_error_code_category() {
        assert_eq!(ErrorCode::JobNotFound.category(), "job");
        assert_eq!(ErrorCode::TaskTimeout.category(), "task");
        assert_eq!(ErrorCode::JobTypeNotRegistered.category(), "configuration");
        assert_eq!(ErrorCode::ReprocessInconsistent.category(), "job");
    }

    #[test]
    fn test_job_not_found() {
        let id = uuid::Uuid::new_v4();
        let error = FanoutError::job_not_found(id);
        assert_eq!(error.code(), ErrorCode::JobNotFound);
        assert_eq!(error.details().entity_id, Some(id.to_string()));
        assert_eq!(error.severity(), ErrorSeverity::Low);
    }

    #[test]
    fn test_reprocess_inconsistent_context() {
        let error = FanoutError::reprocess_inconsistent(3, 1);
        assert_eq!(error.code(), ErrorCode::ReprocessInconsistent);
        assert!(error.details().context.contains_key("failed_count"));
        assert!(error.details().context.contains_key("recorded_failures"));
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::ValidationError),
            ErrorSeverity::Low
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::TaskTimeout),
            ErrorSeverity::Medium
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::StoreError),
            ErrorSeverity::High
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::InternalError),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_with_error_code() {
        let missing: Option<u32> = None;
        let error = missing.with_error_code(ErrorCode::RecordNotFound).unwrap_err();
        assert_eq!(error.code(), ErrorCode::RecordNotFound);

        let parsed: std::result::Result<u32, _> = "x".parse::<u32>();
        let error = parsed.with_error_code(ErrorCode::TaskValidationFailed).unwrap_err();
        assert_eq!(error.code(), ErrorCode::TaskValidationFailed);
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn test_error_display() {
        let error = FanoutError::with_internal(
            ErrorCode::StoreError,
            "Job store operation failed",
            "entry locked",
        );

        let display = format!("{}", error);
        assert!(display.contains("StoreError"));
        assert!(display.contains("Job store operation failed"));
        assert!(display.contains("entry locked"));
    }
}
