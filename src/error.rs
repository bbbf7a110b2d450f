/// Error taxonomy for the orchestration core
///
/// Execution-time failures carry a closed `ErrorCode` so retry decisions are made
/// by value. Admission, scheduling and cancellation failures surface as
/// `OrchestratorError` variants returned synchronously to the caller.

use crate::workflow::EngineType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Closed set of execution failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Engine call exceeded its deadline
    Timeout,
    /// Transport-level failure talking to the engine
    NetworkError,
    /// Engine reported itself unavailable or overloaded
    ServiceUnavailable,
    /// Workflow rejected by the engine
    ValidationFailed,
    /// Workflow ran and failed on its own terms
    WorkflowFailed,
    /// Execution was cancelled
    Cancelled,
    /// No adapter registered for the engine type
    AdapterNotFound,
    /// Circuit breaker for the engine is open
    CircuitOpen,
    /// The worker running the execution was lost and it could not be re-admitted
    WorkerLost,
    Internal,
}

impl ErrorCode {
    /// Only transient infrastructure failures are retried
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout | ErrorCode::NetworkError | ErrorCode::ServiceUnavailable
        )
    }
}

/// Structured execution failure reported by adapters and the execution path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct ExecutionError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ExecutionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("execution exceeded timeout of {}ms", after.as_millis()),
        )
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

/// Errors returned by orchestration operations
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("workflow validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("queue is full (max size {max_size})")]
    QueueFull { max_size: usize },

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("invalid timezone '{0}'")]
    InvalidTimezone(String),

    #[error("schedule error: {0}")]
    Schedule(String),

    #[error("Scheduled workflow not found: {0}")]
    ScheduleNotFound(String),

    #[error("cancellation of {id} failed: {reason}")]
    Cancellation { id: String, reason: String },

    #[error("worker {0} failed")]
    WorkerFailure(String),

    #[error("no adapter registered for engine type '{0}'")]
    AdapterNotFound(EngineType),

    #[error("execution {id} timed out after {}ms", .timeout.as_millis())]
    Timeout { id: String, timeout: Duration },

    #[error("{0} is not running")]
    NotRunning(&'static str),

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification_is_by_code() {
        assert!(ErrorCode::Timeout.is_retryable());
        assert!(ErrorCode::NetworkError.is_retryable());
        assert!(ErrorCode::ServiceUnavailable.is_retryable());
        assert!(!ErrorCode::WorkflowFailed.is_retryable());
        assert!(!ErrorCode::Cancelled.is_retryable());

        // a message that merely mentions a timeout is not retryable
        let err = ExecutionError::new(ErrorCode::WorkflowFailed, "upstream timeout in step 3");
        assert!(!err.is_retryable());
    }

    #[test]
    fn schedule_not_found_message() {
        let err = OrchestratorError::ScheduleNotFound("abc".into());
        assert!(err.to_string().starts_with("Scheduled workflow not found"));
    }

    #[test]
    fn execution_error_serializes_code_in_screaming_case() {
        let err = ExecutionError::new(ErrorCode::ServiceUnavailable, "down");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "SERVICE_UNAVAILABLE");
        assert!(json.get("details").is_none());
    }
}
