/// Execution request and result model
///
/// An `ExecutionRequest` is the immutable admission record produced by a
/// submitter (the façade or the scheduler); only `retry_count` changes, once per
/// re-submission. An `ExecutionResult` is what the execution path hands back.

use crate::error::ExecutionError;
use crate::workflow::{EngineType, WorkflowDefinition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Dequeue priority; higher variants are dispatched first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Critical => "CRITICAL",
        };
        f.write_str(label)
    }
}

/// A single admission candidate
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub id: String,
    pub workflow: Arc<WorkflowDefinition>,
    pub engine_type: EngineType,
    pub parameters: Value,
    pub priority: Priority,
    pub submitted_by: String,
    pub created_at: DateTime<Utc>,
    pub timeout: Duration,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Set when the request was produced by a recurring schedule
    pub schedule_id: Option<String>,
}

impl ExecutionRequest {
    /// Build a fresh request with a new id; engine type is taken from the workflow
    pub fn new(
        workflow: Arc<WorkflowDefinition>,
        parameters: Value,
        priority: Priority,
        submitted_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            engine_type: workflow.engine_type,
            workflow,
            parameters,
            priority,
            submitted_by: submitted_by.into(),
            created_at: Utc::now(),
            timeout: DEFAULT_TIMEOUT,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            schedule_id: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_schedule(mut self, schedule_id: impl Into<String>) -> Self {
        self.schedule_id = Some(schedule_id.into());
        self
    }

    /// The same request re-submitted for another attempt
    pub fn next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.retry_count += 1;
        next
    }

    /// 1-based attempt number of this request
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow.id
    }
}

/// Lifecycle status of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Timeout
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One log line attached to an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

impl ExecutionLog {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            step: None,
        }
    }

    pub fn for_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub duration_ms: u64,
    pub attempts: u32,
    pub steps_executed: usize,
}

/// Outcome of an execution, terminal or intermediate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub id: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub logs: Vec<ExecutionLog>,
    /// Named per-step outputs reported by the engine
    #[serde(default)]
    pub steps: BTreeMap<String, Value>,
    #[serde(default)]
    pub metrics: ExecutionMetrics,
}

impl ExecutionResult {
    fn finished(id: impl Into<String>, status: ExecutionStatus, started_at: DateTime<Utc>) -> Self {
        let completed_at = Utc::now();
        let duration_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            id: id.into(),
            status,
            result: None,
            error: None,
            started_at,
            completed_at: Some(completed_at),
            logs: Vec::new(),
            steps: BTreeMap::new(),
            metrics: ExecutionMetrics {
                duration_ms,
                ..ExecutionMetrics::default()
            },
        }
    }

    /// Intermediate result for an execution that is still in flight
    pub fn running(id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        let mut result = Self::finished(id, ExecutionStatus::Running, started_at);
        result.completed_at = None;
        result
    }

    pub fn completed(id: impl Into<String>, output: Value, started_at: DateTime<Utc>) -> Self {
        let mut result = Self::finished(id, ExecutionStatus::Completed, started_at);
        result.result = Some(output);
        result
    }

    pub fn failed(id: impl Into<String>, error: ExecutionError, started_at: DateTime<Utc>) -> Self {
        let mut result = Self::finished(id, ExecutionStatus::Failed, started_at);
        result.error = Some(error);
        result
    }

    pub fn cancelled(id: impl Into<String>, reason: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        let mut result = Self::finished(id, ExecutionStatus::Cancelled, started_at);
        result.error = Some(ExecutionError::cancelled(reason));
        result
    }

    pub fn timed_out(id: impl Into<String>, timeout: Duration, started_at: DateTime<Utc>) -> Self {
        let mut result = Self::finished(id, ExecutionStatus::Timeout, started_at);
        result.error = Some(ExecutionError::timeout(timeout));
        result
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.metrics.attempts = attempts;
        self
    }
}
