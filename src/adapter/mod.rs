/// Engine Adapter Layer
///
/// This module defines the pluggable integration point for external automation
/// engines and the single execution path every component dispatches through:
/// - The `EngineAdapter` capability trait and its result types
/// - A lock-free, hot-swappable adapter registry keyed by engine type
/// - `AdapterDispatcher`, the canonical request → adapter execution path
/// - `LocalAdapter`, a built-in in-process DAG engine

// Lock-free adapter registry using ArcSwap
pub mod registry;

// Canonical execution path shared by the queue and the worker pool
pub mod dispatch;

// Built-in in-process engine
pub mod local;

use crate::error::ExecutionError;
use crate::execution::{ExecutionLog, ExecutionResult};
use crate::workflow::{EngineType, WorkflowDefinition};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use dispatch::{AdapterDispatcher, ExecutionHandler};
pub use local::LocalAdapter;
pub use registry::AdapterRegistry;

/// Outcome of validating a workflow against an engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            ..Self::default()
        }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self {
            is_valid: false,
            errors,
            warnings: Vec::new(),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Outcome of asking an engine to cancel an execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancellationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CancellationResult {
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn declined(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
        }
    }
}

/// What an engine declares it can do
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineCapabilities {
    pub version: String,
    pub supported_features: Vec<String>,
    pub max_concurrent_executions: usize,
}

/// Integration point for one external automation engine
///
/// Implementations translate generic execution requests into calls against a
/// specific engine. The core is polymorphic over this trait and dispatches purely
/// by the workflow's declared engine type.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    fn engine_type(&self) -> EngineType;

    async fn validate_workflow(&self, workflow: &WorkflowDefinition) -> ValidationResult;

    /// Run a workflow to completion under the core's execution id
    ///
    /// Engine-level failures may be reported either as `Err` or as a result with
    /// `Failed` status; the dispatcher normalizes both.
    async fn execute_workflow(
        &self,
        execution_id: &str,
        workflow: &WorkflowDefinition,
        parameters: &Value,
    ) -> Result<ExecutionResult, ExecutionError>;

    async fn cancel_execution(&self, execution_id: &str) -> CancellationResult;

    async fn get_execution_status(&self, execution_id: &str) -> Result<ExecutionResult, ExecutionError>;

    async fn get_execution_logs(&self, execution_id: &str) -> Result<Vec<ExecutionLog>, ExecutionError>;

    async fn convert_workflow(
        &self,
        workflow: &WorkflowDefinition,
        from_engine: EngineType,
    ) -> Result<WorkflowDefinition, ExecutionError>;

    fn capabilities(&self) -> EngineCapabilities;
}
