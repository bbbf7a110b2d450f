/// Canonical execution path
///
/// Both the execution queue and the worker pool run requests through an
/// `ExecutionHandler`; `AdapterDispatcher` is the production implementation that
/// resolves the registered adapter for the request's engine type, enforces the
/// request timeout and normalizes engine failures into `ExecutionError`s.

use crate::adapter::{AdapterRegistry, CancellationResult};
use crate::error::{ErrorCode, ExecutionError};
use crate::execution::{ExecutionRequest, ExecutionResult, ExecutionStatus};
use async_trait::async_trait;
use std::sync::Arc;

/// Runs a single attempt of an execution request
#[async_trait]
pub trait ExecutionHandler: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecutionError>;

    /// Best-effort cancellation of an in-flight attempt
    async fn cancel(&self, request: &ExecutionRequest) -> CancellationResult {
        CancellationResult::declined(format!(
            "cancellation not supported for execution {}",
            request.id
        ))
    }
}

/// Dispatches requests to the adapter registered for their engine type
#[derive(Debug, Clone)]
pub struct AdapterDispatcher {
    adapters: Arc<AdapterRegistry>,
}

impl AdapterDispatcher {
    pub fn new(adapters: Arc<AdapterRegistry>) -> Self {
        Self { adapters }
    }

    pub fn adapters(&self) -> &Arc<AdapterRegistry> {
        &self.adapters
    }
}

#[async_trait]
impl ExecutionHandler for AdapterDispatcher {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecutionError> {
        let adapter = self.adapters.get(request.engine_type).ok_or_else(|| {
            ExecutionError::new(
                ErrorCode::AdapterNotFound,
                format!("no adapter registered for engine type '{}'", request.engine_type),
            )
        })?;

        tracing::debug!(
            "📤 Dispatching execution {} (attempt {}) to {} adapter",
            request.id,
            request.attempt(),
            request.engine_type
        );

        let call = adapter.execute_workflow(&request.id, &request.workflow, &request.parameters);
        let result = match tokio::time::timeout(request.timeout, call).await {
            Ok(outcome) => outcome?,
            Err(_) => {
                // the engine call is dropped; ask the engine to stop as well
                let cancellation = adapter.cancel_execution(&request.id).await;
                if !cancellation.success {
                    tracing::debug!(
                        "Engine did not confirm cancellation of timed-out execution {}: {:?}",
                        request.id,
                        cancellation.error
                    );
                }
                return Err(ExecutionError::timeout(request.timeout));
            }
        };

        match result.status {
            ExecutionStatus::Failed | ExecutionStatus::Timeout | ExecutionStatus::Cancelled => {
                let fallback_code = match result.status {
                    ExecutionStatus::Timeout => ErrorCode::Timeout,
                    ExecutionStatus::Cancelled => ErrorCode::Cancelled,
                    _ => ErrorCode::WorkflowFailed,
                };
                Err(result.error.unwrap_or_else(|| {
                    ExecutionError::new(fallback_code, "engine reported failure without details")
                }))
            }
            _ => Ok(result.with_attempts(request.attempt())),
        }
    }

    async fn cancel(&self, request: &ExecutionRequest) -> CancellationResult {
        match self.adapters.get(request.engine_type) {
            Some(adapter) => adapter.cancel_execution(&request.id).await,
            None => CancellationResult::declined(format!(
                "no adapter registered for engine type '{}'",
                request.engine_type
            )),
        }
    }
}
