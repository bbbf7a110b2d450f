/// Built-in in-process engine adapter
///
/// Executes `local` workflow definitions directly: the definition is turned into
/// a petgraph DAG and its nodes run in topological order, threading a JSON state
/// object from node to node. Useful for smoke-testing the orchestration core
/// without an external engine.
///
/// Node types:
/// - `start` / `noop`: pass the state through
/// - `set`: merge `params.values` (object) into the state
/// - `log`: append `params.message` to the execution log
/// - `delay`: sleep `params.ms` milliseconds (cancellable)
/// - `fail`: fail with `params.code` (ErrorCode, default WORKFLOW_FAILED) and `params.message`

use crate::adapter::{
    CancellationResult, EngineAdapter, EngineCapabilities, ValidationResult,
};
use crate::error::{ErrorCode, ExecutionError};
use crate::execution::{ExecutionLog, ExecutionResult, LogLevel};
use crate::workflow::{EngineType, Node, WorkflowDefinition, WorkflowGraph};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const KNOWN_NODE_TYPES: &[&str] = &["start", "noop", "set", "log", "delay", "fail"];
const FINISHED_RETENTION: usize = 1000;

struct RunningExecution {
    token: CancellationToken,
    started_at: DateTime<Utc>,
}

type RunningTable = Mutex<HashMap<String, RunningExecution>>;

fn lock_running(running: &RunningTable) -> MutexGuard<'_, HashMap<String, RunningExecution>> {
    running.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the running entry however the execution future ends, including when it is dropped
struct RunningGuard<'a> {
    running: &'a RunningTable,
    execution_id: String,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        lock_running(self.running).remove(&self.execution_id);
    }
}

/// Bounded store of finished results, oldest evicted first
#[derive(Default)]
struct FinishedExecutions {
    results: HashMap<String, ExecutionResult>,
    order: VecDeque<String>,
}

impl FinishedExecutions {
    fn insert(&mut self, result: ExecutionResult) {
        if !self.results.contains_key(&result.id) {
            self.order.push_back(result.id.clone());
        }
        self.results.insert(result.id.clone(), result);
        while self.order.len() > FINISHED_RETENTION {
            if let Some(oldest) = self.order.pop_front() {
                self.results.remove(&oldest);
            }
        }
    }
}

pub struct LocalAdapter {
    running: RunningTable,
    finished: RwLock<FinishedExecutions>,
    max_concurrent_executions: usize,
}

impl LocalAdapter {
    pub fn new() -> Self {
        Self::with_max_concurrency(64)
    }

    pub fn with_max_concurrency(max_concurrent_executions: usize) -> Self {
        Self {
            running: Mutex::new(HashMap::new()),
            finished: RwLock::new(FinishedExecutions::default()),
            max_concurrent_executions,
        }
    }

    /// Run a single node against the threaded state
    async fn execute_node(
        &self,
        node: &Node,
        state: &mut Map<String, Value>,
        logs: &mut Vec<ExecutionLog>,
        token: &CancellationToken,
    ) -> Result<Value, ExecutionError> {
        match node.node_type.as_str() {
            "start" | "noop" => Ok(Value::Object(state.clone())),
            "set" => {
                let values = node.params.get("values").and_then(|v| v.as_object()).cloned().unwrap_or_default();
                for (key, value) in &values {
                    state.insert(key.clone(), value.clone());
                }
                Ok(Value::Object(values))
            }
            "log" => {
                let message = node.params.get("message").and_then(|m| m.as_str()).unwrap_or_default();
                logs.push(ExecutionLog::new(LogLevel::Info, message).for_step(node.id.clone()));
                Ok(json!(message))
            }
            "delay" => {
                let ms = node.params.get("ms").and_then(|m| m.as_u64()).unwrap_or(0);
                tokio::select! {
                    _ = token.cancelled() => Err(ExecutionError::cancelled(format!("cancelled during step '{}'", node.id))),
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({ "slept_ms": ms })),
                }
            }
            "fail" => {
                let code = node
                    .params
                    .get("code")
                    .and_then(|c| serde_json::from_value::<ErrorCode>(c.clone()).ok())
                    .unwrap_or(ErrorCode::WorkflowFailed);
                let message = node
                    .params
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("node failed");
                Err(ExecutionError::new(code, message).with_details(json!({ "step": node.id })))
            }
            other => Err(ExecutionError::new(
                ErrorCode::ValidationFailed,
                format!("unknown node type '{}' in step '{}'", other, node.id),
            )),
        }
    }
}

impl Default for LocalAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineAdapter for LocalAdapter {
    fn engine_type(&self) -> EngineType {
        EngineType::Local
    }

    async fn validate_workflow(&self, workflow: &WorkflowDefinition) -> ValidationResult {
        let mut errors = Vec::new();

        if workflow.engine_type != EngineType::Local {
            errors.push(format!(
                "workflow targets engine '{}', expected 'local'",
                workflow.engine_type
            ));
        }
        if workflow.nodes.is_empty() {
            errors.push("workflow must contain at least one node".to_string());
        }
        for node in &workflow.nodes {
            if !KNOWN_NODE_TYPES.contains(&node.node_type.as_str()) {
                errors.push(format!("unknown node type '{}' in step '{}'", node.node_type, node.id));
            }
        }
        if let Err(graph_errors) = WorkflowGraph::build(workflow) {
            errors.extend(graph_errors);
        }

        if !errors.is_empty() {
            return ValidationResult::invalid(errors);
        }

        let mut result = ValidationResult::valid();
        if workflow.nodes.iter().any(|n| n.node_type == "fail") {
            result = result.with_warning("workflow contains 'fail' nodes and will not complete");
        }
        result
    }

    async fn execute_workflow(
        &self,
        execution_id: &str,
        workflow: &WorkflowDefinition,
        parameters: &Value,
    ) -> Result<ExecutionResult, ExecutionError> {
        let graph = WorkflowGraph::build(workflow)
            .map_err(|errors| ExecutionError::new(ErrorCode::ValidationFailed, errors.join("; ")))?;

        let token = CancellationToken::new();
        let started_at = Utc::now();
        {
            let mut running = lock_running(&self.running);
            if running.len() >= self.max_concurrent_executions {
                return Err(ExecutionError::new(
                    ErrorCode::ServiceUnavailable,
                    "local engine is at capacity",
                ));
            }
            running.insert(
                execution_id.to_string(),
                RunningExecution {
                    token: token.clone(),
                    started_at,
                },
            );
        }
        let guard = RunningGuard {
            running: &self.running,
            execution_id: execution_id.to_string(),
        };

        tracing::debug!("🚀 Local engine running workflow '{}' as {}", workflow.id, execution_id);

        let mut state = match parameters {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("input".to_string(), other.clone());
                map
            }
        };
        let mut logs = Vec::new();
        let mut steps = BTreeMap::new();
        let mut outcome = Ok(());

        for node in graph.execution_order() {
            if token.is_cancelled() {
                outcome = Err(ExecutionError::cancelled("cancelled before step started"));
                break;
            }
            match self.execute_node(node, &mut state, &mut logs, &token).await {
                Ok(output) => {
                    steps.insert(node.id.clone(), output);
                }
                Err(error) => {
                    logs.push(ExecutionLog::new(LogLevel::Error, error.message.clone()).for_step(node.id.clone()));
                    outcome = Err(error);
                    break;
                }
            }
        }

        drop(guard);

        let mut result = match outcome {
            Ok(()) => ExecutionResult::completed(execution_id, Value::Object(state), started_at),
            Err(error) if error.code == ErrorCode::Cancelled => {
                ExecutionResult::cancelled(execution_id, error.message, started_at)
            }
            Err(error) => ExecutionResult::failed(execution_id, error, started_at),
        };
        result.metrics.steps_executed = steps.len();
        result.logs = logs;
        result.steps = steps;

        self.finished.write().await.insert(result.clone());
        Ok(result)
    }

    async fn cancel_execution(&self, execution_id: &str) -> CancellationResult {
        match lock_running(&self.running).get(execution_id) {
            Some(running) => {
                running.token.cancel();
                CancellationResult::cancelled(format!("cancellation requested for {}", execution_id))
            }
            None => CancellationResult::declined(format!("execution {} is not running", execution_id)),
        }
    }

    async fn get_execution_status(&self, execution_id: &str) -> Result<ExecutionResult, ExecutionError> {
        let started_at = lock_running(&self.running).get(execution_id).map(|running| running.started_at);
        if let Some(started_at) = started_at {
            return Ok(ExecutionResult::running(execution_id, started_at));
        }
        self.finished
            .read()
            .await
            .results
            .get(execution_id)
            .cloned()
            .ok_or_else(|| ExecutionError::new(ErrorCode::Internal, format!("execution not found: {}", execution_id)))
    }

    async fn get_execution_logs(&self, execution_id: &str) -> Result<Vec<ExecutionLog>, ExecutionError> {
        if lock_running(&self.running).contains_key(execution_id) {
            return Ok(Vec::new());
        }
        self.finished
            .read()
            .await
            .results
            .get(execution_id)
            .map(|result| result.logs.clone())
            .ok_or_else(|| ExecutionError::new(ErrorCode::Internal, format!("execution not found: {}", execution_id)))
    }

    async fn convert_workflow(
        &self,
        workflow: &WorkflowDefinition,
        from_engine: EngineType,
    ) -> Result<WorkflowDefinition, ExecutionError> {
        if from_engine != workflow.engine_type {
            return Err(ExecutionError::new(
                ErrorCode::ValidationFailed,
                format!(
                    "workflow '{}' is declared for '{}', not '{}'",
                    workflow.id, workflow.engine_type, from_engine
                ),
            ));
        }
        let mut converted = workflow.clone();
        converted.engine_type = EngineType::Local;
        converted
            .metadata
            .insert("converted_from".to_string(), json!(from_engine.as_str()));
        Ok(converted)
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            version: env!("CARGO_PKG_VERSION").to_string(),
            supported_features: KNOWN_NODE_TYPES.iter().map(|t| t.to_string()).collect(),
            max_concurrent_executions: self.max_concurrent_executions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionStatus;
    use std::sync::Arc;

    fn pipeline() -> WorkflowDefinition {
        WorkflowDefinition::new("wf-local", "pipeline", EngineType::Local)
            .with_node("start", "start", json!({}))
            .with_node("enrich", "set", json!({"values": {"region": "eu"}}))
            .with_node("note", "log", json!({"message": "enriched"}))
            .with_edge("start", "enrich")
            .with_edge("enrich", "note")
    }

    #[tokio::test]
    async fn validates_structure_and_node_types() {
        let adapter = LocalAdapter::new();
        assert!(adapter.validate_workflow(&pipeline()).await.is_valid);

        let bad = pipeline().with_node("x", "teleport", json!({}));
        let result = adapter.validate_workflow(&bad).await;
        assert!(!result.is_valid);
        assert!(result.errors[0].contains("teleport"));

        let empty = WorkflowDefinition::new("e", "empty", EngineType::Local);
        assert!(!adapter.validate_workflow(&empty).await.is_valid);

        let foreign = WorkflowDefinition::new("f", "n8n", EngineType::N8n).with_node("s", "start", json!({}));
        assert!(!adapter.validate_workflow(&foreign).await.is_valid);
    }

    #[tokio::test]
    async fn executes_nodes_in_order_and_threads_state() {
        let adapter = LocalAdapter::new();
        let result = adapter
            .execute_workflow("exec-1", &pipeline(), &json!({"user": "ada"}))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.result, Some(json!({"user": "ada", "region": "eu"})));
        assert_eq!(result.steps.len(), 3);
        assert_eq!(result.logs[0].message, "enriched");
        assert_eq!(result.metrics.steps_executed, 3);

        let status = adapter.get_execution_status("exec-1").await.unwrap();
        assert_eq!(status.status, ExecutionStatus::Completed);
        assert_eq!(adapter.get_execution_logs("exec-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fail_node_reports_structured_error() {
        let adapter = LocalAdapter::new();
        let wf = pipeline()
            .with_node("boom", "fail", json!({"code": "NETWORK_ERROR", "message": "dns"}))
            .with_edge("note", "boom");

        let result = adapter.execute_workflow("exec-2", &wf, &json!({})).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        let error = result.error.unwrap();
        assert_eq!(error.code, ErrorCode::NetworkError);
        assert_eq!(error.message, "dns");
    }

    #[tokio::test]
    async fn cancels_running_delay() {
        let adapter = Arc::new(LocalAdapter::new());
        let wf = WorkflowDefinition::new("slow", "slow", EngineType::Local)
            .with_node("wait", "delay", json!({"ms": 10_000}));

        let runner = {
            let adapter = Arc::clone(&adapter);
            tokio::spawn(async move { adapter.execute_workflow("exec-3", &wf, &Value::Null).await })
        };

        // wait for the execution to register
        for _ in 0..50 {
            if adapter.get_execution_status("exec-3").await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(adapter.cancel_execution("exec-3").await.success);
        let result = runner.await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);

        assert!(!adapter.cancel_execution("exec-3").await.success);
        assert!(!adapter.cancel_execution("unknown").await.success);
    }

    #[tokio::test]
    async fn converts_by_retagging() {
        let adapter = LocalAdapter::new();
        let wf = WorkflowDefinition::new("x", "x", EngineType::N8n);
        let converted = adapter.convert_workflow(&wf, EngineType::N8n).await.unwrap();
        assert_eq!(converted.engine_type, EngineType::Local);
        assert!(adapter.convert_workflow(&wf, EngineType::Langflow).await.is_err());
    }
}
