#![allow(dead_code)]

use async_trait::async_trait;
use mechaway_orchestrator::adapter::{CancellationResult, EngineCapabilities, ValidationResult};
use mechaway_orchestrator::execution::ExecutionLog;
use mechaway_orchestrator::{
    Config, EngineAdapter, EngineType, ErrorCode, ExecutionError, ExecutionResult, OrchestrationEngine,
    WorkflowDefinition,
};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Engine adapter that answers from a script of failures, then succeeds
pub struct ScriptedAdapter {
    engine_type: EngineType,
    delay: Duration,
    script: Mutex<VecDeque<ErrorCode>>,
    calls: AtomicUsize,
    calls_by_id: Mutex<HashMap<String, usize>>,
    reject_validation: bool,
}

impl ScriptedAdapter {
    pub fn new(engine_type: EngineType) -> Self {
        Self {
            engine_type,
            delay: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            calls_by_id: Mutex::new(HashMap::new()),
            reject_validation: false,
        }
    }

    pub fn failing_with(self, codes: Vec<ErrorCode>) -> Self {
        *self.script.lock().unwrap() = codes.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn rejecting_workflows(mut self) -> Self {
        self.reject_validation = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, execution_id: &str) -> usize {
        self.calls_by_id.lock().unwrap().get(execution_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl EngineAdapter for ScriptedAdapter {
    fn engine_type(&self) -> EngineType {
        self.engine_type
    }

    async fn validate_workflow(&self, _workflow: &WorkflowDefinition) -> ValidationResult {
        if self.reject_validation {
            ValidationResult::invalid(vec!["rejected by scripted engine".to_string()])
        } else {
            ValidationResult::valid()
        }
    }

    async fn execute_workflow(
        &self,
        execution_id: &str,
        _workflow: &WorkflowDefinition,
        parameters: &Value,
    ) -> Result<ExecutionResult, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .calls_by_id
            .lock()
            .unwrap()
            .entry(execution_id.to_string())
            .or_insert(0) += 1;
        let started_at = chrono::Utc::now();
        tokio::time::sleep(self.delay).await;

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(code) => Err(ExecutionError::new(code, "scripted failure")),
            None => Ok(ExecutionResult::completed(
                execution_id,
                json!({ "echo": parameters }),
                started_at,
            )),
        }
    }

    async fn cancel_execution(&self, execution_id: &str) -> CancellationResult {
        CancellationResult::declined(format!("scripted engine cannot cancel {}", execution_id))
    }

    async fn get_execution_status(&self, execution_id: &str) -> Result<ExecutionResult, ExecutionError> {
        Err(ExecutionError::new(
            ErrorCode::Internal,
            format!("no status kept for {}", execution_id),
        ))
    }

    async fn get_execution_logs(&self, _execution_id: &str) -> Result<Vec<ExecutionLog>, ExecutionError> {
        Ok(Vec::new())
    }

    async fn convert_workflow(
        &self,
        workflow: &WorkflowDefinition,
        _from_engine: EngineType,
    ) -> Result<WorkflowDefinition, ExecutionError> {
        let mut converted = workflow.clone();
        converted.engine_type = self.engine_type;
        Ok(converted)
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            version: "test".to_string(),
            supported_features: Vec::new(),
            max_concurrent_executions: 100,
        }
    }
}

/// Configuration with millisecond ticks and delays
pub fn fast_config() -> Config {
    let mut config = Config::default();
    let orchestration = &mut config.orchestration;
    orchestration.max_concurrent_executions = 4;
    orchestration.default_timeout = Duration::from_secs(5);
    orchestration.retry.max_attempts = 3;
    orchestration.retry.initial_delay = Duration::from_millis(5);
    orchestration.retry.backoff_factor = 2.0;
    orchestration.queue.processing_interval = Duration::from_millis(5);
    orchestration.queue.shutdown_grace_period = Duration::from_millis(300);

    let service = &mut config.execution_service;
    service.scaling.min_workers = 1;
    service.scaling.max_workers = 3;
    service.scaling.worker_startup_time = Duration::ZERO;
    service.scaling.evaluation_interval = Duration::from_secs(3600);
    service.fault_tolerance.retry_delay = Duration::from_millis(5);
    service.metrics.collection_interval = Duration::from_secs(3600);
    service.worker.health_check_interval = Duration::from_secs(3600);
    service.dispatch_interval = Duration::from_millis(5);
    service.shutdown_grace_period = Duration::from_millis(300);
    config
}

/// Engine with a scripted adapter registered for `engine_type`
pub fn engine_with(adapter: Arc<ScriptedAdapter>, engine_type: EngineType) -> OrchestrationEngine {
    let engine = OrchestrationEngine::new(fast_config());
    engine.register_adapter(engine_type, adapter);
    engine
}

pub fn workflow(id: &str, engine_type: EngineType) -> Arc<WorkflowDefinition> {
    Arc::new(WorkflowDefinition::new(id, id, engine_type).with_node("start", "start", json!({})))
}

/// Poll `check` every 5ms until it returns true or `timeout_ms` elapses
pub async fn wait_until<F, Fut>(timeout_ms: u64, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if check().await {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
