/// Orchestration engine façade
///
/// Owns the execution queue, the scheduler, the worker pool, the adapter registry
/// and the table of live execution contexts. Every component reports through one
/// internal event channel; a single event loop folds those events into the
/// context table (create on dispatch start, finalize and evict on a terminal
/// result) and then re-emits them to external subscribers.
///
/// Scheduled requests reach the queue through a bounded channel drained by a
/// forwarder task, so fire cadence never blocks on queue capacity.

use crate::adapter::{AdapterDispatcher, AdapterRegistry, EngineAdapter, ExecutionHandler};
use crate::config::{Config, OrchestrationConfig};
use crate::error::{ErrorCode, OrchestratorError, Result};
use crate::events::{BroadcastSink, ChannelSink, EventSink, OrchestratorEvent, SharedSink};
use crate::execution::{
    ExecutionContext, ExecutionLog, ExecutionRequest, ExecutionResult, ExecutionSnapshot, ExecutionStatus,
    LogLevel, Priority,
};
use crate::runtime::pool::WorkerPool;
use crate::runtime::queue::{ExecutionQueue, QueueStats};
use crate::runtime::scheduler::{
    ExecutionScheduler, ScheduleConfig, ScheduleUpdate, ScheduledWorkflow, SchedulerStats,
};
use crate::workflow::{EngineType, WorkflowDefinition};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};

const EVENT_BUFFER: usize = 1024;
const TIMEOUT_WATCH: &str = "timeout-watch";

/// Outcome of `schedule_workflow`; failures are reported here rather than raised
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_execution: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct HistoryEntry {
    engine_type: Option<EngineType>,
    result: ExecutionResult,
}

/// Terminal results kept queryable after their context leaves the live table
struct ExecutionHistory {
    limit: usize,
    entries: HashMap<String, HistoryEntry>,
    order: VecDeque<String>,
}

impl ExecutionHistory {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn record(&mut self, engine_type: Option<EngineType>, result: ExecutionResult) {
        if self.limit == 0 {
            return;
        }
        if !self.entries.contains_key(&result.id) {
            self.order.push_back(result.id.clone());
        }
        self.entries.insert(result.id.clone(), HistoryEntry { engine_type, result });
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn get(&self, id: &str) -> Option<&HistoryEntry> {
        self.entries.get(id)
    }

    fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }
}

struct EngineInner {
    config: OrchestrationConfig,
    adapters: Arc<AdapterRegistry>,
    queue: Arc<ExecutionQueue>,
    scheduler: ExecutionScheduler,
    pool: WorkerPool,
    contexts: RwLock<HashMap<String, ExecutionContext>>,
    history: Mutex<ExecutionHistory>,
    internal: ChannelSink,
    broadcast: BroadcastSink,
    sinks: ArcSwap<Vec<SharedSink>>,
}

pub struct OrchestrationEngine {
    inner: Arc<EngineInner>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<OrchestratorEvent>>>,
    scheduled_rx: Mutex<Option<mpsc::Receiver<ExecutionRequest>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl OrchestrationEngine {
    pub fn new(config: Config) -> Self {
        let adapters = Arc::new(AdapterRegistry::new());
        let handler: Arc<dyn ExecutionHandler> = Arc::new(AdapterDispatcher::new(Arc::clone(&adapters)));
        let (internal, events_rx) = ChannelSink::channel();
        let component_sink: SharedSink = Arc::new(internal.clone());

        let orchestration = config.orchestration;
        let (scheduled_tx, scheduled_rx) = mpsc::channel(orchestration.queue.max_queue_size.max(1));

        let queue = Arc::new(ExecutionQueue::new(
            &orchestration,
            Arc::clone(&handler),
            Arc::clone(&component_sink),
        ));
        let scheduler = ExecutionScheduler::new(&orchestration, scheduled_tx, Arc::clone(&component_sink));
        let pool = WorkerPool::new(config.execution_service, handler, component_sink);

        let broadcast = BroadcastSink::new(EVENT_BUFFER);
        let sinks: Vec<SharedSink> = vec![Arc::new(broadcast.clone())];

        Self {
            inner: Arc::new(EngineInner {
                history: Mutex::new(ExecutionHistory::new(orchestration.history_limit)),
                config: orchestration,
                adapters,
                queue,
                scheduler,
                pool,
                contexts: RwLock::new(HashMap::new()),
                internal,
                broadcast,
                sinks: ArcSwap::from_pointee(sinks),
            }),
            events_rx: Mutex::new(Some(events_rx)),
            scheduled_rx: Mutex::new(Some(scheduled_rx)),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn register_adapter(&self, engine_type: EngineType, adapter: Arc<dyn EngineAdapter>) {
        self.inner.adapters.register(engine_type, adapter);
    }

    pub fn unregister_adapter(&self, engine_type: EngineType) -> bool {
        self.inner.adapters.unregister(engine_type)
    }

    pub fn adapters(&self) -> Vec<EngineType> {
        self.inner.adapters.engine_types()
    }

    /// Attach another event sink; it receives every event emitted from now on
    pub fn add_event_sink(&self, sink: SharedSink) {
        self.inner.sinks.rcu(|current| {
            let mut next = (**current).clone();
            next.push(Arc::clone(&sink));
            next
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.inner.broadcast.subscribe()
    }

    /// Bring up the event loop, the queue, the scheduler and the worker pool
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("🚀 Starting orchestration engine");

        let mut tasks = self.tasks.lock().await;
        if let Some(rx) = self.events_rx.lock().await.take() {
            tasks.push(tokio::spawn(event_loop(Arc::downgrade(&self.inner), rx)));
        }
        if let Some(rx) = self.scheduled_rx.lock().await.take() {
            let queue = Arc::clone(&self.inner.queue);
            let events: SharedSink = Arc::new(self.inner.internal.clone());
            tasks.push(tokio::spawn(forward_scheduled(queue, rx, events)));
        }
        drop(tasks);

        self.inner.queue.start().await?;
        self.inner.scheduler.start().await?;
        self.inner.pool.start().await?;
        tracing::info!("✅ Orchestration engine started ({} adapters)", self.adapters().len());
        Ok(())
    }

    /// Cancel every live execution (in parallel, best effort), then stop the subsystems
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("⏹️ Stopping orchestration engine");

        let ids: Vec<String> = self.inner.contexts.read().await.keys().cloned().collect();
        let mut cancellations = JoinSet::new();
        for id in ids {
            let inner = Arc::clone(&self.inner);
            cancellations.spawn(async move {
                let outcome = inner.cancel_execution(&id).await;
                (id, outcome)
            });
        }
        while let Some(joined) = cancellations.join_next().await {
            match joined {
                Ok((id, Err(e))) => tracing::warn!("⚠️ Could not cancel {} during shutdown: {}", id, e),
                Ok(_) => {}
                Err(e) => tracing::warn!("⚠️ Cancellation task failed during shutdown: {}", e),
            }
        }

        self.inner.scheduler.stop().await?;
        self.inner.queue.stop().await?;
        self.inner.pool.stop().await?;
        tracing::info!("✅ Orchestration engine stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Validate, admit and wait for the terminal result
    ///
    /// Fails with `Validation` or `AdapterNotFound` before admission and with
    /// `QueueFull` on backpressure. A wait that outlives the request timeout
    /// yields a `Timeout` result; the execution itself is not aborted.
    pub async fn execute_workflow(
        &self,
        workflow: Arc<WorkflowDefinition>,
        parameters: Value,
        priority: Priority,
        submitted_by: &str,
    ) -> Result<ExecutionResult> {
        let request = self.inner.admission_request(workflow, parameters, priority, submitted_by).await?;
        let id = request.id.clone();
        let timeout = request.timeout;
        let created_at = request.created_at;

        match self.inner.queue.enqueue_and_wait(request).await {
            Ok(result) => Ok(normalize(result)),
            Err(OrchestratorError::Timeout { .. }) => {
                if let Some(context) = self.inner.contexts.write().await.get_mut(&id) {
                    context.log(LogLevel::Warn, format!("caller stopped waiting after {:?}", timeout));
                }
                Ok(ExecutionResult::timed_out(id, timeout, created_at))
            }
            Err(e) => Err(e),
        }
    }

    /// Validate and admit without waiting; returns the execution id
    pub async fn submit_workflow(
        &self,
        workflow: Arc<WorkflowDefinition>,
        parameters: Value,
        priority: Priority,
        submitted_by: &str,
    ) -> Result<String> {
        let request = self.inner.admission_request(workflow, parameters, priority, submitted_by).await?;
        self.inner.queue.enqueue(request).await
    }

    /// Validate and hand the request to the auto-scaling worker pool
    pub async fn submit_pooled_workflow(
        &self,
        workflow: Arc<WorkflowDefinition>,
        parameters: Value,
        priority: Priority,
        submitted_by: &str,
    ) -> Result<String> {
        let request = self.inner.admission_request(workflow, parameters, priority, submitted_by).await?;
        self.inner.pool.submit_execution(request).await
    }

    /// Validate and register a recurring schedule
    pub async fn schedule_workflow(
        &self,
        workflow: Arc<WorkflowDefinition>,
        config: ScheduleConfig,
        parameters: Value,
        submitted_by: &str,
    ) -> ScheduleResult {
        if let Err(e) = self.inner.validate(&workflow).await {
            return ScheduleResult::failed(e);
        }
        match self
            .inner
            .scheduler
            .schedule_workflow(workflow, config, parameters, submitted_by)
            .await
        {
            Ok(id) => ScheduleResult {
                success: true,
                next_execution: self.inner.scheduler.get_next_execution_time(&id).await,
                schedule_id: Some(id),
                error: None,
            },
            Err(e) => {
                tracing::warn!("⚠️ Scheduling rejected: {}", e);
                ScheduleResult::failed(e)
            }
        }
    }

    pub async fn unschedule_workflow(&self, schedule_id: &str) -> bool {
        self.inner.scheduler.unschedule_workflow(schedule_id).await
    }

    pub async fn update_schedule(&self, schedule_id: &str, update: ScheduleUpdate) -> Result<bool> {
        self.inner.scheduler.update_schedule(schedule_id, update).await
    }

    pub async fn toggle_schedule(&self, schedule_id: &str, enabled: bool) -> bool {
        self.inner.scheduler.toggle_schedule(schedule_id, enabled).await
    }

    pub async fn trigger_scheduled_workflow(&self, schedule_id: &str) -> Result<String> {
        self.inner.scheduler.trigger_scheduled_workflow(schedule_id).await
    }

    pub async fn get_next_execution_time(&self, schedule_id: &str) -> Option<DateTime<Utc>> {
        self.inner.scheduler.get_next_execution_time(schedule_id).await
    }

    pub async fn list_schedules(&self) -> Vec<ScheduledWorkflow> {
        self.inner.scheduler.list_schedules().await
    }

    /// Cancel pending or running work
    ///
    /// Pending requests (queue or pool) cancel definitively. For a dispatched
    /// execution the engine is asked to stop; local bookkeeping is only cleared
    /// when the engine confirms, otherwise `Cancellation` is returned. Unknown and
    /// finished executions return `Ok(false)`.
    pub async fn cancel_execution(&self, id: &str) -> Result<bool> {
        self.inner.cancel_execution(id).await
    }

    /// Status from the live table, then history, then whatever still holds the request
    pub async fn get_execution_status(&self, id: &str) -> Option<ExecutionStatus> {
        if let Some(context) = self.inner.contexts.read().await.get(id) {
            return Some(context.status());
        }
        if let Some(entry) = self.inner.history.lock().await.get(id) {
            return Some(entry.result.status);
        }
        if self.inner.queue.is_pending(id).await {
            return Some(ExecutionStatus::Queued);
        }
        self.inner.pool.get_execution_status(id).await
    }

    /// Snapshot of a live execution
    pub async fn get_execution(&self, id: &str) -> Option<ExecutionSnapshot> {
        self.inner.contexts.read().await.get(id).map(ExecutionContext::snapshot)
    }

    /// Current result of a live execution, or the recorded terminal result
    pub async fn get_execution_result(&self, id: &str) -> Option<ExecutionResult> {
        if let Some(context) = self.inner.contexts.read().await.get(id) {
            return Some(context.to_result());
        }
        self.inner.history.lock().await.get(id).map(|entry| entry.result.clone())
    }

    /// Logs from the live context, the recorded result, or finally the engine itself
    pub async fn get_execution_logs(&self, id: &str) -> Result<Vec<ExecutionLog>> {
        if let Some(context) = self.inner.contexts.read().await.get(id) {
            return Ok(context.logs());
        }
        let engine_type = {
            let history = self.inner.history.lock().await;
            match history.get(id) {
                Some(entry) if !entry.result.logs.is_empty() => return Ok(entry.result.logs.clone()),
                Some(entry) => entry.engine_type,
                None => None,
            }
        };
        let adapter = engine_type
            .and_then(|engine_type| self.inner.adapters.get(engine_type))
            .ok_or_else(|| OrchestratorError::ExecutionNotFound(id.to_string()))?;
        Ok(adapter.get_execution_logs(id).await?)
    }

    pub async fn get_active_executions(&self) -> Vec<ExecutionSnapshot> {
        let mut active: Vec<ExecutionSnapshot> = self
            .inner
            .contexts
            .read()
            .await
            .values()
            .map(ExecutionContext::snapshot)
            .collect();
        active.sort_by_key(|snapshot| snapshot.start_time);
        active
    }

    /// Live and recorded executions, optionally filtered by status
    pub async fn list_executions(&self, status: Option<ExecutionStatus>) -> Vec<ExecutionResult> {
        let mut results: Vec<ExecutionResult> = self
            .inner
            .contexts
            .read()
            .await
            .values()
            .map(ExecutionContext::to_result)
            .collect();
        {
            let history = self.inner.history.lock().await;
            results.extend(
                history
                    .order
                    .iter()
                    .filter_map(|id| history.get(id))
                    .map(|entry| entry.result.clone()),
            );
        }
        results.retain(|result| status.map_or(true, |wanted| result.status == wanted));
        results.sort_by_key(|result| result.started_at);
        results
    }

    pub async fn get_queue_stats(&self) -> QueueStats {
        self.inner.queue.stats().await
    }

    pub async fn get_scheduler_stats(&self) -> SchedulerStats {
        self.inner.scheduler.stats().await
    }

    /// The auto-scaling worker pool behind `submit_pooled_workflow`
    pub fn worker_pool(&self) -> &WorkerPool {
        &self.inner.pool
    }
}

impl Drop for OrchestrationEngine {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.try_lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl ScheduleResult {
    fn failed(error: OrchestratorError) -> Self {
        Self {
            success: false,
            schedule_id: None,
            next_execution: None,
            error: Some(error.to_string()),
        }
    }
}

impl EngineInner {
    /// Reject workflows the target engine would not accept; invalid workflows are never admitted
    async fn validate(&self, workflow: &WorkflowDefinition) -> Result<()> {
        let adapter = self
            .adapters
            .get(workflow.engine_type)
            .ok_or(OrchestratorError::AdapterNotFound(workflow.engine_type))?;
        let validation = adapter.validate_workflow(workflow).await;
        for warning in &validation.warnings {
            tracing::warn!("⚠️ Workflow '{}': {}", workflow.id, warning);
        }
        if !validation.is_valid {
            tracing::warn!("🚫 Workflow '{}' failed validation: {:?}", workflow.id, validation.errors);
            return Err(OrchestratorError::Validation(validation.errors));
        }
        Ok(())
    }

    async fn admission_request(
        &self,
        workflow: Arc<WorkflowDefinition>,
        parameters: Value,
        priority: Priority,
        submitted_by: &str,
    ) -> Result<ExecutionRequest> {
        self.validate(&workflow).await?;
        Ok(ExecutionRequest::new(workflow, parameters, priority, submitted_by)
            .with_timeout(self.config.default_timeout)
            .with_max_retries(self.config.retry.max_attempts))
    }

    async fn cancel_execution(&self, id: &str) -> Result<bool> {
        if self.queue.cancel(id).await {
            return Ok(true);
        }
        if self.pool.cancel_execution(id).await {
            return Ok(true);
        }

        let engine_type = match self.contexts.read().await.get(id) {
            Some(context) if !context.status().is_terminal() => context.engine_type,
            _ => return Ok(false),
        };
        let adapter = self
            .adapters
            .get(engine_type)
            .ok_or(OrchestratorError::AdapterNotFound(engine_type))?;

        let cancellation = adapter.cancel_execution(id).await;
        if !cancellation.success {
            let reason = cancellation
                .error
                .unwrap_or_else(|| "engine declined cancellation".to_string());
            tracing::warn!("⚠️ Engine declined to cancel {}: {}", id, reason);
            return Err(OrchestratorError::Cancellation {
                id: id.to_string(),
                reason,
            });
        }

        let evicted = self.contexts.write().await.remove(id);
        if let Some(mut context) = evicted {
            let result = ExecutionResult::cancelled(id, "cancelled by request", context.start_time());
            context.finalize(&result);
            self.history.lock().await.record(Some(context.engine_type), context.to_result());
        }
        tracing::info!("🗑️ Execution {} cancelled", id);
        self.internal.emit(OrchestratorEvent::ExecutionCancelled {
            execution_id: id.to_string(),
        });
        Ok(true)
    }

    /// Fold one component event into the context table
    async fn apply(self: &Arc<Self>, event: &OrchestratorEvent) {
        match event {
            OrchestratorEvent::ExecutionStarted {
                execution_id,
                workflow_id,
                engine_type,
                submitted_by,
                parameters,
                attempt,
                timeout_ms,
            } => {
                let timeout = Duration::from_millis(*timeout_ms);
                let watch = tokio::spawn(watch_timeout(Arc::downgrade(self), execution_id.clone(), timeout));
                let mut contexts = self.contexts.write().await;
                let context = contexts.entry(execution_id.clone()).or_insert_with(|| {
                    ExecutionContext::from_parts(
                        execution_id.clone(),
                        workflow_id.clone(),
                        *engine_type,
                        parameters.clone(),
                        submitted_by.clone(),
                    )
                });
                context.set_status(ExecutionStatus::Running);
                context.set_attempt(*attempt);
                context.log(LogLevel::Info, format!("attempt {} started", attempt));
                context.set_timer(TIMEOUT_WATCH, watch);
            }
            OrchestratorEvent::ExecutionRetrying {
                execution_id,
                attempt,
                delay_ms,
                error,
            } => {
                if let Some(context) = self.contexts.write().await.get_mut(execution_id) {
                    context.clear_timer(TIMEOUT_WATCH);
                    context.set_status(ExecutionStatus::Queued);
                    context.set_variable("last_error", Value::String(error.to_string()));
                    context.log(
                        LogLevel::Warn,
                        format!("{}; attempt {} in {}ms", error, attempt, delay_ms),
                    );
                }
            }
            OrchestratorEvent::ExecutionCompleted { execution_id, result, .. }
            | OrchestratorEvent::ExecutionFailed { execution_id, result, .. } => {
                self.finish(execution_id, normalize(result.clone())).await;
            }
            OrchestratorEvent::ExecutionCancelled { execution_id } => {
                let result = ExecutionResult::cancelled(execution_id.clone(), "cancelled", Utc::now());
                self.finish(execution_id, result).await;
            }
            _ => {}
        }
    }

    /// Finalize and evict a live context; results for unknown ids are recorded once
    async fn finish(&self, id: &str, result: ExecutionResult) {
        let evicted = self.contexts.write().await.remove(id);
        let mut history = self.history.lock().await;
        match evicted {
            Some(mut context) => {
                let mut result = result;
                result.started_at = context.start_time();
                context.finalize(&result);
                history.record(Some(context.engine_type), context.to_result());
            }
            None if !history.contains(id) => history.record(None, result),
            None => {}
        }
    }

    fn publish(&self, event: OrchestratorEvent) {
        for sink in self.sinks.load().iter() {
            sink.emit(event.clone());
        }
    }
}

/// An engine-reported cancellation surfaces as a Cancelled result, not a failure
fn normalize(mut result: ExecutionResult) -> ExecutionResult {
    if result.status == ExecutionStatus::Failed
        && result.error.as_ref().is_some_and(|e| e.code == ErrorCode::Cancelled)
    {
        result.status = ExecutionStatus::Cancelled;
    }
    result
}

async fn event_loop(engine: Weak<EngineInner>, mut rx: mpsc::UnboundedReceiver<OrchestratorEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = engine.upgrade() else {
            break;
        };
        inner.apply(&event).await;
        inner.publish(event);
    }
    tracing::debug!("🛑 Orchestration event loop exited");
}

async fn forward_scheduled(
    queue: Arc<ExecutionQueue>,
    mut rx: mpsc::Receiver<ExecutionRequest>,
    events: SharedSink,
) {
    while let Some(request) = rx.recv().await {
        let schedule_id = request.schedule_id.clone().unwrap_or_default();
        let id = request.id.clone();
        if let Err(e) = queue.enqueue(request).await {
            tracing::warn!("⚠️ Scheduled execution {} from {} not admitted: {}", id, schedule_id, e);
            events.emit(OrchestratorEvent::ScheduleError {
                schedule_id,
                error: e.to_string(),
            });
        }
    }
}

async fn watch_timeout(engine: Weak<EngineInner>, execution_id: String, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let Some(inner) = engine.upgrade() else {
        return;
    };
    let mut contexts = inner.contexts.write().await;
    if let Some(context) = contexts.get_mut(&execution_id) {
        tracing::warn!("⏰ Execution {} still running after its {:?} timeout", execution_id, timeout);
        context.log(LogLevel::Warn, format!("timeout of {:?} elapsed", timeout));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::LocalAdapter;
    use serde_json::json;

    fn engine() -> OrchestrationEngine {
        let mut config = Config::default();
        config.orchestration.queue.processing_interval = Duration::from_millis(5);
        config.orchestration.queue.shutdown_grace_period = Duration::from_millis(200);
        config.orchestration.retry.initial_delay = Duration::from_millis(5);
        config.orchestration.default_timeout = Duration::from_secs(5);
        config.execution_service.scaling.min_workers = 1;
        config.execution_service.dispatch_interval = Duration::from_millis(5);
        config.execution_service.shutdown_grace_period = Duration::from_millis(200);
        let engine = OrchestrationEngine::new(config);
        engine.register_adapter(EngineType::Local, Arc::new(LocalAdapter::new()));
        engine
    }

    fn workflow() -> Arc<WorkflowDefinition> {
        Arc::new(
            WorkflowDefinition::new("greet", "greet", EngineType::Local)
                .with_node("start", "start", json!({}))
                .with_node("set", "set", json!({"values": {"greeting": "hi"}}))
                .with_edge("start", "set"),
        )
    }

    #[tokio::test]
    async fn executes_through_the_queue_and_records_history() {
        let engine = engine();
        engine.start().await.unwrap();

        let result = engine
            .execute_workflow(workflow(), json!({"name": "ada"}), Priority::Normal, "tester")
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.result.as_ref().unwrap()["greeting"], "hi");

        // the event loop finalizes asynchronously
        for _ in 0..50 {
            if engine.get_execution_status(&result.id).await == Some(ExecutionStatus::Completed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(engine.get_execution_status(&result.id).await, Some(ExecutionStatus::Completed));
        assert!(engine.get_active_executions().await.is_empty());
        assert_eq!(engine.list_executions(Some(ExecutionStatus::Completed)).await.len(), 1);
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_workflow_is_never_admitted() {
        let engine = engine();
        engine.start().await.unwrap();

        let cyclic = Arc::new(
            WorkflowDefinition::new("loop", "loop", EngineType::Local)
                .with_node("a", "noop", json!({}))
                .with_node("b", "noop", json!({}))
                .with_edge("a", "b")
                .with_edge("b", "a"),
        );
        let err = engine
            .execute_workflow(cyclic, json!({}), Priority::Normal, "tester")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert_eq!(engine.get_queue_stats().await.total_enqueued, 0);

        let foreign = Arc::new(WorkflowDefinition::new("n8n", "n8n", EngineType::N8n));
        let err = engine
            .submit_workflow(foreign, json!({}), Priority::Normal, "tester")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::AdapterNotFound(EngineType::N8n)));
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn scheduling_failures_are_reported_not_raised() {
        let engine = engine();
        let bad = engine
            .schedule_workflow(workflow(), ScheduleConfig::new("not a cron"), json!({}), "tester")
            .await;
        assert!(!bad.success);
        assert!(bad.error.unwrap().contains("invalid cron expression"));

        let good = engine
            .schedule_workflow(workflow(), ScheduleConfig::new("0 0 * * *"), json!({}), "tester")
            .await;
        assert!(good.success);
        assert!(good.next_execution.is_some());
        assert_eq!(engine.get_scheduler_stats().await.total_schedules, 1);
    }

    #[tokio::test]
    async fn cancel_of_unknown_execution_is_false() {
        let engine = engine();
        engine.start().await.unwrap();
        assert!(!engine.cancel_execution("nope").await.unwrap());
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_running_execution_through_adapter() {
        let engine = engine();
        let mut events = engine.subscribe();
        engine.start().await.unwrap();

        let slow = Arc::new(
            WorkflowDefinition::new("slow", "slow", EngineType::Local)
                .with_node("wait", "delay", json!({"ms": 10_000})),
        );
        let id = engine
            .submit_workflow(slow, json!({}), Priority::High, "tester")
            .await
            .unwrap();

        for _ in 0..100 {
            if engine.get_execution(&id).await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let snapshot = engine.get_execution(&id).await.unwrap();
        assert_eq!(snapshot.status, ExecutionStatus::Running);

        assert!(engine.cancel_execution(&id).await.unwrap());
        assert!(engine.get_execution(&id).await.is_none());
        assert_eq!(engine.get_execution_status(&id).await, Some(ExecutionStatus::Cancelled));

        let mut saw_cancel = false;
        for _ in 0..20 {
            match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
                Ok(Ok(OrchestratorEvent::ExecutionCancelled { execution_id })) if execution_id == id => {
                    saw_cancel = true;
                    break;
                }
                Ok(Ok(_)) => {}
                _ => break,
            }
        }
        assert!(saw_cancel);
        engine.stop().await.unwrap();
    }
}
