/// Auto-scaling worker pool
///
/// Requests wait in a priority buffer until a worker can take them: the worker
/// must be `Idle`, support the request's engine type and have spare capacity;
/// among those the least loaded wins. Each assignment runs on its own task
/// through the shared `ExecutionHandler`, retrying infrastructure failures with
/// backoff behind a per-engine circuit breaker.
///
/// Four independent loops keep the pool healthy:
/// - dispatch: assigns pending requests to workers
/// - health: marks workers with stale heartbeats unhealthy, reschedules their work
///   and replaces them while the pool is below its minimum
/// - autoscaling: evaluates utilization and grows or drains the pool
/// - metrics: snapshots the pool and prunes finished executions
///
/// Lock order is workers → pending → executions; the autoscaler lock is only ever
/// taken before the workers lock, and breaker and metrics locks are leaf locks.

use crate::adapter::ExecutionHandler;
use crate::config::ExecutionServiceConfig;
use crate::error::{ErrorCode, ExecutionError, OrchestratorError, Result};
use crate::events::{OrchestratorEvent, SharedSink};
use crate::execution::{ExecutionRequest, ExecutionResult, ExecutionStatus};
use crate::runtime::autoscaler::{utilization, Autoscaler, ScalingAction, ScalingDecision};
use crate::runtime::buffer::PriorityBuffer;
use crate::runtime::metrics::{MetricsCollector, PoolMetrics};
use crate::runtime::retry::{backoff_delay, Admission, CircuitBreaker, CircuitState};
use crate::runtime::worker::{ExecutionWorker, WorkerInfo, WorkerStatus};
use crate::workflow::EngineType;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(25);
const MIN_TICK: Duration = Duration::from_millis(1);

/// Bookkeeping for one submitted execution
struct PoolExecution {
    request: ExecutionRequest,
    status: ExecutionStatus,
    worker_id: Option<String>,
    result: Option<ExecutionResult>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<Instant>,
    task: Option<JoinHandle<()>>,
    /// Bumped on every (re)assignment so superseded tasks can't report
    generation: u64,
}

impl PoolExecution {
    fn current_result(&self) -> ExecutionResult {
        if let Some(result) = &self.result {
            return result.clone();
        }
        let mut result = ExecutionResult::running(
            self.request.id.clone(),
            self.started_at.unwrap_or(self.request.created_at),
        );
        result.status = self.status;
        result
    }

    fn terminate(&mut self, result: ExecutionResult) {
        self.status = result.status;
        self.result = Some(result);
        self.finished_at = Some(Instant::now());
        self.worker_id = None;
        self.generation += 1;
    }
}

struct PoolInner {
    config: ExecutionServiceConfig,
    handler: Arc<dyn ExecutionHandler>,
    events: SharedSink,
    workers: RwLock<HashMap<String, ExecutionWorker>>,
    pending: Mutex<PriorityBuffer>,
    executions: RwLock<HashMap<String, PoolExecution>>,
    breakers: StdMutex<HashMap<EngineType, CircuitBreaker>>,
    autoscaler: Mutex<Autoscaler>,
    metrics: Mutex<MetricsCollector>,
    finished: Notify,
    running: AtomicBool,
}

pub struct WorkerPool {
    inner: Arc<PoolInner>,
    shutdown: Mutex<Option<CancellationToken>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(config: ExecutionServiceConfig, handler: Arc<dyn ExecutionHandler>, events: SharedSink) -> Self {
        let pending = PriorityBuffer::new(config.max_pending);
        let autoscaler = Autoscaler::new(config.scaling.clone());
        let metrics = MetricsCollector::new(config.metrics.clone());
        Self {
            inner: Arc::new(PoolInner {
                config,
                handler,
                events,
                workers: RwLock::new(HashMap::new()),
                pending: Mutex::new(pending),
                executions: RwLock::new(HashMap::new()),
                breakers: StdMutex::new(HashMap::new()),
                autoscaler: Mutex::new(autoscaler),
                metrics: Mutex::new(metrics),
                finished: Notify::new(),
                running: AtomicBool::new(false),
            }),
            shutdown: Mutex::new(None),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Start the minimum number of workers and the control loops (idempotent)
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let cfg = &self.inner.config;
        tracing::info!(
            "🏭 Starting worker pool ({}-{} workers, capacity {} each)",
            cfg.scaling.min_workers,
            cfg.scaling.max_workers,
            cfg.worker.capacity
        );

        {
            let mut workers = self.inner.workers.write().await;
            let missing = cfg.scaling.min_workers.saturating_sub(workers.len());
            self.inner.spawn_workers(&mut workers, missing);
        }

        let token = CancellationToken::new();
        let mut loops = self.loops.lock().await;

        let inner = Arc::clone(&self.inner);
        loops.push(spawn_loop(token.clone(), cfg.dispatch_interval, move || {
            let inner = Arc::clone(&inner);
            async move {
                inner.assign_pending().await;
            }
        }));

        let inner = Arc::clone(&self.inner);
        loops.push(spawn_loop(token.clone(), cfg.worker.health_check_interval, move || {
            let inner = Arc::clone(&inner);
            async move {
                inner.check_health_at(Instant::now()).await;
            }
        }));

        let inner = Arc::clone(&self.inner);
        loops.push(spawn_loop(token.clone(), cfg.scaling.evaluation_interval, move || {
            let inner = Arc::clone(&inner);
            async move {
                let demand = inner.pending.lock().await.len();
                inner.scale_executors(demand).await;
            }
        }));

        let inner = Arc::clone(&self.inner);
        loops.push(spawn_loop(token.clone(), cfg.metrics.collection_interval, move || {
            let inner = Arc::clone(&inner);
            async move {
                inner.collect_metrics().await;
            }
        }));

        *self.shutdown.lock().await = Some(token);
        tracing::info!("✅ Worker pool started");
        Ok(())
    }

    /// Stop the loops, wait for in-flight work up to the grace period, then
    /// force-cancel stragglers and stop every worker
    ///
    /// Pending requests stay buffered for a later `start()`.
    pub async fn stop(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("⏹️ Stopping worker pool");

        if let Some(token) = self.shutdown.lock().await.take() {
            token.cancel();
        }
        let loops: Vec<JoinHandle<()>> = self.loops.lock().await.drain(..).collect();
        for handle in loops {
            if let Err(e) = handle.await {
                tracing::warn!("⚠️ Pool loop ended abnormally: {}", e);
            }
        }

        let deadline = Instant::now() + self.inner.config.shutdown_grace_period;
        while self.inner.running_count().await > 0 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let stragglers: Vec<ExecutionRequest> = self
            .inner
            .executions
            .read()
            .await
            .values()
            .filter(|e| e.status == ExecutionStatus::Running)
            .map(|e| e.request.clone())
            .collect();
        if !stragglers.is_empty() {
            tracing::warn!("⚠️ Force-cancelling {} executions still running", stragglers.len());
        }
        for request in stragglers {
            self.inner.cancel_running(&request, "worker pool stopped").await;
        }

        let stopped: Vec<ExecutionWorker> = self.inner.workers.write().await.drain().map(|(_, w)| w).collect();
        for mut worker in stopped {
            worker.set_status(WorkerStatus::Stopped);
            self.inner.events.emit(OrchestratorEvent::WorkerStopped {
                worker_id: worker.id().to_string(),
            });
        }
        tracing::info!("✅ Worker pool stopped");
        Ok(())
    }

    /// Admit a request for pooled execution; assignment happens right away when a worker is free
    pub async fn submit_execution(&self, request: ExecutionRequest) -> Result<String> {
        if !self.is_running() {
            return Err(OrchestratorError::NotRunning("worker pool"));
        }
        let id = request.id.clone();
        {
            let mut pending = self.inner.pending.lock().await;
            let record = PoolExecution {
                request: request.clone(),
                status: ExecutionStatus::Queued,
                worker_id: None,
                result: None,
                started_at: None,
                finished_at: None,
                task: None,
                generation: 0,
            };
            if pending.push(request).is_err() {
                tracing::warn!("🚫 Worker pool backlog full, rejecting {}", id);
                return Err(OrchestratorError::QueueFull {
                    max_size: pending.max_size(),
                });
            }
            self.inner.executions.write().await.insert(id.clone(), record);
        }
        tracing::debug!("📥 Pool accepted execution {}", id);
        self.inner.assign_pending().await;
        Ok(id)
    }

    pub async fn get_execution_status(&self, id: &str) -> Option<ExecutionStatus> {
        self.inner.executions.read().await.get(id).map(|e| e.status)
    }

    pub async fn get_execution_result(&self, id: &str) -> Option<ExecutionResult> {
        self.inner.executions.read().await.get(id).map(PoolExecution::current_result)
    }

    /// Wait until an execution reaches a terminal status
    pub async fn wait_for_result(&self, id: &str, timeout: Duration) -> Result<ExecutionResult> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.finished.notified();
            match self.inner.executions.read().await.get(id) {
                Some(execution) if execution.status.is_terminal() => return Ok(execution.current_result()),
                Some(_) => {}
                None => return Err(OrchestratorError::ExecutionNotFound(id.to_string())),
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(OrchestratorError::Timeout {
                    id: id.to_string(),
                    timeout,
                });
            }
            // elapsed deadline is re-checked at the top of the loop
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    /// Cancel a pending request, or forward cancellation to the worker running it
    ///
    /// Returns false for unknown or already finished executions.
    pub async fn cancel_execution(&self, id: &str) -> bool {
        let removed = self.inner.pending.lock().await.remove(id);
        if let Some(request) = removed {
            let result = ExecutionResult::cancelled(id, "cancelled while pending", request.created_at);
            if let Some(execution) = self.inner.executions.write().await.get_mut(id) {
                execution.terminate(result.clone());
            }
            self.inner.report_cancelled(id);
            return true;
        }

        let running = self
            .inner
            .executions
            .read()
            .await
            .get(id)
            .filter(|e| e.status == ExecutionStatus::Running)
            .map(|e| e.request.clone());
        match running {
            Some(request) => self.inner.cancel_running(&request, "cancelled by request").await,
            None => false,
        }
    }

    /// Run one autoscaling evaluation for `demand` queued requests and carry it out
    pub async fn scale_executors(&self, demand: usize) -> ScalingDecision {
        self.inner.scale_executors(demand).await
    }

    /// Reschedule a failed worker's executions, remove it and restore the minimum pool size
    ///
    /// Returns the number of executions put back in the backlog.
    pub async fn handle_executor_failure(&self, worker_id: &str) -> usize {
        self.inner.handle_executor_failure(worker_id).await
    }

    /// Run a health check now; returns the workers found unhealthy
    pub async fn check_worker_health(&self) -> Vec<String> {
        self.inner.check_health_at(Instant::now()).await
    }

    /// Liveness report for a worker; false when the worker is unknown
    pub async fn record_heartbeat(&self, worker_id: &str) -> bool {
        self.inner.record_heartbeat(worker_id).await
    }

    /// Single attempt chain for a request: breaker check, dispatch, retry with backoff
    pub async fn execute_with_retry(&self, request: &ExecutionRequest) -> std::result::Result<ExecutionResult, ExecutionError> {
        self.inner.execute_with_retry(request).await
    }

    /// Run one assignment pass; returns the number of executions started
    pub async fn assign_pending(&self) -> usize {
        self.inner.assign_pending().await
    }

    /// Every worker, oldest first
    pub async fn list_workers(&self) -> Vec<WorkerInfo> {
        self.inner.worker_infos().await
    }

    /// Workers in any status, draining and starting ones included
    pub async fn worker_count(&self) -> usize {
        self.inner.workers.read().await.len()
    }

    /// Requests waiting for a worker
    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Executions currently running on a worker
    pub async fn active_count(&self) -> usize {
        self.inner.running_count().await
    }

    /// Fresh metrics snapshot (not added to history)
    pub async fn metrics(&self) -> PoolMetrics {
        let infos = self.inner.worker_infos().await;
        let pending = self.inner.pending.lock().await.len();
        self.inner
            .metrics
            .lock()
            .await
            .snapshot(Instant::now(), &infos, pending, self.inner.config.scaling.min_workers)
    }

    /// Samples taken by the metrics loop within the retention period
    pub async fn metrics_history(&self) -> Vec<PoolMetrics> {
        self.inner.metrics.lock().await.history()
    }

    /// Breaker state for an engine; `Closed` until the engine has been called
    pub async fn circuit_state(&self, engine_type: EngineType) -> CircuitState {
        let breakers = self.inner.lock_breakers();
        breakers
            .get(&engine_type)
            .map(CircuitBreaker::state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Ok(mut shutdown) = self.shutdown.try_lock() {
            if let Some(token) = shutdown.take() {
                token.cancel();
            }
        }
    }
}

/// Holds a half-open trial slot for the duration of one adapter call
struct TrialGuard<'a> {
    breakers: &'a StdMutex<HashMap<EngineType, CircuitBreaker>>,
    engine_type: EngineType,
}

impl TrialGuard<'_> {
    /// The call finished; its outcome is recorded instead
    fn settle(self) {
        std::mem::forget(self);
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        let mut breakers = self.breakers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(breaker) = breakers.get_mut(&self.engine_type) {
            tracing::debug!("Trial call for engine '{}' abandoned", self.engine_type);
            breaker.abandon_trial();
        }
    }
}

impl PoolInner {
    /// Add `count` workers; they become `Idle` after the configured startup time
    fn spawn_workers(self: &Arc<Self>, workers: &mut HashMap<String, ExecutionWorker>, count: usize) -> Vec<String> {
        let startup = self.config.scaling.worker_startup_time;
        let mut started = Vec::with_capacity(count);
        for _ in 0..count {
            let mut worker = ExecutionWorker::new(self.config.worker.clone());
            let id = worker.id().to_string();
            worker.set_heartbeat_task(tokio::spawn(heartbeat_loop(
                Arc::downgrade(self),
                id.clone(),
                self.config.worker.health_check_interval.max(MIN_TICK),
            )));

            if startup.is_zero() {
                worker.mark_ready();
                tracing::info!("👷 Worker {} started", id);
                self.events.emit(OrchestratorEvent::WorkerStarted { worker_id: id.clone() });
            } else {
                tokio::spawn(finish_startup(Arc::downgrade(self), id.clone(), startup));
            }
            workers.insert(id.clone(), worker);
            started.push(id);
        }
        started
    }

    async fn assign_pending(self: &Arc<Self>) -> usize {
        if !self.running.load(Ordering::SeqCst) {
            return 0;
        }
        let mut workers = self.workers.write().await;
        let mut pending = self.pending.lock().await;
        let mut executions = self.executions.write().await;

        let mut assigned = 0;
        loop {
            let Some(request) = pending.take_first(|request| pick_worker(&workers, request.engine_type).is_some())
            else {
                break;
            };
            let Some(worker_id) = pick_worker(&workers, request.engine_type) else {
                break;
            };
            let Some(execution) = executions.get_mut(&request.id) else {
                continue;
            };
            if let Some(worker) = workers.get_mut(&worker_id) {
                worker.assign(request.id.clone());
            }

            execution.generation += 1;
            execution.status = ExecutionStatus::Running;
            execution.worker_id = Some(worker_id.clone());
            execution.started_at = Some(Utc::now());

            let generation = execution.generation;
            let inner = Arc::clone(self);
            tracing::debug!("🧭 Assigned execution {} to {}", request.id, worker_id);
            execution.task = Some(tokio::spawn(async move {
                inner.run_execution(request, worker_id, generation).await;
            }));
            assigned += 1;
        }
        assigned
    }

    async fn run_execution(self: Arc<Self>, request: ExecutionRequest, worker_id: String, generation: u64) {
        self.events.emit(OrchestratorEvent::ExecutionStarted {
            execution_id: request.id.clone(),
            workflow_id: request.workflow_id().to_string(),
            engine_type: request.engine_type,
            submitted_by: request.submitted_by.clone(),
            parameters: request.parameters.clone(),
            attempt: request.attempt(),
            timeout_ms: request.timeout.as_millis() as u64,
        });

        let started_at = Utc::now();
        let clock = Instant::now();
        let outcome = self.execute_with_retry(&request).await;
        let duration = clock.elapsed();

        let result = match outcome {
            Ok(mut result) => {
                if !result.status.is_terminal() {
                    result.status = ExecutionStatus::Completed;
                }
                result
            }
            Err(error) => ExecutionResult::failed(request.id.clone(), error, started_at),
        };
        let success = result.status == ExecutionStatus::Completed;

        {
            let mut workers = self.workers.write().await;
            let mut executions = self.executions.write().await;
            let Some(execution) = executions.get_mut(&request.id) else {
                return;
            };
            if execution.generation != generation || execution.status != ExecutionStatus::Running {
                // rescheduled or cancelled meanwhile
                return;
            }
            if let Some(worker) = workers.get_mut(&worker_id) {
                worker.complete(&request.id, duration, success);
            }
            execution.task = None;
            execution.terminate(result.clone());
            self.metrics
                .lock()
                .await
                .record_completion(Instant::now(), duration, success);
        }

        if success {
            tracing::info!("✅ Pooled execution {} completed on {} in {:?}", request.id, worker_id, duration);
            self.events.emit(OrchestratorEvent::ExecutionCompleted {
                execution_id: request.id.clone(),
                workflow_id: request.workflow_id().to_string(),
                result,
            });
        } else {
            tracing::error!("❌ Pooled execution {} failed on {}", request.id, worker_id);
            self.events.emit(OrchestratorEvent::ExecutionFailed {
                execution_id: request.id.clone(),
                workflow_id: request.workflow_id().to_string(),
                result,
            });
        }
        self.finished.notify_waiters();
    }

    async fn execute_with_retry(&self, request: &ExecutionRequest) -> std::result::Result<ExecutionResult, ExecutionError> {
        let policy = &self.config.fault_tolerance;
        let mut attempt_request = request.clone();
        let mut retries = 0u32;

        loop {
            let admission = self.breaker_allows(request.engine_type);
            if !admission.is_allowed() {
                return Err(ExecutionError::new(
                    ErrorCode::CircuitOpen,
                    format!("circuit open for engine '{}'", request.engine_type),
                ));
            }
            // returns the trial slot if this future is dropped mid-call
            let trial = (admission == Admission::Trial).then(|| TrialGuard {
                breakers: &self.breakers,
                engine_type: request.engine_type,
            });

            let outcome = self.handler.execute(&attempt_request).await;
            if let Some(trial) = trial {
                trial.settle();
            }
            let error = match outcome {
                Ok(result) => {
                    self.record_breaker(request.engine_type, true);
                    return Ok(result);
                }
                Err(error) => error,
            };
            // only infrastructure failures count against the engine
            self.record_breaker(request.engine_type, !error.is_retryable());

            if !error.is_retryable() || retries >= policy.max_retries {
                return Err(error);
            }

            let delay = backoff_delay(policy.retry_delay, policy.backoff_factor, retries);
            retries += 1;
            attempt_request = attempt_request.next_attempt();
            tracing::warn!(
                "🔁 Pooled execution {} failed with {:?}, retry {}/{} in {:?}",
                request.id,
                error.code,
                retries,
                policy.max_retries,
                delay
            );
            self.events.emit(OrchestratorEvent::ExecutionRetrying {
                execution_id: request.id.clone(),
                attempt: attempt_request.attempt(),
                delay_ms: delay.as_millis() as u64,
                error,
            });
            tokio::time::sleep(delay).await;
        }
    }

    fn lock_breakers(&self) -> std::sync::MutexGuard<'_, HashMap<EngineType, CircuitBreaker>> {
        self.breakers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn breaker_allows(&self, engine_type: EngineType) -> Admission {
        let mut breakers = self.lock_breakers();
        breakers
            .entry(engine_type)
            .or_insert_with(|| CircuitBreaker::new(self.config.fault_tolerance.circuit_breaker.clone()))
            .allow(Instant::now())
    }

    fn record_breaker(&self, engine_type: EngineType, healthy: bool) {
        let mut breakers = self.lock_breakers();
        let breaker = breakers
            .entry(engine_type)
            .or_insert_with(|| CircuitBreaker::new(self.config.fault_tolerance.circuit_breaker.clone()));
        if healthy {
            breaker.record_success();
        } else {
            breaker.record_failure(Instant::now());
        }
    }

    /// Best-effort cancellation of a running execution; bookkeeping is released either way
    async fn cancel_running(&self, request: &ExecutionRequest, reason: &str) -> bool {
        let cancellation = self.handler.cancel(request).await;
        if !cancellation.success {
            tracing::debug!(
                "Engine did not confirm cancellation of {}: {:?}",
                request.id,
                cancellation.error
            );
        }

        {
            let mut workers = self.workers.write().await;
            let mut executions = self.executions.write().await;
            let Some(execution) = executions.get_mut(&request.id) else {
                return false;
            };
            if execution.status != ExecutionStatus::Running {
                return false;
            }
            if let Some(task) = execution.task.take() {
                task.abort();
            }
            if let Some(worker) = execution.worker_id.as_ref().and_then(|id| workers.get_mut(id)) {
                worker.release(&request.id);
            }
            let started_at = execution.started_at.unwrap_or(request.created_at);
            execution.terminate(ExecutionResult::cancelled(request.id.clone(), reason, started_at));
        }

        self.report_cancelled(&request.id);
        true
    }

    fn report_cancelled(&self, id: &str) {
        tracing::info!("🗑️ Pooled execution {} cancelled", id);
        self.events.emit(OrchestratorEvent::ExecutionCancelled {
            execution_id: id.to_string(),
        });
        self.finished.notify_waiters();
    }

    async fn record_heartbeat(&self, worker_id: &str) -> bool {
        match self.workers.write().await.get_mut(worker_id) {
            Some(worker) => {
                worker.record_heartbeat(Instant::now());
                true
            }
            None => false,
        }
    }

    async fn check_health_at(self: &Arc<Self>, now: Instant) -> Vec<String> {
        let unhealthy: Vec<String> = {
            let mut workers = self.workers.write().await;
            workers
                .values_mut()
                .filter(|w| !matches!(w.status(), WorkerStatus::Unhealthy | WorkerStatus::Stopped))
                .filter(|w| w.is_stale(now))
                .map(|w| {
                    tracing::warn!(
                        "💔 Worker {} missed heartbeats for {:?}, marking unhealthy",
                        w.id(),
                        w.heartbeat_age(now)
                    );
                    w.set_status(WorkerStatus::Unhealthy);
                    w.id().to_string()
                })
                .collect()
        };

        for worker_id in &unhealthy {
            self.handle_executor_failure(worker_id).await;
        }
        self.retire_idle_workers(now).await;
        unhealthy
    }

    /// Stop empty workers idle past their `max_idle_time`, longest-idle first, down to `min_workers`
    async fn retire_idle_workers(&self, now: Instant) -> Vec<String> {
        let mut workers = self.workers.write().await;
        let serving = workers.values().filter(|w| w.is_serving()).count();
        let mut idle: Vec<(String, Duration)> = workers
            .values()
            .filter(|w| w.status() == WorkerStatus::Idle && w.current_load() == 0)
            .filter(|w| w.idle_for(now) > w.config().max_idle_time)
            .map(|w| (w.id().to_string(), w.idle_for(now)))
            .collect();
        idle.sort_by(|a, b| b.1.cmp(&a.1));
        idle.truncate(serving.saturating_sub(self.config.scaling.min_workers));

        let mut retired = Vec::with_capacity(idle.len());
        for (id, idle_for) in idle {
            if let Some(mut worker) = workers.remove(&id) {
                worker.set_status(WorkerStatus::Stopped);
            }
            tracing::info!("💤 Worker {} idle for {:?}, retiring", id, idle_for);
            self.events.emit(OrchestratorEvent::WorkerStopped { worker_id: id.clone() });
            retired.push(id);
        }
        retired
    }

    async fn handle_executor_failure(self: &Arc<Self>, worker_id: &str) -> usize {
        let (rescheduled, lost) = {
            let mut workers = self.workers.write().await;
            let Some(worker) = workers.remove(worker_id) else {
                tracing::debug!("Worker {} already removed", worker_id);
                return 0;
            };
            let active = worker.active_executions();
            drop(worker);

            let mut pending = self.pending.lock().await;
            let mut executions = self.executions.write().await;
            let mut rescheduled = 0;
            let mut lost = Vec::new();
            for id in active {
                let Some(execution) = executions.get_mut(&id) else {
                    continue;
                };
                if execution.status != ExecutionStatus::Running {
                    continue;
                }
                if let Some(task) = execution.task.take() {
                    task.abort();
                }
                execution.generation += 1;
                execution.worker_id = None;

                match pending.push(execution.request.clone()) {
                    Ok(()) => {
                        execution.status = ExecutionStatus::Queued;
                        execution.started_at = None;
                        rescheduled += 1;
                    }
                    Err(request) => {
                        let error = ExecutionError::new(
                            ErrorCode::WorkerLost,
                            format!("worker {} was lost and the backlog is full", worker_id),
                        );
                        let started_at = execution.started_at.unwrap_or(request.created_at);
                        let result = ExecutionResult::failed(request.id.clone(), error, started_at);
                        execution.terminate(result.clone());
                        lost.push((request, result));
                    }
                }
            }
            (rescheduled, lost)
        };

        tracing::warn!(
            "🚑 Removed failed worker {}, rescheduled {} executions",
            worker_id,
            rescheduled
        );
        self.events.emit(OrchestratorEvent::WorkerFailed {
            worker_id: worker_id.to_string(),
            rescheduled,
        });
        for (request, result) in lost {
            self.events.emit(OrchestratorEvent::ExecutionFailed {
                execution_id: request.id.clone(),
                workflow_id: request.workflow_id().to_string(),
                result,
            });
        }
        self.finished.notify_waiters();

        if self.running.load(Ordering::SeqCst) {
            let min_workers = self.config.scaling.min_workers;
            let worker_count = {
                let mut workers = self.workers.write().await;
                let serving = workers.values().filter(|w| w.is_serving()).count();
                let replacements = self.spawn_workers(&mut workers, min_workers.saturating_sub(serving));
                if !replacements.is_empty() {
                    tracing::info!("🔄 Started {} replacement workers", replacements.len());
                }
                workers.values().filter(|w| w.is_serving()).count()
            };
            if worker_count < min_workers {
                tracing::warn!("⚠️ Capacity shortage: {} of {} minimum workers", worker_count, min_workers);
                self.events.emit(OrchestratorEvent::CapacityShortage {
                    worker_count,
                    min_workers,
                });
            }
            self.assign_pending().await;
        }
        rescheduled
    }

    async fn scale_executors(self: &Arc<Self>, demand: usize) -> ScalingDecision {
        let now = Instant::now();
        let mut autoscaler = self.autoscaler.lock().await;

        let (current, capacity, active) = {
            let workers = self.workers.read().await;
            let scaling: Vec<&ExecutionWorker> = workers
                .values()
                .filter(|w| w.is_serving() && w.status() != WorkerStatus::Draining)
                .collect();
            (
                scaling.len(),
                scaling.iter().map(|w| w.capacity()).sum::<usize>(),
                workers.values().map(|w| w.current_load()).sum::<usize>(),
            )
        };

        let decision = autoscaler.evaluate(current, utilization(demand, active, capacity), now);
        let delta = decision.delta();
        match decision.action {
            ScalingAction::NoAction => {
                tracing::debug!("📏 No scaling: {}", decision.reason);
                return decision;
            }
            ScalingAction::ScaleUp => {
                let mut workers = self.workers.write().await;
                let added = self.spawn_workers(&mut workers, delta.max(0) as usize);
                tracing::info!("📈 Scaling up by {} workers: {}", added.len(), decision.reason);
            }
            ScalingAction::ScaleDown => {
                let removed = self.drain_workers(delta.min(0).unsigned_abs() as usize).await;
                tracing::info!("📉 Scaling down {} workers: {}", removed, decision.reason);
            }
        }
        autoscaler.record(&decision, now);

        let worker_count = self.workers.read().await.len();
        self.events.emit(OrchestratorEvent::ScalingCompleted {
            decision: decision.clone(),
            worker_count,
        });
        decision
    }

    /// Retire up to `count` accepting workers, emptiest and longest-idle first
    ///
    /// Empty workers stop immediately; loaded ones stop taking work and are
    /// removed once drained, or go back to `Idle` if the grace period runs out.
    async fn drain_workers(self: &Arc<Self>, count: usize) -> usize {
        let now = Instant::now();
        let mut workers = self.workers.write().await;
        let mut candidates: Vec<(String, usize, Duration)> = workers
            .values()
            .filter(|w| w.status() == WorkerStatus::Idle)
            .map(|w| (w.id().to_string(), w.current_load(), w.idle_for(now)))
            .collect();
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)));

        let mut selected = 0;
        for (id, load, _) in candidates.into_iter().take(count) {
            if load == 0 {
                if let Some(mut worker) = workers.remove(&id) {
                    worker.set_status(WorkerStatus::Stopped);
                }
                tracing::info!("👋 Worker {} stopped", id);
                self.events.emit(OrchestratorEvent::WorkerStopped { worker_id: id });
            } else if let Some(worker) = workers.get_mut(&id) {
                worker.set_status(WorkerStatus::Draining);
                tokio::spawn(drain_worker(
                    Arc::downgrade(self),
                    id,
                    self.config.shutdown_grace_period,
                ));
            }
            selected += 1;
        }
        selected
    }

    async fn collect_metrics(&self) {
        let now = Instant::now();
        let infos = self.worker_infos().await;
        let pending = self.pending.lock().await.len();
        let min_workers = self.config.scaling.min_workers;

        let (metrics, retention) = {
            let mut collector = self.metrics.lock().await;
            let metrics = collector.snapshot(now, &infos, pending, min_workers);
            collector.push(now, metrics.clone());
            (metrics, collector.retention_period())
        };

        let pruned = {
            let mut executions = self.executions.write().await;
            let before = executions.len();
            executions.retain(|_, e| {
                e.finished_at
                    .map_or(true, |at| now.saturating_duration_since(at) <= retention)
            });
            before - executions.len()
        };
        if pruned > 0 {
            tracing::debug!("🧹 Pruned {} finished pooled executions", pruned);
        }

        if metrics.capacity_shortage && self.running.load(Ordering::SeqCst) {
            self.events.emit(OrchestratorEvent::CapacityShortage {
                worker_count: metrics.total_workers,
                min_workers,
            });
        }
        self.events.emit(OrchestratorEvent::MetricsUpdated { metrics });
    }

    async fn worker_infos(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self.workers.read().await.values().map(ExecutionWorker::info).collect();
        infos.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    async fn running_count(&self) -> usize {
        self.executions
            .read()
            .await
            .values()
            .filter(|e| e.status == ExecutionStatus::Running)
            .count()
    }
}

/// Least-loaded worker that can take `engine_type` right now
fn pick_worker(workers: &HashMap<String, ExecutionWorker>, engine_type: EngineType) -> Option<String> {
    workers
        .values()
        .filter(|w| w.can_accept(engine_type))
        .min_by(|a, b| a.current_load().cmp(&b.current_load()).then_with(|| a.id().cmp(b.id())))
        .map(|w| w.id().to_string())
}

fn spawn_loop<F, Fut>(token: CancellationToken, period: Duration, tick: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(MIN_TICK));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => tick().await,
            }
        }
    })
}

async fn heartbeat_loop(pool: Weak<PoolInner>, worker_id: String, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(inner) = pool.upgrade() else {
            return;
        };
        if !inner.record_heartbeat(&worker_id).await {
            return;
        }
    }
}

async fn finish_startup(pool: Weak<PoolInner>, worker_id: String, startup: Duration) {
    tokio::time::sleep(startup).await;
    let Some(inner) = pool.upgrade() else {
        return;
    };
    let ready = inner
        .workers
        .write()
        .await
        .get_mut(&worker_id)
        .is_some_and(ExecutionWorker::mark_ready);
    if ready {
        tracing::info!("👷 Worker {} started", worker_id);
        inner.events.emit(OrchestratorEvent::WorkerStarted { worker_id });
        inner.assign_pending().await;
    }
}

async fn drain_worker(pool: Weak<PoolInner>, worker_id: String, grace: Duration) {
    let deadline = Instant::now() + grace;
    loop {
        let Some(inner) = pool.upgrade() else {
            return;
        };
        {
            let mut workers = inner.workers.write().await;
            let Some(worker) = workers.get_mut(&worker_id) else {
                return;
            };
            if worker.status() != WorkerStatus::Draining {
                return;
            }
            if worker.current_load() == 0 {
                if let Some(mut worker) = workers.remove(&worker_id) {
                    worker.set_status(WorkerStatus::Stopped);
                }
                drop(workers);
                tracing::info!("👋 Worker {} drained and stopped", worker_id);
                inner.events.emit(OrchestratorEvent::WorkerStopped { worker_id });
                return;
            }
            if Instant::now() >= deadline {
                worker.set_status(WorkerStatus::Idle);
                tracing::warn!(
                    "⚠️ Worker {} did not drain within {:?}, keeping it",
                    worker_id,
                    grace
                );
                return;
            }
        }
        drop(inner);
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
}
