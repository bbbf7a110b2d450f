/// Priority admission queue with a bounded concurrent-dispatch loop
///
/// Requests wait in a `PriorityBuffer`; on every processing tick the loop fills
/// the free dispatch slots (`max_concurrent_executions - active`) with the
/// highest-priority entries and runs each one independently through the
/// `ExecutionHandler`. Retryable failures re-enter the buffer after a geometric
/// backoff at their original priority; everything else is reported terminally.

use crate::adapter::ExecutionHandler;
use crate::config::{OrchestrationConfig, RetryConfig};
use crate::error::{ExecutionError, OrchestratorError, Result};
use crate::events::{OrchestratorEvent, SharedSink};
use crate::execution::{ExecutionRequest, ExecutionResult, Priority};
use crate::runtime::buffer::PriorityBuffer;
use crate::runtime::retry::backoff_delay;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Poll step used while waiting for active executions to drain
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Queue statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub active: usize,
    pub retrying: usize,
    pub max_queue_size: usize,
    pub max_concurrent_executions: usize,
    pub by_priority: BTreeMap<Priority, usize>,
    pub total_enqueued: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_retried: u64,
    pub total_cancelled: u64,
    pub total_rejected: u64,
    pub is_running: bool,
}

#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    cancelled: AtomicU64,
    rejected: AtomicU64,
}

struct ActiveExecution {
    started_at: Instant,
}

/// A failed attempt waiting out its backoff before re-admission
struct RetryingExecution {
    request: ExecutionRequest,
    handle: JoinHandle<()>,
}

struct QueueInner {
    max_concurrent: usize,
    processing_interval: Duration,
    shutdown_grace_period: Duration,
    retry: RetryConfig,
    pending: Mutex<PriorityBuffer>,
    active: RwLock<HashMap<String, ActiveExecution>>,
    retrying: Mutex<HashMap<String, RetryingExecution>>,
    waiters: Mutex<HashMap<String, oneshot::Sender<ExecutionResult>>>,
    counters: QueueCounters,
    handler: Arc<dyn ExecutionHandler>,
    events: SharedSink,
    running: AtomicBool,
}

pub struct ExecutionQueue {
    inner: Arc<QueueInner>,
    shutdown: Mutex<Option<CancellationToken>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionQueue {
    pub fn new(config: &OrchestrationConfig, handler: Arc<dyn ExecutionHandler>, events: SharedSink) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                max_concurrent: config.max_concurrent_executions.max(1),
                processing_interval: config.queue.processing_interval,
                shutdown_grace_period: config.queue.shutdown_grace_period,
                retry: config.retry.clone(),
                pending: Mutex::new(PriorityBuffer::new(config.queue.max_queue_size)),
                active: RwLock::new(HashMap::new()),
                retrying: Mutex::new(HashMap::new()),
                waiters: Mutex::new(HashMap::new()),
                counters: QueueCounters::default(),
                handler,
                events,
                running: AtomicBool::new(false),
            }),
            shutdown: Mutex::new(None),
            loop_handle: Mutex::new(None),
        }
    }

    /// Admit a request; fails with `QueueFull` without touching the buffer when at capacity
    pub async fn enqueue(&self, request: ExecutionRequest) -> Result<String> {
        self.inner.admit(request).await
    }

    /// Admit a request and wait for its terminal result
    ///
    /// Resolves with the Completed, Failed or Cancelled result. Fails with
    /// `Timeout` once `request.timeout` elapses; the execution itself keeps going.
    pub async fn enqueue_and_wait(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        let id = request.id.clone();
        let timeout = request.timeout;
        let (tx, rx) = oneshot::channel();

        // register before admission so a fast completion can't slip past us
        self.inner.waiters.lock().await.insert(id.clone(), tx);
        if let Err(e) = self.inner.admit(request).await {
            self.inner.waiters.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(OrchestratorError::NotRunning("execution queue")),
            Err(_) => {
                self.inner.waiters.lock().await.remove(&id);
                tracing::warn!("⏰ Wait for execution {} timed out after {:?}", id, timeout);
                Err(OrchestratorError::Timeout { id, timeout })
            }
        }
    }

    /// Remove a still-pending request, notifying anyone waiting on it
    pub async fn dequeue(&self, id: &str) -> Option<ExecutionRequest> {
        let request = self.inner.pending.lock().await.remove(id)?;
        self.inner
            .notify_cancelled(&request, "cancelled while pending")
            .await;
        Some(request)
    }

    /// Cancel a request that has not been dispatched (pending or waiting to retry)
    ///
    /// Returns false for unknown, active or already finished executions.
    pub async fn cancel(&self, id: &str) -> bool {
        if self.dequeue(id).await.is_some() {
            return true;
        }
        let retrying = self.inner.retrying.lock().await.remove(id);
        match retrying {
            Some(entry) => {
                entry.handle.abort();
                self.inner
                    .notify_cancelled(&entry.request, "cancelled while waiting to retry")
                    .await;
                true
            }
            None => false,
        }
    }

    /// Start the dispatch loop (idempotent)
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let token = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.processing_interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        inner.process_pending().await;
                    }
                }
            }
            tracing::debug!("🛑 Queue dispatch loop exited");
        });

        *self.shutdown.lock().await = Some(token);
        *self.loop_handle.lock().await = Some(handle);
        tracing::info!(
            "▶️ Execution queue started (max concurrent: {}, tick: {:?})",
            self.inner.max_concurrent,
            self.inner.processing_interval
        );
        Ok(())
    }

    /// Stop dispatching and drain active work for up to the grace period
    ///
    /// Pending requests stay buffered for a later `start()`. Requests waiting to
    /// retry are dropped and reported as cancelled.
    pub async fn stop(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("⏹️ Stopping execution queue");

        if let Some(token) = self.shutdown.lock().await.take() {
            token.cancel();
        }
        if let Some(handle) = self.loop_handle.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!("⚠️ Queue dispatch loop ended abnormally: {}", e);
            }
        }

        let deadline = Instant::now() + self.inner.shutdown_grace_period;
        loop {
            let (active, longest) = {
                let active = self.inner.active.read().await;
                let longest = active.values().map(|a| a.started_at.elapsed()).max();
                (active.len(), longest.unwrap_or_default())
            };
            if active == 0 {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    "⚠️ {} executions still active after {:?} grace period (longest running {:?})",
                    active,
                    self.inner.shutdown_grace_period,
                    longest
                );
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let retrying: Vec<RetryingExecution> = self
            .inner
            .retrying
            .lock()
            .await
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in retrying {
            entry.handle.abort();
            self.inner
                .notify_cancelled(&entry.request, "queue stopped before retry")
                .await;
        }

        tracing::info!("✅ Execution queue stopped");
        Ok(())
    }

    /// Run one dispatch pass; returns the number of executions started
    pub async fn process_pending(&self) -> usize {
        self.inner.process_pending().await
    }

    /// Whether the dispatch loop is up
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Ids waiting for a dispatch slot, in dequeue order
    pub async fn pending_ids(&self) -> Vec<String> {
        self.inner.pending.lock().await.ids()
    }

    /// Waiting for a slot or sitting out a retry backoff
    pub async fn is_pending(&self, id: &str) -> bool {
        self.inner.pending.lock().await.contains(id) || self.inner.retrying.lock().await.contains_key(id)
    }

    /// Holding a dispatch slot right now
    pub async fn is_active(&self, id: &str) -> bool {
        self.inner.active.read().await.contains_key(id)
    }

    pub async fn active_count(&self) -> usize {
        self.inner.active.read().await.len()
    }

    /// Buffer occupancy, per-priority counts and lifetime counters
    pub async fn stats(&self) -> QueueStats {
        let (pending, max_queue_size, by_priority) = {
            let buffer = self.inner.pending.lock().await;
            (buffer.len(), buffer.max_size(), buffer.count_by_priority())
        };
        let counters = &self.inner.counters;
        QueueStats {
            pending,
            active: self.inner.active.read().await.len(),
            retrying: self.inner.retrying.lock().await.len(),
            max_queue_size,
            max_concurrent_executions: self.inner.max_concurrent,
            by_priority,
            total_enqueued: counters.enqueued.load(Ordering::Relaxed),
            total_completed: counters.completed.load(Ordering::Relaxed),
            total_failed: counters.failed.load(Ordering::Relaxed),
            total_retried: counters.retried.load(Ordering::Relaxed),
            total_cancelled: counters.cancelled.load(Ordering::Relaxed),
            total_rejected: counters.rejected.load(Ordering::Relaxed),
            is_running: self.is_running(),
        }
    }
}

impl QueueInner {
    async fn admit(&self, request: ExecutionRequest) -> Result<String> {
        let id = request.id.clone();
        let workflow_id = request.workflow_id().to_string();
        let priority = request.priority;

        {
            let mut pending = self.pending.lock().await;
            if pending.push(request).is_err() {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("🚫 Queue full, rejecting execution {} ({})", id, workflow_id);
                return Err(OrchestratorError::QueueFull {
                    max_size: pending.max_size(),
                });
            }
        }

        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("📥 Enqueued execution {} for '{}' at {}", id, workflow_id, priority);
        self.events.emit(OrchestratorEvent::ExecutionQueued {
            execution_id: id.clone(),
            workflow_id,
            priority,
        });
        Ok(id)
    }

    async fn process_pending(self: &Arc<Self>) -> usize {
        let batch = {
            let mut active = self.active.write().await;
            let available = self.max_concurrent.saturating_sub(active.len());
            if available == 0 {
                return 0;
            }
            let mut pending = self.pending.lock().await;
            let mut batch = Vec::with_capacity(available);
            while batch.len() < available {
                let Some(request) = pending.pop_front() else {
                    break;
                };
                active.insert(
                    request.id.clone(),
                    ActiveExecution {
                        started_at: Instant::now(),
                    },
                );
                batch.push(request);
            }
            batch
        };

        let started = batch.len();
        for request in batch {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.dispatch(request).await;
            });
        }
        started
    }

    async fn dispatch(self: Arc<Self>, request: ExecutionRequest) {
        let started_at = Utc::now();
        let clock = Instant::now();

        tracing::info!(
            "🚀 Dispatching execution {} ('{}', attempt {})",
            request.id,
            request.workflow_id(),
            request.attempt()
        );
        self.events.emit(OrchestratorEvent::ExecutionStarted {
            execution_id: request.id.clone(),
            workflow_id: request.workflow_id().to_string(),
            engine_type: request.engine_type,
            submitted_by: request.submitted_by.clone(),
            parameters: request.parameters.clone(),
            attempt: request.attempt(),
            timeout_ms: request.timeout.as_millis() as u64,
        });

        let outcome = self.handler.execute(&request).await;
        let duration = clock.elapsed();
        self.active.write().await.remove(&request.id);

        match outcome {
            Ok(mut result) => {
                result.metrics.attempts = request.attempt();
                if result.metrics.duration_ms == 0 {
                    result.metrics.duration_ms = duration.as_millis() as u64;
                }
                tracing::info!("✅ Execution {} completed in {:?}", request.id, duration);
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                self.events.emit(OrchestratorEvent::ExecutionCompleted {
                    execution_id: request.id.clone(),
                    workflow_id: request.workflow_id().to_string(),
                    result: result.clone(),
                });
                self.resolve(&request.id, result).await;
            }
            Err(error) if error.is_retryable() && request.retry_count < request.max_retries => {
                self.schedule_retry(request, error).await;
            }
            Err(error) => {
                self.fail(&request, error, started_at).await;
            }
        }
    }

    async fn schedule_retry(self: Arc<Self>, request: ExecutionRequest, error: ExecutionError) {
        let next = request.next_attempt();
        let delay = backoff_delay(
            self.retry.initial_delay,
            self.retry.backoff_factor,
            next.retry_count.saturating_sub(1),
        );

        tracing::warn!(
            "🔁 Execution {} failed with {:?}, retry {}/{} in {:?}",
            next.id,
            error.code,
            next.retry_count,
            next.max_retries,
            delay
        );
        self.counters.retried.fetch_add(1, Ordering::Relaxed);
        self.events.emit(OrchestratorEvent::ExecutionRetrying {
            execution_id: next.id.clone(),
            attempt: next.attempt(),
            delay_ms: delay.as_millis() as u64,
            error: error.clone(),
        });

        // hold the map lock across spawn so the timer can't fire before it is tracked
        let mut retrying = self.retrying.lock().await;
        let inner = Arc::clone(&self);
        let readmitted = next.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.readmit(readmitted, error).await;
        });
        retrying.insert(
            next.id.clone(),
            RetryingExecution {
                request: next,
                handle,
            },
        );
    }

    async fn readmit(&self, request: ExecutionRequest, last_error: ExecutionError) {
        if self.retrying.lock().await.remove(&request.id).is_none() {
            // cancelled while waiting
            return;
        }

        let rejected = {
            let mut pending = self.pending.lock().await;
            pending.push(request).err()
        };
        if let Some(request) = rejected {
            tracing::error!("❌ Retry of {} could not be re-admitted: queue full", request.id);
            let error = last_error.with_details(serde_json::json!({
                "readmission": "queue full"
            }));
            self.fail(&request, error, Utc::now()).await;
        }
    }

    async fn fail(&self, request: &ExecutionRequest, error: ExecutionError, started_at: DateTime<Utc>) {
        tracing::error!(
            "❌ Execution {} failed after {} attempt(s): {}",
            request.id,
            request.attempt(),
            error
        );
        let result = ExecutionResult::failed(request.id.clone(), error, started_at).with_attempts(request.attempt());
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.events.emit(OrchestratorEvent::ExecutionFailed {
            execution_id: request.id.clone(),
            workflow_id: request.workflow_id().to_string(),
            result: result.clone(),
        });
        self.resolve(&request.id, result).await;
    }

    async fn notify_cancelled(&self, request: &ExecutionRequest, reason: &str) {
        tracing::info!("🗑️ Execution {} {}", request.id, reason);
        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        self.events.emit(OrchestratorEvent::ExecutionCancelled {
            execution_id: request.id.clone(),
        });
        let result = ExecutionResult::cancelled(request.id.clone(), reason, request.created_at)
            .with_attempts(request.attempt());
        self.resolve(&request.id, result).await;
    }

    async fn resolve(&self, id: &str, result: ExecutionResult) {
        if let Some(waiter) = self.waiters.lock().await.remove(id) {
            // receiver gone means the caller stopped waiting
            let _ = waiter.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::error::ErrorCode;
    use crate::events::{ChannelSink, NoopSink};
    use crate::execution::ExecutionStatus;
    use crate::workflow::{EngineType, WorkflowDefinition};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    /// Records dispatch order and peak concurrency; fails with `failure` when set
    struct ScriptedHandler {
        delay: Duration,
        failure: Option<ErrorCode>,
        order: StdMutex<Vec<String>>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedHandler {
        fn new(delay: Duration, failure: Option<ErrorCode>) -> Arc<Self> {
            Arc::new(Self {
                delay,
                failure,
                order: StdMutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }

        fn order(&self) -> Vec<String> {
            self.order.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ExecutionHandler for ScriptedHandler {
        async fn execute(&self, request: &ExecutionRequest) -> std::result::Result<ExecutionResult, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.order.lock().unwrap().push(request.workflow.id.clone());

            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match self.failure {
                Some(code) => Err(ExecutionError::new(code, "scripted failure")),
                None => Ok(ExecutionResult::completed(request.id.clone(), json!({"ok": true}), Utc::now())),
            }
        }
    }

    fn config(max_concurrent: usize, max_queue_size: usize) -> OrchestrationConfig {
        OrchestrationConfig {
            max_concurrent_executions: max_concurrent,
            default_timeout: Duration::from_secs(5),
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(10),
                backoff_factor: 2.0,
            },
            queue: QueueConfig {
                max_queue_size,
                processing_interval: Duration::from_millis(5),
                shutdown_grace_period: Duration::from_secs(2),
            },
            history_limit: 100,
        }
    }

    fn request(tag: &str, priority: Priority) -> ExecutionRequest {
        let wf = Arc::new(WorkflowDefinition::new(tag, tag, EngineType::Local));
        ExecutionRequest::new(wf, json!({}), priority, "test").with_timeout(Duration::from_secs(5))
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn dispatches_by_priority_with_single_slot() {
        let handler = ScriptedHandler::new(Duration::from_millis(5), None);
        let queue = ExecutionQueue::new(&config(1, 10), handler.clone(), Arc::new(NoopSink));

        queue.enqueue(request("low", Priority::Low)).await.unwrap();
        queue.enqueue(request("critical", Priority::Critical)).await.unwrap();
        queue.enqueue(request("normal", Priority::Normal)).await.unwrap();
        queue.start().await.unwrap();

        wait_for(|| handler.order().len() == 3).await;
        assert_eq!(handler.order(), vec!["critical", "normal", "low"]);
        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn never_exceeds_max_concurrency() {
        let handler = ScriptedHandler::new(Duration::from_millis(20), None);
        let queue = ExecutionQueue::new(&config(3, 100), handler.clone(), Arc::new(NoopSink));
        for i in 0..12 {
            queue.enqueue(request(&format!("r{}", i), Priority::Normal)).await.unwrap();
        }
        queue.start().await.unwrap();

        for _ in 0..40 {
            assert!(queue.active_count().await <= 3);
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
        wait_for(|| handler.calls.load(Ordering::SeqCst) == 12).await;
        queue.stop().await.unwrap();

        assert!(handler.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(queue.stats().await.total_completed, 12);
    }

    #[tokio::test]
    async fn full_queue_rejects_without_mutation() {
        let handler = ScriptedHandler::new(Duration::ZERO, None);
        let queue = ExecutionQueue::new(&config(1, 2), handler, Arc::new(NoopSink));
        queue.enqueue(request("a", Priority::Low)).await.unwrap();
        queue.enqueue(request("b", Priority::Low)).await.unwrap();
        let before = queue.pending_ids().await;

        let err = queue.enqueue(request("c", Priority::Critical)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::QueueFull { max_size: 2 }));
        assert_eq!(queue.pending_ids().await, before);
        assert_eq!(queue.stats().await.total_rejected, 1);
    }

    #[tokio::test]
    async fn retryable_failure_is_resubmitted_with_backoff_then_fails() {
        let handler = ScriptedHandler::new(Duration::ZERO, Some(ErrorCode::NetworkError));
        let (sink, mut events) = ChannelSink::channel();
        let queue = ExecutionQueue::new(&config(1, 10), handler.clone(), Arc::new(sink));
        queue.start().await.unwrap();

        let result = queue
            .enqueue_and_wait(request("flaky", Priority::Normal).with_max_retries(3))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.as_ref().map(|e| e.code), Some(ErrorCode::NetworkError));
        assert_eq!(result.metrics.attempts, 4);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);

        let mut delays = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let OrchestratorEvent::ExecutionRetrying { delay_ms, .. } = event {
                delays.push(delay_ms);
            }
        }
        assert_eq!(delays, vec![10, 20, 40]);

        // no further attempts after the terminal failure
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn terminal_failure_is_not_retried() {
        let handler = ScriptedHandler::new(Duration::ZERO, Some(ErrorCode::WorkflowFailed));
        let queue = ExecutionQueue::new(&config(1, 10), handler.clone(), Arc::new(NoopSink));
        queue.start().await.unwrap();

        let result = queue.enqueue_and_wait(request("bad", Priority::High)).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().await.total_retried, 0);
        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_pending_and_unknown() {
        let handler = ScriptedHandler::new(Duration::ZERO, None);
        let queue = Arc::new(ExecutionQueue::new(&config(1, 10), handler, Arc::new(NoopSink)));

        let req = request("pending", Priority::Normal);
        let id = req.id.clone();
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue_and_wait(req).await })
        };
        wait_for(|| queue.inner.counters.enqueued.load(Ordering::SeqCst) == 1).await;

        assert!(queue.cancel(&id).await);
        assert!(!queue.cancel(&id).await);
        assert!(!queue.cancel("does-not-exist").await);

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert!(queue.pending_ids().await.is_empty());
    }

    #[tokio::test]
    async fn wait_timeout_does_not_abort_execution() {
        let handler = ScriptedHandler::new(Duration::from_millis(120), None);
        let queue = ExecutionQueue::new(&config(1, 10), handler.clone(), Arc::new(NoopSink));
        queue.start().await.unwrap();

        let req = request("slow", Priority::Normal).with_timeout(Duration::from_millis(30));
        let err = queue.enqueue_and_wait(req).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout { .. }));

        // the execution still finishes on its own
        queue.stop().await.unwrap();
        assert_eq!(queue.stats().await.total_completed, 1);
    }

    #[tokio::test]
    async fn stop_drains_active_work() {
        let handler = ScriptedHandler::new(Duration::from_millis(50), None);
        let queue = ExecutionQueue::new(&config(2, 10), handler.clone(), Arc::new(NoopSink));
        queue.enqueue(request("a", Priority::Normal)).await.unwrap();
        queue.start().await.unwrap();

        wait_for(|| handler.calls.load(Ordering::SeqCst) == 1).await;
        queue.stop().await.unwrap();

        let stats = queue.stats().await;
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total_completed, 1);
        assert!(!stats.is_running);
    }
}
