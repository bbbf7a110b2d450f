/// Logical execution workers
///
/// A worker is a capacity accounting unit: it carries a static config (capacity,
/// supported engines, heartbeat interval), a status, the set of execution ids it
/// currently runs, and running totals. The pool owns every worker and is the
/// only thing that mutates one.

use crate::config::WorkerConfig;
use crate::workflow::EngineType;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Worker lifecycle
///
/// `Starting` → `Idle` ⇄ `Busy`; `Idle` → `Draining` → removed (or back to
/// `Idle`); any → `Unhealthy` on heartbeat loss; `Stopped` on pool shutdown.
/// `Idle` means "accepting work", not "empty": a worker stays `Idle` until its
/// load reaches capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Idle,
    Busy,
    Draining,
    Unhealthy,
    Stopped,
}

/// Serializable view of a worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: String,
    pub status: WorkerStatus,
    pub current_load: usize,
    pub capacity: usize,
    pub supported_engines: Vec<EngineType>,
    pub active_executions: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub total_executions: u64,
    pub total_failures: u64,
    pub average_duration_ms: f64,
}

#[derive(Debug)]
pub struct ExecutionWorker {
    id: String,
    config: WorkerConfig,
    status: WorkerStatus,
    active: HashSet<String>,
    started_at: DateTime<Utc>,
    last_heartbeat: Instant,
    last_heartbeat_at: DateTime<Utc>,
    /// Set whenever the worker has no active executions
    empty_since: Option<Instant>,
    total_executions: u64,
    total_failures: u64,
    average_duration_ms: f64,
    heartbeat_task: Option<JoinHandle<()>>,
}

impl ExecutionWorker {
    pub fn new(config: WorkerConfig) -> Self {
        let now = Instant::now();
        Self {
            id: format!("worker-{}", Uuid::new_v4()),
            config,
            status: WorkerStatus::Starting,
            active: HashSet::new(),
            started_at: Utc::now(),
            last_heartbeat: now,
            last_heartbeat_at: Utc::now(),
            empty_since: Some(now),
            total_executions: 0,
            total_failures: 0,
            average_duration_ms: 0.0,
            heartbeat_task: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn current_load(&self) -> usize {
        self.active.len()
    }

    pub fn supports(&self, engine_type: EngineType) -> bool {
        self.config.supported_engines.contains(&engine_type)
    }

    /// Whether this worker may be assigned a request for `engine_type` right now
    pub fn can_accept(&self, engine_type: EngineType) -> bool {
        self.status == WorkerStatus::Idle && self.supports(engine_type) && self.current_load() < self.capacity()
    }

    /// Whether the worker's capacity counts toward the pool total
    pub fn is_serving(&self) -> bool {
        matches!(
            self.status,
            WorkerStatus::Starting | WorkerStatus::Idle | WorkerStatus::Busy | WorkerStatus::Draining
        )
    }

    pub fn mark_ready(&mut self) -> bool {
        if self.status != WorkerStatus::Starting {
            return false;
        }
        self.status = WorkerStatus::Idle;
        true
    }

    pub fn set_status(&mut self, status: WorkerStatus) {
        self.status = status;
    }

    pub fn assign(&mut self, execution_id: impl Into<String>) {
        self.active.insert(execution_id.into());
        self.empty_since = None;
        if self.status == WorkerStatus::Idle && self.current_load() >= self.capacity() {
            self.status = WorkerStatus::Busy;
        }
    }

    /// Release a finished execution and fold it into the totals
    pub fn complete(&mut self, execution_id: &str, duration: Duration, success: bool) -> bool {
        if !self.release(execution_id) {
            return false;
        }
        self.total_executions += 1;
        if !success {
            self.total_failures += 1;
        }
        let sample = duration.as_secs_f64() * 1000.0;
        self.average_duration_ms += (sample - self.average_duration_ms) / self.total_executions as f64;
        true
    }

    /// Drop an execution from the active set without counting it
    pub fn release(&mut self, execution_id: &str) -> bool {
        if !self.active.remove(execution_id) {
            return false;
        }
        if self.status == WorkerStatus::Busy {
            self.status = WorkerStatus::Idle;
        }
        if self.active.is_empty() {
            self.empty_since = Some(Instant::now());
        }
        true
    }

    pub fn record_heartbeat(&mut self, now: Instant) {
        self.last_heartbeat = now;
        self.last_heartbeat_at = Utc::now();
    }

    pub fn heartbeat_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }

    /// Stale once the last heartbeat is older than twice the health-check interval
    pub fn is_stale(&self, now: Instant) -> bool {
        self.heartbeat_age(now) > self.config.health_check_interval * 2
    }

    /// How long the worker has had nothing to run
    pub fn idle_for(&self, now: Instant) -> Duration {
        self.empty_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default()
    }

    pub fn active_executions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn set_heartbeat_task(&mut self, handle: JoinHandle<()>) {
        if let Some(previous) = self.heartbeat_task.replace(handle) {
            previous.abort();
        }
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id.clone(),
            status: self.status,
            current_load: self.current_load(),
            capacity: self.capacity(),
            supported_engines: self.config.supported_engines.clone(),
            active_executions: self.active_executions(),
            started_at: self.started_at,
            last_heartbeat: self.last_heartbeat_at,
            total_executions: self.total_executions,
            total_failures: self.total_failures,
            average_duration_ms: self.average_duration_ms,
        }
    }
}

impl Drop for ExecutionWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat_task.take() {
            handle.abort();
        }
    }
}
