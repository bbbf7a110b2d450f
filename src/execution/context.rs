/// Runtime execution context tracked per admitted execution
///
/// Owned exclusively by the orchestration engine's live-context table. Holds the
/// bounded execution log, a key/value side channel for cross-step data, per-step
/// results and named timers that are aborted when the execution finalizes.
///
/// The side channel is seeded from the top-level keys of an object `parameters`
/// and carries engine-side facts between attempts (`last_error` after a retry).
/// The current step marker follows the step tags of folded engine logs, so the
/// closing log line names the step the execution ended on.

use crate::execution::types::{ExecutionLog, ExecutionResult, ExecutionStatus, LogLevel};
use crate::error::ExecutionError;
use crate::workflow::EngineType;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::task::JoinHandle;

/// Log lines kept per execution; the oldest are dropped first
pub const MAX_LOG_ENTRIES: usize = 1000;

#[derive(Debug)]
pub struct ExecutionContext {
    pub id: String,
    pub workflow_id: String,
    pub engine_type: EngineType,
    pub parameters: Value,
    pub submitted_by: String,
    status: ExecutionStatus,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    result: Option<Value>,
    error: Option<ExecutionError>,
    logs: VecDeque<ExecutionLog>,
    variables: HashMap<String, Value>,
    step_results: BTreeMap<String, Value>,
    current_step: Option<String>,
    attempt: u32,
    timers: HashMap<String, JoinHandle<()>>,
}

/// Serializable point-in-time view of a context
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSnapshot {
    pub id: String,
    pub workflow_id: String,
    pub engine_type: EngineType,
    pub submitted_by: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub current_step: Option<String>,
    pub attempt: u32,
    pub log_entries: usize,
    pub variables: BTreeMap<String, Value>,
    pub step_results: BTreeMap<String, Value>,
    pub result: Option<Value>,
    pub error: Option<ExecutionError>,
}

impl ExecutionContext {
    /// Create the context for an execution whose dispatch just started
    pub fn from_parts(
        id: String,
        workflow_id: String,
        engine_type: EngineType,
        parameters: Value,
        submitted_by: String,
    ) -> Self {
        let variables = match &parameters {
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            _ => HashMap::new(),
        };
        Self {
            id,
            workflow_id,
            engine_type,
            parameters,
            submitted_by,
            status: ExecutionStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            result: None,
            error: None,
            logs: VecDeque::new(),
            variables,
            step_results: BTreeMap::new(),
            current_step: None,
            attempt: 1,
            timers: HashMap::new(),
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ExecutionStatus) {
        self.status = status;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn set_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Append a log line, evicting the oldest when the cap is reached
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let mut entry = ExecutionLog::new(level, message);
        entry.step = self.current_step.clone();
        self.push_log(entry);
    }

    pub fn push_log(&mut self, entry: ExecutionLog) {
        if self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(entry);
    }

    pub fn logs(&self) -> Vec<ExecutionLog> {
        self.logs.iter().cloned().collect()
    }

    pub fn set_variable(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
    }

    pub fn variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    pub fn current_step(&self) -> Option<&str> {
        self.current_step.as_deref()
    }

    /// Register a named timer, aborting any timer previously registered under that name
    pub fn set_timer(&mut self, name: impl Into<String>, handle: JoinHandle<()>) {
        if let Some(previous) = self.timers.insert(name.into(), handle) {
            previous.abort();
        }
    }

    pub fn clear_timer(&mut self, name: &str) -> bool {
        match self.timers.remove(name) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn clear_all_timers(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }

    pub fn active_timers(&self) -> Vec<String> {
        self.timers.keys().cloned().collect()
    }

    /// Fold a terminal result into the context and stop its timers
    pub fn finalize(&mut self, result: &ExecutionResult) {
        self.status = result.status;
        self.end_time = Some(result.completed_at.unwrap_or_else(Utc::now));
        self.result = result.result.clone();
        self.error = result.error.clone();
        for entry in &result.logs {
            if entry.step.is_some() {
                self.current_step = entry.step.clone();
            }
            self.push_log(entry.clone());
        }
        for (step, value) in &result.steps {
            self.step_results.insert(step.clone(), value.clone());
        }
        let level = match result.status {
            ExecutionStatus::Completed => LogLevel::Info,
            ExecutionStatus::Cancelled => LogLevel::Warn,
            _ => LogLevel::Error,
        };
        self.log(level, format!("execution finished as {:?}", result.status));
        self.current_step = None;
        self.clear_all_timers();
    }

    /// Terminal result assembled from the context's own state
    pub fn to_result(&self) -> ExecutionResult {
        let mut result = ExecutionResult::running(self.id.clone(), self.start_time);
        result.status = self.status;
        result.result = self.result.clone();
        result.error = self.error.clone();
        result.completed_at = self.end_time;
        result.logs = self.logs();
        result.steps = self.step_results.clone();
        result.metrics.attempts = self.attempt;
        result.metrics.steps_executed = self.step_results.len();
        if let Some(end) = self.end_time {
            result.metrics.duration_ms = (end - self.start_time).num_milliseconds().max(0) as u64;
        }
        result
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        ExecutionSnapshot {
            id: self.id.clone(),
            workflow_id: self.workflow_id.clone(),
            engine_type: self.engine_type,
            submitted_by: self.submitted_by.clone(),
            status: self.status,
            start_time: self.start_time,
            end_time: self.end_time,
            current_step: self.current_step.clone(),
            attempt: self.attempt,
            log_entries: self.logs.len(),
            variables: self.variables.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            step_results: self.step_results.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.clear_all_timers();
    }
}
