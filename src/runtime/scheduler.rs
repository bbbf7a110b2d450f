/// Recurring workflow scheduler
///
/// Every schedule owns an independent timer task that sleeps until the next cron
/// fire time. A fire never executes anything: it builds a fresh `ExecutionRequest`
/// and pushes it into a bounded output channel for admission. A full or closed
/// channel counts as a production failure and is reported as an event.
///
/// Timers hold only a `Weak` reference to the scheduler state and a generation
/// number, so a re-armed or removed schedule silently retires its old timer.

use crate::config::OrchestrationConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::{OrchestratorEvent, SharedSink};
use crate::execution::{ExecutionRequest, Priority};
use crate::runtime::cron::{CronExpression, ScheduleTimezone};
use crate::workflow::WorkflowDefinition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// How a recurring execution is produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub cron_expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    /// Fire budget; the schedule removes itself once it is spent
    #[serde(default)]
    pub max_executions: Option<u64>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Timeout for produced requests; the scheduler default when unset
    #[serde(default)]
    pub timeout: Option<Duration>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enabled() -> bool {
    true
}

impl ScheduleConfig {
    pub fn new(cron_expression: impl Into<String>) -> Self {
        Self {
            cron_expression: cron_expression.into(),
            timezone: default_timezone(),
            start_date: None,
            end_date: None,
            max_executions: None,
            priority: Priority::Normal,
            enabled: true,
            timeout: None,
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn with_max_executions(mut self, max_executions: u64) -> Self {
        self.max_executions = Some(max_executions);
        self
    }

    pub fn with_start_date(mut self, start_date: DateTime<Utc>) -> Self {
        self.start_date = Some(start_date);
        self
    }

    pub fn with_end_date(mut self, end_date: DateTime<Utc>) -> Self {
        self.end_date = Some(end_date);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Partial update applied by `update_schedule`; `None` leaves a field untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleUpdate {
    pub cron_expression: Option<String>,
    pub timezone: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub max_executions: Option<u64>,
    pub priority: Option<Priority>,
    pub enabled: Option<bool>,
    pub timeout: Option<Duration>,
    pub parameters: Option<Value>,
}

/// A registered recurring schedule
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledWorkflow {
    pub id: String,
    pub workflow_id: String,
    #[serde(skip)]
    pub workflow: Arc<WorkflowDefinition>,
    pub config: ScheduleConfig,
    pub parameters: Value,
    pub submitted_by: String,
    pub created_at: DateTime<Utc>,
    pub last_execution: Option<DateTime<Utc>>,
    pub next_execution: Option<DateTime<Utc>>,
    pub execution_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub total_schedules: usize,
    pub enabled_schedules: usize,
    pub total_fired: u64,
    pub failed_schedules: u64,
    pub is_running: bool,
}

struct ScheduleEntry {
    schedule: ScheduledWorkflow,
    cron: CronExpression,
    timezone: ScheduleTimezone,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

impl ScheduleEntry {
    fn budget_spent(&self) -> bool {
        self.schedule
            .config
            .max_executions
            .is_some_and(|max| self.schedule.execution_count >= max)
    }

    fn past_end(&self, now: DateTime<Utc>) -> bool {
        self.schedule.config.end_date.is_some_and(|end| now > end)
    }

    /// Next fire strictly after `after`, honouring start and end dates
    fn compute_next(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let from = match self.schedule.config.start_date {
            Some(start) if start > after => start - chrono::Duration::seconds(1),
            _ => after,
        };
        let next = self.cron.next_after(from, &self.timezone)?;
        match self.schedule.config.end_date {
            Some(end) if next > end => None,
            _ => Some(next),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FireSource {
    Timer { generation: u64 },
    Manual,
}

enum FireOutcome {
    Produced(String),
    /// The timer that woke up no longer owns the schedule
    Stale,
    Finished,
}

struct SchedulerInner {
    schedules: RwLock<HashMap<String, ScheduleEntry>>,
    output: mpsc::Sender<ExecutionRequest>,
    events: SharedSink,
    default_timeout: Duration,
    max_retries: u32,
    total_fired: AtomicU64,
    failed_schedules: AtomicU64,
    running: AtomicBool,
}

/// Owns every recurring schedule and produces admission candidates on each fire
pub struct ExecutionScheduler {
    inner: Arc<SchedulerInner>,
}

impl ExecutionScheduler {
    pub fn new(config: &OrchestrationConfig, output: mpsc::Sender<ExecutionRequest>, events: SharedSink) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                schedules: RwLock::new(HashMap::new()),
                output,
                events,
                default_timeout: config.default_timeout,
                max_retries: config.retry.max_attempts,
                total_fired: AtomicU64::new(0),
                failed_schedules: AtomicU64::new(0),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Register a recurring schedule; fails before creating anything on a bad cron or timezone
    pub async fn schedule_workflow(
        &self,
        workflow: Arc<WorkflowDefinition>,
        config: ScheduleConfig,
        parameters: Value,
        submitted_by: impl Into<String>,
    ) -> Result<String> {
        let cron = CronExpression::parse(&config.cron_expression)?;
        let timezone = ScheduleTimezone::parse(&config.timezone)?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let mut entry = ScheduleEntry {
            schedule: ScheduledWorkflow {
                id: id.clone(),
                workflow_id: workflow.id.clone(),
                workflow,
                config,
                parameters,
                submitted_by: submitted_by.into(),
                created_at: now,
                last_execution: None,
                next_execution: None,
                execution_count: 0,
            },
            cron,
            timezone,
            timer: None,
            generation: 0,
        };

        entry.schedule.next_execution = entry.compute_next(now);
        if entry.schedule.next_execution.is_none() {
            return Err(OrchestratorError::Schedule(format!(
                "'{}' never fires before the schedule's end date",
                entry.schedule.config.cron_expression
            )));
        }

        tracing::info!(
            "⏰ Scheduled workflow '{}' as {} ({} {}), next fire {:?}",
            entry.schedule.workflow_id,
            id,
            entry.cron,
            entry.timezone,
            entry.schedule.next_execution
        );
        let workflow_id = entry.schedule.workflow_id.clone();

        let mut schedules = self.inner.schedules.write().await;
        self.inner.arm(&id, &mut entry);
        schedules.insert(id.clone(), entry);
        drop(schedules);

        self.inner.events.emit(OrchestratorEvent::ScheduleCreated {
            schedule_id: id.clone(),
            workflow_id,
        });
        Ok(id)
    }

    pub async fn unschedule_workflow(&self, id: &str) -> bool {
        let removed = self.inner.schedules.write().await.remove(id);
        match removed {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                tracing::info!("🗑️ Unscheduled {} ('{}')", id, entry.schedule.workflow_id);
                true
            }
            None => false,
        }
    }

    /// Apply a partial update, keeping fire count and creation time
    ///
    /// The timer is only re-armed when the firing rule itself changed.
    pub async fn update_schedule(&self, id: &str, update: ScheduleUpdate) -> Result<bool> {
        let mut schedules = self.inner.schedules.write().await;
        let Some(entry) = schedules.get_mut(id) else {
            return Ok(false);
        };

        let cron = match &update.cron_expression {
            Some(expression) if *expression != entry.schedule.config.cron_expression => {
                Some(CronExpression::parse(expression)?)
            }
            _ => None,
        };
        let timezone = match &update.timezone {
            Some(name) if *name != entry.schedule.config.timezone => Some(ScheduleTimezone::parse(name)?),
            _ => None,
        };

        let mut rearm = cron.is_some() || timezone.is_some();
        if let Some(cron) = cron {
            entry.schedule.config.cron_expression = cron.as_str().to_string();
            entry.cron = cron;
        }
        if let Some(timezone) = timezone {
            if let Some(name) = update.timezone {
                entry.schedule.config.timezone = name;
            }
            entry.timezone = timezone;
        }
        if update.start_date.is_some() {
            entry.schedule.config.start_date = update.start_date;
            rearm = true;
        }
        if update.end_date.is_some() {
            entry.schedule.config.end_date = update.end_date;
            rearm = true;
        }
        if let Some(max) = update.max_executions {
            entry.schedule.config.max_executions = Some(max);
        }
        if let Some(priority) = update.priority {
            entry.schedule.config.priority = priority;
        }
        if let Some(timeout) = update.timeout {
            entry.schedule.config.timeout = Some(timeout);
        }
        if let Some(parameters) = update.parameters {
            entry.schedule.parameters = parameters;
        }
        if let Some(enabled) = update.enabled {
            if enabled != entry.schedule.config.enabled {
                entry.schedule.config.enabled = enabled;
                rearm = true;
            }
        }

        if rearm {
            entry.schedule.next_execution = entry.compute_next(Utc::now());
            self.inner.arm(id, entry);
        }
        tracing::info!("✏️ Updated schedule {} (timer re-armed: {})", id, rearm);
        Ok(true)
    }

    pub async fn toggle_schedule(&self, id: &str, enabled: bool) -> bool {
        let mut schedules = self.inner.schedules.write().await;
        let Some(entry) = schedules.get_mut(id) else {
            return false;
        };
        if entry.schedule.config.enabled != enabled {
            entry.schedule.config.enabled = enabled;
            entry.schedule.next_execution = entry.compute_next(Utc::now());
            self.inner.arm(id, entry);
            tracing::info!("🔀 Schedule {} {}", id, if enabled { "enabled" } else { "disabled" });
        }
        true
    }

    /// Fire a schedule once, out of band, under the same termination rules as a timer fire
    ///
    /// Returns the id of the produced execution request.
    pub async fn trigger_scheduled_workflow(&self, id: &str) -> Result<String> {
        match self.inner.fire(id, FireSource::Manual).await? {
            FireOutcome::Produced(execution_id) => Ok(execution_id),
            FireOutcome::Finished | FireOutcome::Stale => {
                Err(OrchestratorError::Schedule(format!("schedule {} has already completed", id)))
            }
        }
    }

    /// Next fire time of an enabled schedule
    pub async fn get_next_execution_time(&self, id: &str) -> Option<DateTime<Utc>> {
        let schedules = self.inner.schedules.read().await;
        let entry = schedules.get(id)?;
        if !entry.schedule.config.enabled {
            return None;
        }
        entry.schedule.next_execution
    }

    /// Copy of a registered schedule; `None` once unscheduled or completed
    pub async fn get_schedule(&self, id: &str) -> Option<ScheduledWorkflow> {
        self.inner
            .schedules
            .read()
            .await
            .get(id)
            .map(|entry| entry.schedule.clone())
    }

    /// Every registered schedule, oldest first
    pub async fn list_schedules(&self) -> Vec<ScheduledWorkflow> {
        let mut schedules: Vec<ScheduledWorkflow> = self
            .inner
            .schedules
            .read()
            .await
            .values()
            .map(|entry| entry.schedule.clone())
            .collect();
        schedules.sort_by_key(|schedule| schedule.created_at);
        schedules
    }

    /// Schedule counts and lifetime fire and failure counters
    pub async fn stats(&self) -> SchedulerStats {
        let schedules = self.inner.schedules.read().await;
        SchedulerStats {
            total_schedules: schedules.len(),
            enabled_schedules: schedules.values().filter(|e| e.schedule.config.enabled).count(),
            total_fired: self.inner.total_fired.load(Ordering::Relaxed),
            failed_schedules: self.inner.failed_schedules.load(Ordering::Relaxed),
            is_running: self.is_running(),
        }
    }

    /// Whether timers are armed
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Arm timers for every enabled schedule
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut schedules = self.inner.schedules.write().await;
        let now = Utc::now();
        for (id, entry) in schedules.iter_mut() {
            entry.schedule.next_execution = entry.compute_next(now);
            self.inner.arm(id, entry);
        }
        tracing::info!("✅ Execution scheduler started with {} schedules", schedules.len());
        Ok(())
    }

    /// Disarm every timer; schedules are kept for a later `start()`
    pub async fn stop(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut schedules = self.inner.schedules.write().await;
        for entry in schedules.values_mut() {
            entry.generation += 1;
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
        tracing::info!("⏹️ Execution scheduler stopped");
        Ok(())
    }
}

impl Drop for ExecutionScheduler {
    fn drop(&mut self) {
        if let Ok(mut schedules) = self.inner.schedules.try_write() {
            for entry in schedules.values_mut() {
                if let Some(timer) = entry.timer.take() {
                    timer.abort();
                }
            }
        }
    }
}

impl SchedulerInner {
    /// Replace the entry's timer; only enabled schedules of a running scheduler get one
    fn arm(self: &Arc<Self>, id: &str, entry: &mut ScheduleEntry) {
        entry.generation += 1;
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        if !self.running.load(Ordering::SeqCst) || !entry.schedule.config.enabled {
            return;
        }
        if entry.schedule.next_execution.is_none() {
            return;
        }

        let weak = Arc::downgrade(self);
        let id = id.to_string();
        let generation = entry.generation;
        entry.timer = Some(tokio::spawn(run_timer(weak, id, generation)));
    }

    async fn fire(&self, id: &str, source: FireSource) -> Result<FireOutcome> {
        let mut schedules = self.schedules.write().await;
        let Some(entry) = schedules.get_mut(id) else {
            return Err(OrchestratorError::ScheduleNotFound(id.to_string()));
        };
        if let FireSource::Timer { generation } = source {
            if generation != entry.generation {
                return Ok(FireOutcome::Stale);
            }
        }

        let now = Utc::now();
        if entry.budget_spent() || entry.past_end(now) {
            if let Some(entry) = schedules.remove(id) {
                self.finish(entry, source);
            }
            return Ok(FireOutcome::Finished);
        }

        let schedule = &entry.schedule;
        let request = ExecutionRequest::new(
            Arc::clone(&schedule.workflow),
            schedule.parameters.clone(),
            schedule.config.priority,
            schedule.submitted_by.clone(),
        )
        .with_timeout(schedule.config.timeout.unwrap_or(self.default_timeout))
        .with_max_retries(self.max_retries)
        .with_schedule(id);
        let execution_id = request.id.clone();

        if let Err(e) = self.output.try_send(request) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "admission channel full",
                mpsc::error::TrySendError::Closed(_) => "admission channel closed",
            };
            self.failed_schedules.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("⚠️ Schedule {} could not produce an execution: {}", id, reason);
            self.events.emit(OrchestratorEvent::ScheduleError {
                schedule_id: id.to_string(),
                error: reason.to_string(),
            });

            if let FireSource::Timer { .. } = source {
                let due = entry.schedule.next_execution.unwrap_or(now);
                entry.schedule.next_execution = entry.compute_next(due.max(now));
                if entry.schedule.next_execution.is_none() {
                    if let Some(entry) = schedules.remove(id) {
                        self.finish(entry, source);
                    }
                    return Ok(FireOutcome::Finished);
                }
                return Ok(FireOutcome::Stale);
            }
            return Err(OrchestratorError::Schedule(format!(
                "schedule {} could not produce an execution: {}",
                id, reason
            )));
        }

        entry.schedule.execution_count += 1;
        entry.schedule.last_execution = Some(now);
        self.total_fired.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "🔔 Schedule {} fired execution {} ({} so far)",
            id,
            execution_id,
            entry.schedule.execution_count
        );
        self.events.emit(OrchestratorEvent::ScheduleFired {
            schedule_id: id.to_string(),
            execution_id: execution_id.clone(),
            fire_count: entry.schedule.execution_count,
        });

        if let FireSource::Timer { .. } = source {
            // never fire twice for the same due time if the clock reads slightly early
            let due = entry.schedule.next_execution.unwrap_or(now);
            entry.schedule.next_execution = entry.compute_next(due.max(now));
        }

        if entry.budget_spent() || entry.schedule.next_execution.is_none() {
            if let Some(entry) = schedules.remove(id) {
                self.finish(entry, source);
            }
        }
        Ok(FireOutcome::Produced(execution_id))
    }

    /// Self-termination after the fire budget or end date is reached
    fn finish(&self, entry: ScheduleEntry, source: FireSource) {
        if let Some(timer) = entry.timer {
            // a timer finishing its own schedule exits by itself
            if source == FireSource::Manual {
                timer.abort();
            }
        }
        tracing::info!(
            "🏁 Schedule {} completed after {} executions",
            entry.schedule.id,
            entry.schedule.execution_count
        );
        self.events.emit(OrchestratorEvent::ScheduleCompleted {
            schedule_id: entry.schedule.id,
            fire_count: entry.schedule.execution_count,
        });
    }
}

async fn run_timer(scheduler: Weak<SchedulerInner>, id: String, generation: u64) {
    loop {
        let next = {
            let Some(inner) = scheduler.upgrade() else {
                return;
            };
            let schedules = inner.schedules.read().await;
            match schedules.get(&id) {
                Some(entry) if entry.generation == generation => entry.schedule.next_execution,
                _ => return,
            }
        };
        let Some(next) = next else {
            return;
        };

        let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(delay).await;

        let Some(inner) = scheduler.upgrade() else {
            return;
        };
        match inner.fire(&id, FireSource::Timer { generation }).await {
            Ok(FireOutcome::Produced(_)) | Ok(FireOutcome::Stale) => {}
            Ok(FireOutcome::Finished) | Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OrchestrationConfig, QueueConfig, RetryConfig};
    use crate::events::{ChannelSink, NoopSink};
    use crate::workflow::EngineType;
    use serde_json::json;

    fn config() -> OrchestrationConfig {
        OrchestrationConfig {
            max_concurrent_executions: 4,
            default_timeout: Duration::from_secs(30),
            retry: RetryConfig {
                max_attempts: 2,
                initial_delay: Duration::from_millis(10),
                backoff_factor: 2.0,
            },
            queue: QueueConfig {
                max_queue_size: 10,
                processing_interval: Duration::from_millis(10),
                shutdown_grace_period: Duration::from_secs(1),
            },
            history_limit: 10,
        }
    }

    fn workflow() -> Arc<WorkflowDefinition> {
        Arc::new(WorkflowDefinition::new("nightly", "Nightly report", EngineType::Local))
    }

    fn scheduler(capacity: usize) -> (ExecutionScheduler, mpsc::Receiver<ExecutionRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ExecutionScheduler::new(&config(), tx, Arc::new(NoopSink)), rx)
    }

    #[tokio::test]
    async fn invalid_cron_creates_nothing() {
        let (scheduler, _rx) = scheduler(4);
        let err = scheduler
            .schedule_workflow(workflow(), ScheduleConfig::new("61 * * * *"), json!({}), "ops")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidCronExpression { .. }));
        assert_eq!(scheduler.stats().await.total_schedules, 0);

        let err = scheduler
            .schedule_workflow(
                workflow(),
                ScheduleConfig::new("0 * * * *").with_timezone("Mars/Olympus"),
                json!({}),
                "ops",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTimezone(_)));
    }

    #[tokio::test]
    async fn max_executions_self_terminates() {
        let (scheduler, mut rx) = scheduler(4);
        let id = scheduler
            .schedule_workflow(
                workflow(),
                ScheduleConfig::new("0 0 1 1 *").with_max_executions(2).with_priority(Priority::High),
                json!({"region": "eu"}),
                "ops",
            )
            .await
            .unwrap();

        scheduler.trigger_scheduled_workflow(&id).await.unwrap();
        scheduler.trigger_scheduled_workflow(&id).await.unwrap();
        let err = scheduler.trigger_scheduled_workflow(&id).await.unwrap_err();
        assert!(err.to_string().contains("Scheduled workflow not found"));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(first.priority, Priority::High);
        assert_eq!(first.parameters, json!({"region": "eu"}));
        assert_eq!(first.schedule_id.as_deref(), Some(id.as_str()));
        assert_eq!(first.max_retries, 2);
        assert!(rx.try_recv().is_err());
        assert_eq!(scheduler.stats().await.total_fired, 2);
    }

    #[tokio::test]
    async fn timer_fires_every_second() {
        let (scheduler, mut rx) = scheduler(8);
        scheduler.start().await.unwrap();
        let id = scheduler
            .schedule_workflow(
                workflow(),
                ScheduleConfig::new("* * * * * *").with_max_executions(2),
                json!({}),
                "ops",
            )
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.unwrap().unwrap();
        assert_ne!(first.id, second.id);

        // budget spent: removed without a third fire
        assert!(scheduler.get_schedule(&id).await.is_none());
        assert!(tokio::time::timeout(Duration::from_millis(1500), rx.recv()).await.is_err());
        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn running_timer_stops_once_end_date_passes() {
        let (tx, mut rx) = mpsc::channel(8);
        let (sink, mut events) = ChannelSink::channel();
        let scheduler = ExecutionScheduler::new(&config(), tx, Arc::new(sink));
        scheduler.start().await.unwrap();
        let id = scheduler
            .schedule_workflow(
                workflow(),
                ScheduleConfig::new("* * * * * *").with_end_date(Utc::now() + chrono::Duration::milliseconds(1500)),
                json!({}),
                "ops",
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(scheduler.get_schedule(&id).await.is_none());

        let mut fired = 0;
        while rx.try_recv().is_ok() {
            fired += 1;
        }
        assert!((1..=2).contains(&fired), "fired {} times", fired);
        assert!(tokio::time::timeout(Duration::from_millis(1200), rx.recv()).await.is_err());

        let mut completed = None;
        while let Ok(event) = events.try_recv() {
            if let OrchestratorEvent::ScheduleCompleted { schedule_id, fire_count } = event {
                completed = Some((schedule_id, fire_count));
            }
        }
        assert_eq!(completed, Some((id, fired)));
        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn full_output_counts_failure_and_emits_error() {
        let (tx, _rx) = mpsc::channel(1);
        let (sink, mut events) = ChannelSink::channel();
        let scheduler = ExecutionScheduler::new(&config(), tx, Arc::new(sink));
        let id = scheduler
            .schedule_workflow(workflow(), ScheduleConfig::new("@daily"), json!({}), "ops")
            .await
            .unwrap();

        scheduler.trigger_scheduled_workflow(&id).await.unwrap();
        let err = scheduler.trigger_scheduled_workflow(&id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Schedule(_)));

        let stats = scheduler.stats().await;
        assert_eq!(stats.failed_schedules, 1);
        assert_eq!(stats.total_fired, 1);

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, OrchestratorEvent::ScheduleError { .. }) {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn update_preserves_count_and_rearms_on_cron_change() {
        let (scheduler, _rx) = scheduler(4);
        scheduler.start().await.unwrap();
        let id = scheduler
            .schedule_workflow(workflow(), ScheduleConfig::new("0 0 1 1 *"), json!({}), "ops")
            .await
            .unwrap();
        scheduler.trigger_scheduled_workflow(&id).await.unwrap();
        let before = scheduler.get_schedule(&id).await.unwrap();

        let updated = scheduler
            .update_schedule(
                &id,
                ScheduleUpdate {
                    cron_expression: Some("*/5 * * * *".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(updated);

        let after = scheduler.get_schedule(&id).await.unwrap();
        assert_eq!(after.execution_count, 1);
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.config.cron_expression, "*/5 * * * *");
        assert!(after.next_execution.unwrap() <= Utc::now() + chrono::Duration::minutes(5));

        let err = scheduler
            .update_schedule(
                &id,
                ScheduleUpdate {
                    cron_expression: Some("bogus".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidCronExpression { .. }));
        assert!(!scheduler.update_schedule("missing", ScheduleUpdate::default()).await.unwrap());
        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn toggle_and_unschedule() {
        let (scheduler, _rx) = scheduler(4);
        let id = scheduler
            .schedule_workflow(workflow(), ScheduleConfig::new("@hourly"), json!({}), "ops")
            .await
            .unwrap();

        assert!(scheduler.get_next_execution_time(&id).await.is_some());
        assert!(scheduler.toggle_schedule(&id, false).await);
        assert!(scheduler.get_next_execution_time(&id).await.is_none());
        assert_eq!(scheduler.stats().await.enabled_schedules, 0);
        assert!(scheduler.toggle_schedule(&id, true).await);
        assert!(!scheduler.toggle_schedule("missing", true).await);

        assert!(scheduler.unschedule_workflow(&id).await);
        assert!(!scheduler.unschedule_workflow(&id).await);
        assert!(scheduler.list_schedules().await.is_empty());
    }

    #[tokio::test]
    async fn end_date_in_past_is_rejected() {
        let (scheduler, _rx) = scheduler(4);
        let err = scheduler
            .schedule_workflow(
                workflow(),
                ScheduleConfig::new("@hourly").with_end_date(Utc::now() - chrono::Duration::days(1)),
                json!({}),
                "ops",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Schedule(_)));
    }
}
