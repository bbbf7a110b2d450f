/// Orchestration Runtime
///
/// This module holds the concurrent machinery of the orchestration core:
/// - Priority admission buffer and the bounded-dispatch execution queue
/// - Cron parsing and the recurring execution scheduler
/// - Logical workers, autoscaling decisions, pool metrics and the worker pool
/// - Retry backoff and per-engine circuit breaking
/// - The orchestration engine façade wiring all of the above to engine adapters

// Bounded priority buffer shared by the queue and the pool
pub mod buffer;

// Priority admission queue with retry and backoff
pub mod queue;

// Internal cron expression parser and timezone handling
pub mod cron;

// Recurring schedules producing admission candidates
pub mod scheduler;

// Backoff computation and circuit breaker
pub mod retry;

// Logical capacity units with heartbeats
pub mod worker;

// Scaling decision logic
pub mod autoscaler;

// Pool metrics snapshots and history
pub mod metrics;

// Auto-scaling worker pool with health monitoring
pub mod pool;

// Façade over queue, scheduler, pool and adapters
pub mod engine;

// Re-export main types
pub use autoscaler::{Autoscaler, ScalingAction, ScalingDecision};
pub use cron::{CronExpression, ScheduleTimezone};
pub use engine::{OrchestrationEngine, ScheduleResult};
pub use metrics::PoolMetrics;
pub use pool::WorkerPool;
pub use queue::{ExecutionQueue, QueueStats};
pub use retry::CircuitState;
pub use scheduler::{ExecutionScheduler, ScheduleConfig, ScheduleUpdate, ScheduledWorkflow, SchedulerStats};
pub use worker::{WorkerInfo, WorkerStatus};
