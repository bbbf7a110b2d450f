/// Configuration management for the orchestration core
///
/// Construction-time settings for the execution queue, scheduler, worker pool and
/// autoscaler. Defaults read `MECHAWAY_*` environment variables so container
/// deployments can tune limits without code changes. Nothing here is hot-reloaded:
/// components copy what they need when they are built.

use crate::workflow::EngineType;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Façade, queue and retry configuration
    pub orchestration: OrchestrationConfig,
    /// Worker pool, autoscaling and fault tolerance configuration
    pub execution_service: ExecutionServiceConfig,
}

/// Configuration for the orchestration façade and its execution queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// Upper bound on concurrently dispatched executions
    pub max_concurrent_executions: usize,
    /// Timeout applied to requests that don't carry their own
    pub default_timeout: Duration,
    /// Backoff policy for retryable failures, applied by the queue
    pub retry: RetryConfig,
    /// Admission buffer bounds and dispatch cadence
    pub queue: QueueConfig,
    /// Number of terminal results kept queryable after eviction from the live table
    pub history_limit: usize,
}

/// Queue-level retry policy for retryable execution failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of re-submissions after the first attempt
    pub max_attempts: u32,
    /// Delay before the first re-submission
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each attempt
    pub backoff_factor: f64,
}

/// Admission buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Pending requests admitted before `enqueue` reports `QueueFull`
    pub max_queue_size: usize,
    /// Dispatch loop tick
    pub processing_interval: Duration,
    /// How long `stop()` waits for active executions to drain
    pub shutdown_grace_period: Duration,
}

/// Configuration for the auto-scaling worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionServiceConfig {
    /// Worker-count bounds and autoscaling policy
    pub scaling: ScalingConfig,
    /// Per-call retries and per-engine circuit breaking
    pub fault_tolerance: FaultToleranceConfig,
    /// Pool metrics sampling
    pub metrics: MetricsConfig,
    /// Template for every worker the pool starts
    pub worker: WorkerConfig,
    /// Assignment loop tick
    pub dispatch_interval: Duration,
    /// Maximum number of requests waiting for a worker
    pub max_pending: usize,
    /// How long stop and scale-down wait for in-flight work to drain
    pub shutdown_grace_period: Duration,
}

/// Autoscaling bounds, thresholds and cooldowns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfig {
    /// Floor kept by scale-down, idle retirement and worker replacement
    pub min_workers: usize,
    /// Ceiling for scale-up
    pub max_workers: usize,
    /// Utilization the pool aims for; sets the confidence of a hold decision
    pub target_utilization: f64,
    /// Utilization above which the pool grows
    pub scale_up_threshold: f64,
    /// Utilization below which the pool shrinks
    pub scale_down_threshold: f64,
    /// Minimum time between a scaling action and the next scale-up
    pub scale_up_cooldown: Duration,
    /// Minimum time between a scaling action and the next scale-down
    pub scale_down_cooldown: Duration,
    /// Time a freshly started worker spends in `Starting` before accepting work
    pub worker_startup_time: Duration,
    /// Autoscaling control loop tick
    pub evaluation_interval: Duration,
}

/// Retry and circuit-breaking policy for pooled executions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultToleranceConfig {
    /// In-worker retries after the first call
    pub max_retries: u32,
    /// Delay before the first in-worker retry
    pub retry_delay: Duration,
    pub backoff_factor: f64,
    pub circuit_breaker: CircuitBreakerConfig,
}

/// Per-engine circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a half-open trial call
    pub reset_timeout: Duration,
}

/// Pool metrics collection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Metrics control loop tick
    pub collection_interval: Duration,
    /// Window used for throughput and average-duration aggregation
    pub aggregation_window: Duration,
    /// How long samples and finished executions are retained
    pub retention_period: Duration,
}

/// Static configuration of a single logical worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent executions a worker accepts
    pub capacity: usize,
    /// Engine types the worker will be assigned
    pub supported_engines: Vec<EngineType>,
    /// Heartbeat period; a worker is stale after twice this without one
    pub health_check_interval: Duration,
    /// Empty workers idle longer than this are retired down to `min_workers`
    pub max_idle_time: Duration,
}

/// Read an environment variable and parse it, falling back on absence or parse failure
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Millisecond duration from an environment variable
fn env_ms(name: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_or(name, default_ms))
}

impl Default for OrchestrationConfig {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            max_concurrent_executions: env_or("MECHAWAY_MAX_CONCURRENT_EXECUTIONS", 10),
            default_timeout: env_ms("MECHAWAY_DEFAULT_TIMEOUT_MS", 300_000),
            retry: RetryConfig::default(),
            queue: QueueConfig::default(),
            history_limit: env_or("MECHAWAY_HISTORY_LIMIT", 1000),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: env_or("MECHAWAY_RETRY_MAX_ATTEMPTS", 3),
            initial_delay: env_ms("MECHAWAY_RETRY_INITIAL_DELAY_MS", 1_000),
            backoff_factor: env_or("MECHAWAY_RETRY_BACKOFF_FACTOR", 2.0),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: env_or("MECHAWAY_MAX_QUEUE_SIZE", 1000),
            processing_interval: env_ms("MECHAWAY_QUEUE_PROCESSING_INTERVAL_MS", 100),
            shutdown_grace_period: env_ms("MECHAWAY_QUEUE_SHUTDOWN_GRACE_MS", 30_000),
        }
    }
}

impl Default for ExecutionServiceConfig {
    fn default() -> Self {
        Self {
            scaling: ScalingConfig::default(),
            fault_tolerance: FaultToleranceConfig::default(),
            metrics: MetricsConfig::default(),
            worker: WorkerConfig::default(),
            dispatch_interval: env_ms("MECHAWAY_POOL_DISPATCH_INTERVAL_MS", 100),
            max_pending: env_or("MECHAWAY_POOL_MAX_PENDING", 1000),
            shutdown_grace_period: env_ms("MECHAWAY_POOL_SHUTDOWN_GRACE_MS", 30_000),
        }
    }
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_workers: env_or("MECHAWAY_MIN_WORKERS", 2),
            max_workers: env_or("MECHAWAY_MAX_WORKERS", 10),
            target_utilization: env_or("MECHAWAY_TARGET_UTILIZATION", 0.7),
            scale_up_threshold: env_or("MECHAWAY_SCALE_UP_THRESHOLD", 0.8),
            scale_down_threshold: env_or("MECHAWAY_SCALE_DOWN_THRESHOLD", 0.3),
            scale_up_cooldown: env_ms("MECHAWAY_SCALE_UP_COOLDOWN_MS", 60_000),
            scale_down_cooldown: env_ms("MECHAWAY_SCALE_DOWN_COOLDOWN_MS", 300_000),
            worker_startup_time: env_ms("MECHAWAY_WORKER_STARTUP_MS", 0),
            evaluation_interval: env_ms("MECHAWAY_SCALING_INTERVAL_MS", 30_000),
        }
    }
}

impl Default for FaultToleranceConfig {
    fn default() -> Self {
        Self {
            max_retries: env_or("MECHAWAY_POOL_MAX_RETRIES", 3),
            retry_delay: env_ms("MECHAWAY_POOL_RETRY_DELAY_MS", 1_000),
            backoff_factor: env_or("MECHAWAY_POOL_BACKOFF_FACTOR", 2.0),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: env_or("MECHAWAY_CIRCUIT_FAILURE_THRESHOLD", 5),
            reset_timeout: env_ms("MECHAWAY_CIRCUIT_RESET_TIMEOUT_MS", 60_000),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            collection_interval: env_ms("MECHAWAY_METRICS_INTERVAL_MS", 10_000),
            aggregation_window: env_ms("MECHAWAY_METRICS_WINDOW_MS", 60_000),
            retention_period: env_ms("MECHAWAY_METRICS_RETENTION_MS", 3_600_000),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let supported_engines = std::env::var("MECHAWAY_WORKER_ENGINES")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .filter_map(|engine| engine.parse::<EngineType>().ok())
                    .collect::<Vec<_>>()
            })
            .filter(|engines| !engines.is_empty())
            .unwrap_or_else(|| EngineType::all().to_vec());

        Self {
            capacity: env_or("MECHAWAY_WORKER_CAPACITY", 5),
            supported_engines,
            health_check_interval: env_ms("MECHAWAY_HEALTH_CHECK_INTERVAL_MS", 30_000),
            max_idle_time: env_ms("MECHAWAY_WORKER_MAX_IDLE_MS", 300_000),
        }
    }
}
