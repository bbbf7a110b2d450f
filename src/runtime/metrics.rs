/// Worker pool metrics
///
/// The collector keeps recent completions for windowed aggregation and a history
/// of periodic `PoolMetrics` snapshots, both trimmed to the retention period.

use crate::config::MetricsConfig;
use crate::runtime::autoscaler::utilization;
use crate::runtime::worker::{WorkerInfo, WorkerStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// Point-in-time view of the pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub timestamp: DateTime<Utc>,
    pub total_workers: usize,
    pub workers_by_status: BTreeMap<WorkerStatus, usize>,
    pub total_capacity: usize,
    pub active_executions: usize,
    pub pending_executions: usize,
    pub utilization: f64,
    pub completed_in_window: u64,
    pub failed_in_window: u64,
    pub throughput_per_minute: f64,
    pub average_duration_ms: f64,
    /// Fewer serving workers than the configured minimum
    pub capacity_shortage: bool,
}

#[derive(Debug, Clone, Copy)]
struct Completion {
    at: Instant,
    duration: Duration,
    success: bool,
}

#[derive(Debug)]
pub struct MetricsCollector {
    config: MetricsConfig,
    completions: VecDeque<Completion>,
    history: VecDeque<(Instant, PoolMetrics)>,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            completions: VecDeque::new(),
            history: VecDeque::new(),
        }
    }

    pub fn record_completion(&mut self, at: Instant, duration: Duration, success: bool) {
        self.completions.push_back(Completion { at, duration, success });
    }

    /// Aggregate a snapshot from the current worker table and pending count
    pub fn snapshot(&self, now: Instant, workers: &[WorkerInfo], pending: usize, min_workers: usize) -> PoolMetrics {
        let mut workers_by_status = BTreeMap::new();
        let mut total_capacity = 0;
        let mut active = 0;
        let mut serving = 0;
        for worker in workers {
            *workers_by_status.entry(worker.status).or_insert(0) += 1;
            active += worker.current_load;
            if !matches!(worker.status, WorkerStatus::Unhealthy | WorkerStatus::Stopped) {
                serving += 1;
                total_capacity += worker.capacity;
            }
        }

        let window = self.config.aggregation_window;
        let recent: Vec<&Completion> = self
            .completions
            .iter()
            .filter(|c| now.saturating_duration_since(c.at) <= window)
            .collect();
        let completed = recent.iter().filter(|c| c.success).count() as u64;
        let failed = recent.len() as u64 - completed;
        let average_duration_ms = if recent.is_empty() {
            0.0
        } else {
            recent.iter().map(|c| c.duration.as_secs_f64() * 1000.0).sum::<f64>() / recent.len() as f64
        };
        let window_minutes = (window.as_secs_f64() / 60.0).max(f64::EPSILON);

        PoolMetrics {
            timestamp: Utc::now(),
            total_workers: workers.len(),
            workers_by_status,
            total_capacity,
            active_executions: active,
            pending_executions: pending,
            utilization: utilization(pending, active, total_capacity),
            completed_in_window: completed,
            failed_in_window: failed,
            throughput_per_minute: recent.len() as f64 / window_minutes,
            average_duration_ms,
            capacity_shortage: serving < min_workers,
        }
    }

    pub fn push(&mut self, now: Instant, metrics: PoolMetrics) {
        self.history.push_back((now, metrics));
        self.prune(now);
    }

    /// Drop samples and completions older than the retention period
    pub fn prune(&mut self, now: Instant) {
        let retention = self.config.retention_period;
        let keep_completions = retention.max(self.config.aggregation_window);
        while self
            .completions
            .front()
            .is_some_and(|c| now.saturating_duration_since(c.at) > keep_completions)
        {
            self.completions.pop_front();
        }
        while self
            .history
            .front()
            .is_some_and(|(at, _)| now.saturating_duration_since(*at) > retention)
        {
            self.history.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&PoolMetrics> {
        self.history.back().map(|(_, metrics)| metrics)
    }

    pub fn history(&self) -> Vec<PoolMetrics> {
        self.history.iter().map(|(_, metrics)| metrics.clone()).collect()
    }

    pub fn retention_period(&self) -> Duration {
        self.config.retention_period
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::EngineType;

    fn collector() -> MetricsCollector {
        MetricsCollector::new(MetricsConfig {
            collection_interval: Duration::from_secs(1),
            aggregation_window: Duration::from_secs(60),
            retention_period: Duration::from_secs(120),
        })
    }

    fn info(status: WorkerStatus, load: usize) -> WorkerInfo {
        WorkerInfo {
            id: format!("w-{:?}-{}", status, load),
            status,
            current_load: load,
            capacity: 5,
            supported_engines: vec![EngineType::Local],
            active_executions: Vec::new(),
            started_at: Utc::now(),
            last_heartbeat: Utc::now(),
            total_executions: 0,
            total_failures: 0,
            average_duration_ms: 0.0,
        }
    }

    #[test]
    fn snapshot_aggregates_window() {
        let mut c = collector();
        let now = Instant::now();
        c.record_completion(now, Duration::from_millis(100), true);
        c.record_completion(now, Duration::from_millis(300), false);

        let workers = vec![info(WorkerStatus::Idle, 2), info(WorkerStatus::Busy, 5), info(WorkerStatus::Unhealthy, 0)];
        let m = c.snapshot(now, &workers, 3, 2);
        assert_eq!(m.total_workers, 3);
        assert_eq!(m.total_capacity, 10);
        assert_eq!(m.active_executions, 7);
        assert_eq!(m.utilization, 1.0);
        assert_eq!(m.completed_in_window, 1);
        assert_eq!(m.failed_in_window, 1);
        assert!((m.average_duration_ms - 200.0).abs() < 1e-6);
        assert!((m.throughput_per_minute - 2.0).abs() < 1e-6);
        assert!(!m.capacity_shortage);
        assert_eq!(m.workers_by_status.get(&WorkerStatus::Unhealthy), Some(&1));
    }

    #[test]
    fn flags_capacity_shortage() {
        let c = collector();
        let m = c.snapshot(Instant::now(), &[info(WorkerStatus::Idle, 0)], 0, 2);
        assert!(m.capacity_shortage);
    }

    #[test]
    fn prunes_by_retention() {
        let mut c = collector();
        let t0 = Instant::now();
        let m = c.snapshot(t0, &[], 0, 0);
        c.push(t0, m.clone());
        c.push(t0 + Duration::from_secs(100), m.clone());
        assert_eq!(c.history().len(), 2);

        c.push(t0 + Duration::from_secs(130), m);
        assert_eq!(c.history().len(), 2);
        assert!(c.latest().is_some());
    }
}
