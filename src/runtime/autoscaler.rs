/// Autoscaling decisions
///
/// Pure decision logic for the pool's scaling control loop. Utilization is
/// `(queued + active) / total_capacity`. Above the scale-up threshold the pool
/// grows to `ceil(1.5 * n)`; below the scale-down threshold it shrinks to
/// `floor(0.8 * n)`. Targets are clamped to `[min_workers, max_workers]` and each
/// direction is suppressed while its cooldown since the last scaling action runs.
///
/// Scale-up always adds at least one worker. Plain `ceil(1.5 * 0)` is zero, so
/// with `min_workers == 0` an empty pool would otherwise never grow back under
/// load.

use crate::config::ScalingConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    NoAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScalingDecision {
    pub action: ScalingAction,
    pub target_workers: usize,
    pub current_workers: usize,
    pub reason: String,
    /// In `[0, 1]`
    pub confidence: f64,
    pub utilization: f64,
    pub timestamp: DateTime<Utc>,
}

impl ScalingDecision {
    fn new(action: ScalingAction, current: usize, target: usize, utilization: f64, confidence: f64, reason: String) -> Self {
        Self {
            action,
            target_workers: target,
            current_workers: current,
            reason,
            confidence: confidence.clamp(0.0, 1.0),
            utilization,
            timestamp: Utc::now(),
        }
    }

    fn hold(current: usize, utilization: f64, confidence: f64, reason: impl Into<String>) -> Self {
        Self::new(ScalingAction::NoAction, current, current, utilization, confidence, reason.into())
    }

    /// Workers to add (positive) or remove (negative)
    pub fn delta(&self) -> i64 {
        self.target_workers as i64 - self.current_workers as i64
    }
}

/// Utilization of the pool; saturated when there is demand but no capacity
pub fn utilization(queued: usize, active: usize, total_capacity: usize) -> f64 {
    let demand = (queued + active) as f64;
    if total_capacity == 0 {
        return if demand > 0.0 { 1.0 } else { 0.0 };
    }
    demand / total_capacity as f64
}

#[derive(Debug)]
pub struct Autoscaler {
    config: ScalingConfig,
    last_scaling: Option<Instant>,
}

impl Autoscaler {
    pub fn new(config: ScalingConfig) -> Self {
        Self {
            config,
            last_scaling: None,
        }
    }

    pub fn config(&self) -> &ScalingConfig {
        &self.config
    }

    pub fn evaluate(&self, current: usize, utilization: f64, now: Instant) -> ScalingDecision {
        let cfg = &self.config;
        let min = cfg.min_workers;
        let max = cfg.max_workers.max(min);

        // bounds repair ignores utilization and cooldowns
        if current < min {
            return ScalingDecision::new(
                ScalingAction::ScaleUp,
                current,
                min,
                utilization,
                1.0,
                format!("{} workers below minimum of {}", current, min),
            );
        }
        if current > max {
            return ScalingDecision::new(
                ScalingAction::ScaleDown,
                current,
                max,
                utilization,
                1.0,
                format!("{} workers above maximum of {}", current, max),
            );
        }

        if utilization > cfg.scale_up_threshold && current < max {
            if self.in_cooldown(cfg.scale_up_cooldown, now) {
                return ScalingDecision::hold(current, utilization, 0.5, "cooldown active");
            }
            let grown = ((current as f64) * 1.5).ceil() as usize;
            let target = grown.max(current + 1).min(max);
            let confidence = 0.5 + (utilization - cfg.scale_up_threshold) / cfg.scale_up_threshold.max(f64::EPSILON);
            return ScalingDecision::new(
                ScalingAction::ScaleUp,
                current,
                target,
                utilization,
                confidence,
                format!(
                    "utilization {:.2} above scale-up threshold {:.2}",
                    utilization, cfg.scale_up_threshold
                ),
            );
        }

        if utilization < cfg.scale_down_threshold && current > min {
            if self.in_cooldown(cfg.scale_down_cooldown, now) {
                return ScalingDecision::hold(current, utilization, 0.5, "cooldown active");
            }
            let shrunk = ((current as f64) * 0.8).floor() as usize;
            let target = shrunk.min(current - 1).max(min);
            let confidence = 0.5 + (cfg.scale_down_threshold - utilization) / cfg.scale_down_threshold.max(f64::EPSILON);
            return ScalingDecision::new(
                ScalingAction::ScaleDown,
                current,
                target,
                utilization,
                confidence,
                format!(
                    "utilization {:.2} below scale-down threshold {:.2}",
                    utilization, cfg.scale_down_threshold
                ),
            );
        }

        let distance = (utilization - cfg.target_utilization).abs();
        ScalingDecision::hold(
            current,
            utilization,
            1.0 - distance,
            format!("utilization {:.2} within thresholds", utilization),
        )
    }

    /// Start the cooldown clock after a scaling action was carried out
    pub fn record(&mut self, decision: &ScalingDecision, now: Instant) {
        if decision.action != ScalingAction::NoAction {
            self.last_scaling = Some(now);
        }
    }

    fn in_cooldown(&self, cooldown: Duration, now: Instant) -> bool {
        self.last_scaling
            .is_some_and(|at| now.saturating_duration_since(at) < cooldown)
    }
}
