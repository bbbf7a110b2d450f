/// Retry backoff and per-engine circuit breaking
///
/// Backoff grows geometrically from a base delay. The circuit breaker trips after
/// a run of consecutive failures, rejects calls while open, and lets a single
/// trial call through once the reset timeout has elapsed. A trial that never reports
/// back (its caller was aborted) is abandoned, or re-issued once it has been
/// outstanding for a full reset timeout.

use crate::config::CircuitBreakerConfig;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Upper bound on any computed backoff
const MAX_BACKOFF: Duration = Duration::from_secs(3600);

/// `base * factor^exponent`, capped at one hour
pub fn backoff_delay(base: Duration, factor: f64, exponent: u32) -> Duration {
    let multiplier = factor.max(0.0).powi(exponent.min(i32::MAX as u32) as i32);
    let nanos = base.as_nanos() as f64 * multiplier;
    if !nanos.is_finite() || nanos >= MAX_BACKOFF.as_nanos() as f64 {
        return MAX_BACKOFF;
    }
    Duration::from_nanos(nanos.max(0.0).round() as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Verdict of `CircuitBreaker::allow`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Rejected,
    Allowed,
    /// The single half-open trial call; its outcome must be recorded or abandoned
    Trial,
}

impl Admission {
    pub fn is_allowed(self) -> bool {
        self != Admission::Rejected
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_started_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_started_at: None,
        }
    }

    /// Whether a call may proceed right now
    pub fn allow(&mut self, now: Instant) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let elapsed = self.opened_at.map(|at| now.duration_since(at)).unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    self.state = CircuitState::HalfOpen;
                    self.trial_started_at = Some(now);
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => match self.trial_started_at {
                Some(started) if now.duration_since(started) < self.config.reset_timeout => Admission::Rejected,
                Some(_) => {
                    tracing::warn!("⚡ Half-open trial call never reported back, issuing another");
                    self.trial_started_at = Some(now);
                    Admission::Trial
                }
                None => {
                    self.trial_started_at = Some(now);
                    Admission::Trial
                }
            },
        }
    }

    /// Give the trial slot back without a verdict; the next call becomes the trial
    pub fn abandon_trial(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.trial_started_at = None;
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.trial_started_at = None;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures += 1;
        self.trial_started_at = None;
        let threshold = self.config.failure_threshold.max(1);
        if self.state == CircuitState::HalfOpen || self.consecutive_failures >= threshold {
            if self.state != CircuitState::Open {
                tracing::warn!(
                    "⚡ Circuit opened after {} consecutive failures",
                    self.consecutive_failures
                );
            }
            self.state = CircuitState::Open;
            self.opened_at = Some(now);
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_geometrically() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 2.0, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2.0, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 2.0, 3), Duration::from_millis(800));
        assert_eq!(backoff_delay(base, 1.0, 5), base);
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff_delay(Duration::from_secs(1), 10.0, 400), MAX_BACKOFF);
        assert_eq!(backoff_delay(Duration::from_secs(1), f64::INFINITY, 2), MAX_BACKOFF);
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_millis(100),
        })
    }

    #[test]
    fn opens_after_threshold_and_half_opens_after_timeout() {
        let mut cb = breaker();
        let t0 = Instant::now();

        assert_eq!(cb.allow(t0), Admission::Allowed);
        cb.record_failure(t0);
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(t0);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.allow(t0 + Duration::from_millis(50)), Admission::Rejected);

        // one trial call after the reset timeout, further calls wait for it
        let later = t0 + Duration::from_millis(150);
        assert_eq!(cb.allow(later), Admission::Trial);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.allow(later), Admission::Rejected);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.allow(later), Admission::Allowed);
    }

    #[test]
    fn failed_trial_reopens() {
        let mut cb = breaker();
        let t0 = Instant::now();
        cb.record_failure(t0);
        cb.record_failure(t0);

        let trial_at = t0 + Duration::from_millis(120);
        assert_eq!(cb.allow(trial_at), Admission::Trial);
        cb.record_failure(trial_at);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.allow(trial_at + Duration::from_millis(10)), Admission::Rejected);
    }

    #[test]
    fn abandoned_trial_frees_the_slot() {
        let mut cb = breaker();
        let t0 = Instant::now();
        cb.record_failure(t0);
        cb.record_failure(t0);

        let trial_at = t0 + Duration::from_millis(120);
        assert_eq!(cb.allow(trial_at), Admission::Trial);
        assert_eq!(cb.allow(trial_at), Admission::Rejected);

        cb.abandon_trial();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.allow(trial_at), Admission::Trial);
    }

    #[test]
    fn silent_trial_is_reissued_after_reset_timeout() {
        let mut cb = breaker();
        let t0 = Instant::now();
        cb.record_failure(t0);
        cb.record_failure(t0);

        let trial_at = t0 + Duration::from_millis(120);
        assert_eq!(cb.allow(trial_at), Admission::Trial);
        assert_eq!(cb.allow(trial_at + Duration::from_millis(50)), Admission::Rejected);
        assert_eq!(cb.allow(trial_at + Duration::from_millis(100)), Admission::Trial);
    }
}
