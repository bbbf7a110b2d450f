/// Typed event emission
///
/// Components receive an `EventSink` at construction and emit fire-and-forget
/// events through it. Sinks never block and never fail the emitter: a full or
/// closed channel simply drops the event.

use crate::error::ExecutionError;
use crate::execution::{ExecutionResult, Priority};
use crate::runtime::autoscaler::ScalingDecision;
use crate::runtime::metrics::PoolMetrics;
use crate::workflow::EngineType;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Events emitted by the queue, scheduler, worker pool and orchestration engine
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    ExecutionQueued {
        execution_id: String,
        workflow_id: String,
        priority: Priority,
    },
    ExecutionStarted {
        execution_id: String,
        workflow_id: String,
        engine_type: EngineType,
        submitted_by: String,
        parameters: Value,
        attempt: u32,
        timeout_ms: u64,
    },
    ExecutionRetrying {
        execution_id: String,
        attempt: u32,
        delay_ms: u64,
        error: ExecutionError,
    },
    ExecutionCompleted {
        execution_id: String,
        workflow_id: String,
        result: ExecutionResult,
    },
    ExecutionFailed {
        execution_id: String,
        workflow_id: String,
        result: ExecutionResult,
    },
    ExecutionCancelled {
        execution_id: String,
    },
    ScheduleCreated {
        schedule_id: String,
        workflow_id: String,
    },
    ScheduleFired {
        schedule_id: String,
        execution_id: String,
        fire_count: u64,
    },
    ScheduleCompleted {
        schedule_id: String,
        fire_count: u64,
    },
    ScheduleError {
        schedule_id: String,
        error: String,
    },
    WorkerStarted {
        worker_id: String,
    },
    WorkerStopped {
        worker_id: String,
    },
    WorkerFailed {
        worker_id: String,
        rescheduled: usize,
    },
    ScalingCompleted {
        decision: ScalingDecision,
        worker_count: usize,
    },
    MetricsUpdated {
        metrics: PoolMetrics,
    },
    CapacityShortage {
        worker_count: usize,
        min_workers: usize,
    },
}

impl OrchestratorEvent {
    /// Stable event name used by external subscribers
    pub fn name(&self) -> &'static str {
        match self {
            OrchestratorEvent::ExecutionQueued { .. } => "executionQueued",
            OrchestratorEvent::ExecutionStarted { .. } => "executionStarted",
            OrchestratorEvent::ExecutionRetrying { .. } => "executionRetrying",
            OrchestratorEvent::ExecutionCompleted { .. } => "executionCompleted",
            OrchestratorEvent::ExecutionFailed { .. } => "executionFailed",
            OrchestratorEvent::ExecutionCancelled { .. } => "executionCancelled",
            OrchestratorEvent::ScheduleCreated { .. } => "scheduleCreated",
            OrchestratorEvent::ScheduleFired { .. } => "scheduleFired",
            OrchestratorEvent::ScheduleCompleted { .. } => "scheduleCompleted",
            OrchestratorEvent::ScheduleError { .. } => "scheduleError",
            OrchestratorEvent::WorkerStarted { .. } => "worker_started",
            OrchestratorEvent::WorkerStopped { .. } => "worker_stopped",
            OrchestratorEvent::WorkerFailed { .. } => "worker_failed",
            OrchestratorEvent::ScalingCompleted { .. } => "scaling_completed",
            OrchestratorEvent::MetricsUpdated { .. } => "metrics_updated",
            OrchestratorEvent::CapacityShortage { .. } => "capacity_shortage",
        }
    }

    /// Execution id the event refers to, if any
    pub fn execution_id(&self) -> Option<&str> {
        match self {
            OrchestratorEvent::ExecutionQueued { execution_id, .. }
            | OrchestratorEvent::ExecutionStarted { execution_id, .. }
            | OrchestratorEvent::ExecutionRetrying { execution_id, .. }
            | OrchestratorEvent::ExecutionCompleted { execution_id, .. }
            | OrchestratorEvent::ExecutionFailed { execution_id, .. }
            | OrchestratorEvent::ExecutionCancelled { execution_id }
            | OrchestratorEvent::ScheduleFired { execution_id, .. } => Some(execution_id.as_str()),
            _ => None,
        }
    }
}

/// Destination for emitted events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: OrchestratorEvent);
}

pub type SharedSink = Arc<dyn EventSink>;

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: OrchestratorEvent) {}
}

/// Forwards events into an unbounded mpsc channel (component → owner wiring)
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<OrchestratorEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<OrchestratorEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink together with its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: OrchestratorEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event receiver dropped, discarding event");
        }
    }
}

/// Fan-out sink for external subscribers; slow subscribers lag instead of blocking
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: OrchestratorEvent) {
        // Err only means nobody is subscribed right now
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::channel();
        sink.emit(OrchestratorEvent::WorkerStarted { worker_id: "w1".into() });
        sink.emit(OrchestratorEvent::WorkerStopped { worker_id: "w1".into() });

        assert_eq!(rx.recv().await.unwrap().name(), "worker_started");
        assert_eq!(rx.recv().await.unwrap().name(), "worker_stopped");
    }

    #[test]
    fn emitting_without_receivers_never_fails() {
        let (sink, rx) = ChannelSink::channel();
        drop(rx);
        sink.emit(OrchestratorEvent::ExecutionCancelled { execution_id: "x".into() });

        let broadcast = BroadcastSink::new(4);
        broadcast.emit(OrchestratorEvent::ExecutionCancelled { execution_id: "x".into() });
        assert_eq!(broadcast.subscriber_count(), 0);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = OrchestratorEvent::ScheduleError {
            schedule_id: "s1".into(),
            error: "bad".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "schedule_error");
        assert_eq!(event.execution_id(), None);
    }
}
