/// Mechaway Orchestrator: workflow execution orchestration for pluggable automation engines
///
/// This library admits workflow-execution requests under capacity limits, runs
/// them through engine adapters with retry and backoff, schedules recurring
/// executions from cron expressions, and keeps an auto-scaling pool of logical
/// workers healthy.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by every layer
pub mod error;

// Typed events and sinks - the only channel to external observers
pub mod events;

// Workflow definition layer - engine-agnostic definitions and DAG view
pub mod workflow;

// Execution model - requests, results and per-execution contexts
pub mod execution;

// Engine adapter layer - pluggable engines, registry and dispatch path
pub mod adapter;

// Orchestration runtime - queue, scheduler, worker pool and façade
pub mod runtime;

// Re-export commonly used types for external consumers
pub use adapter::{EngineAdapter, LocalAdapter};
pub use config::Config;
pub use error::{ErrorCode, ExecutionError, OrchestratorError};
pub use events::{EventSink, OrchestratorEvent};
pub use execution::{ExecutionRequest, ExecutionResult, ExecutionStatus, Priority};
pub use runtime::{OrchestrationEngine, ScheduleConfig, ScheduleResult};
pub use workflow::{EngineType, WorkflowDefinition};
