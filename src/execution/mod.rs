/// Execution Model
///
/// Request/result records exchanged between submitters, the queue, the worker
/// pool and engine adapters, plus the mutable per-execution context.

// Immutable submission record, lifecycle status and result types
pub mod types;

// Mutable per-execution state owned by the orchestration engine
pub mod context;

pub use context::{ExecutionContext, ExecutionSnapshot, MAX_LOG_ENTRIES};
pub use types::{
    ExecutionLog, ExecutionMetrics, ExecutionRequest, ExecutionResult, ExecutionStatus, LogLevel,
    Priority,
};
