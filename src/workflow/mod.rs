/// Workflow Definition Layer
///
/// This module holds the engine-agnostic workflow model handed to engine adapters:
/// - Type definitions (WorkflowDefinition, Node, Edge, EngineType)
/// - Petgraph DAG view used for validation and ordered execution

// Core workflow type definitions
pub mod types;

// Petgraph DAG construction and topological ordering
pub mod graph;

// Re-export commonly used types
pub use graph::WorkflowGraph;
pub use types::{Edge, EngineType, Node, WorkflowDefinition};
