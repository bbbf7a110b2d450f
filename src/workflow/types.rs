/// Core workflow type definitions
///
/// Defines the engine-agnostic workflow definition handed to engine adapters.
/// Each definition declares the engine type it targets; the orchestration core
/// dispatches purely on that declared type.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// External automation engines a workflow may target
///
/// `Local` is the built-in in-process engine; the others are served by
/// adapters registered at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    Langflow,
    N8n,
    Langsmith,
    Local,
}

impl EngineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineType::Langflow => "langflow",
            EngineType::N8n => "n8n",
            EngineType::Langsmith => "langsmith",
            EngineType::Local => "local",
        }
    }

    pub fn all() -> [EngineType; 4] {
        [
            EngineType::Langflow,
            EngineType::N8n,
            EngineType::Langsmith,
            EngineType::Local,
        ]
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "langflow" => Ok(EngineType::Langflow),
            "n8n" => Ok(EngineType::N8n),
            "langsmith" => Ok(EngineType::Langsmith),
            "local" => Ok(EngineType::Local),
            other => Err(format!("unknown engine type: {}", other)),
        }
    }
}

/// A complete workflow definition containing nodes and their connections
///
/// The node/edge structure is generic; each engine adapter interprets node
/// types in its own vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique workflow identifier (e.g., "wf-grading")
    pub id: String,
    /// Human-readable workflow name
    pub name: String,
    /// Engine this definition targets
    pub engine_type: EngineType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Engine-specific extras carried through untouched
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, engine_type: EngineType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            engine_type,
            version: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Append a node (builder style)
    pub fn with_node(mut self, id: impl Into<String>, node_type: impl Into<String>, params: Value) -> Self {
        self.nodes.push(Node {
            id: id.into(),
            node_type: node_type.into(),
            params,
        });
        self
    }

    /// Append an edge (builder style)
    pub fn with_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
        });
        self
    }
}

/// A single node in the workflow DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier within the workflow (e.g., "n1", "fetch")
    pub id: String,
    /// Engine-specific node type
    pub node_type: String,
    /// Node-specific configuration parameters as flexible JSON
    #[serde(default)]
    pub params: Value,
}

/// Connection between two nodes in the workflow DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Source node ID
    pub from: String,
    /// Target node ID
    pub to: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn engine_type_round_trips_through_strings() {
        for engine in EngineType::all() {
            assert_eq!(engine.as_str().parse::<EngineType>().unwrap(), engine);
        }
        assert!("zapier".parse::<EngineType>().is_err());
        assert_eq!(" N8N ".parse::<EngineType>().unwrap(), EngineType::N8n);
    }

    #[test]
    fn definition_deserializes_with_defaults() {
        let wf: WorkflowDefinition = serde_json::from_value(json!({
            "id": "wf-1",
            "name": "Nightly report",
            "engine_type": "n8n"
        }))
        .unwrap();

        assert_eq!(wf.engine_type, EngineType::N8n);
        assert!(wf.nodes.is_empty());
        assert!(wf.edges.is_empty());
        assert!(wf.version.is_none());
    }
}
