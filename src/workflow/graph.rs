/// Petgraph DAG view of a workflow definition
///
/// Converts a definition into a directed graph and computes a deterministic
/// topological execution order. Used by adapters that execute node graphs and
/// by validation to reject cycles and dangling edges.

use crate::workflow::types::{Node, WorkflowDefinition};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// Internal representation of a workflow as a petgraph DAG
#[derive(Debug)]
pub struct WorkflowGraph {
    graph: DiGraph<Node, ()>,
    node_id_to_index: HashMap<String, NodeIndex>,
}

impl WorkflowGraph {
    /// Build a graph from a workflow definition
    ///
    /// Collects every structural problem instead of stopping at the first so
    /// validation can report them together.
    pub fn build(workflow: &WorkflowDefinition) -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();
        let mut graph = DiGraph::new();
        let mut node_id_to_index = HashMap::new();

        for node in &workflow.nodes {
            if node_id_to_index.contains_key(&node.id) {
                errors.push(format!("duplicate node id: {}", node.id));
                continue;
            }
            let index = graph.add_node(node.clone());
            node_id_to_index.insert(node.id.clone(), index);
        }

        for edge in &workflow.edges {
            match (node_id_to_index.get(&edge.from), node_id_to_index.get(&edge.to)) {
                (Some(from), Some(to)) => {
                    graph.add_edge(*from, *to, ());
                }
                (None, _) => errors.push(format!("edge references unknown node: {}", edge.from)),
                (_, None) => errors.push(format!("edge references unknown node: {}", edge.to)),
            }
        }

        if errors.is_empty() && toposort(&graph, None).is_err() {
            errors.push("workflow contains cycles - must be a DAG".to_string());
        }

        if !errors.is_empty() {
            tracing::debug!("❌ Workflow '{}' failed graph validation: {:?}", workflow.id, errors);
            return Err(errors);
        }

        Ok(Self {
            graph,
            node_id_to_index,
        })
    }

    /// Nodes in topological order
    pub fn execution_order(&self) -> Vec<&Node> {
        // build() rejects cyclic graphs, so toposort cannot fail here
        toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|idx| &self.graph[idx]).collect())
            .unwrap_or_default()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.node_id_to_index.get(id).map(|idx| &self.graph[*idx])
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}
