//! Topic Graph
//!
//! The shared script-state every host reads. A graph is written once per
//! episode by the producer and persisted as a single snapshot; after that only
//! `current_node_id` moves.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// Structural problems that make a graph unfit for publication.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Topic graph has no nodes")]
    Empty,
    #[error("Duplicate node id: {0}")]
    DuplicateNodeId(String),
    #[error("current_node_id '{0}' does not match any node")]
    UnknownCurrentNode(String),
    #[error("Node '{0}' is not part of the topic graph")]
    UnknownNode(String),
}

/// A single segment of the episode script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicNode {
    /// Unique within a graph.
    pub id: String,
    /// Short label for the topic.
    pub label: String,
    /// Guidance text and key facts for the hosts.
    pub content: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl TopicNode {
    pub fn new(id: impl Into<String>, label: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            content: content.into(),
            metadata: BTreeMap::new(),
        }
    }
}

/// A directed connection between two nodes.
///
/// The `condition` is a free-form expression (e.g. `sentiment == skeptical`)
/// carried for the hosts' benefit; nothing here evaluates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicEdge {
    pub source_id: String,
    pub target_id: String,
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicGraph {
    pub nodes: Vec<TopicNode>,
    #[serde(default)]
    pub edges: Vec<TopicEdge>,
    #[serde(default)]
    pub current_node_id: Option<String>,
}

impl TopicGraph {
    pub fn new(nodes: Vec<TopicNode>, edges: Vec<TopicEdge>) -> Self {
        Self {
            nodes,
            edges,
            current_node_id: None,
        }
    }

    /// Checks the whole-graph invariants: at least one node, unique node ids,
    /// and a `current_node_id` that resolves when present.
    ///
    /// Edges pointing at missing nodes are tolerated; see [`dangling_edges`](Self::dangling_edges).
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.nodes.is_empty() {
            return Err(GraphError::Empty);
        }
        let mut seen = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(GraphError::DuplicateNodeId(node.id.clone()));
            }
        }
        if let Some(current) = &self.current_node_id {
            if !seen.contains(current.as_str()) {
                return Err(GraphError::UnknownCurrentNode(current.clone()));
            }
        }
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&TopicNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn first_node(&self) -> Option<&TopicNode> {
        self.nodes.first()
    }

    /// The node referenced by `current_node_id`, if it resolves.
    pub fn current_node(&self) -> Option<&TopicNode> {
        self.current_node_id.as_deref().and_then(|id| self.node(id))
    }

    /// Edges whose source or target is not a node of this graph.
    pub fn dangling_edges(&self) -> Vec<&TopicEdge> {
        self.edges
            .iter()
            .filter(|e| self.node(&e.source_id).is_none() || self.node(&e.target_id).is_none())
            .collect()
    }

    /// Suggests where the episode goes after the current node.
    ///
    /// Prefers the first unconditional outgoing edge; falls back to the next
    /// node in sequence order. Returns `None` at the end of the script or when
    /// no node is current.
    pub fn next_node_id(&self) -> Option<&str> {
        let current = self.current_node_id.as_deref()?;
        let by_edge = self
            .edges
            .iter()
            .find(|e| e.source_id == current && e.condition.is_none() && self.node(&e.target_id).is_some())
            .map(|e| e.target_id.as_str());
        if by_edge.is_some() {
            return by_edge;
        }
        let position = self.nodes.iter().position(|n| n.id == current)?;
        self.nodes.get(position + 1).map(|n| n.id.as_str())
    }
}
