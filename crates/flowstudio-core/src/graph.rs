use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// The closed set of node types a workflow can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    #[serde(alias = "start")]
    Entry,
    #[serde(alias = "llm")]
    Generate,
    Agent,
    #[serde(alias = "knowledge")]
    Retrieve,
    Answer,
    #[serde(alias = "classifier")]
    Classify,
    #[serde(alias = "http_request")]
    Http,
    #[serde(alias = "doc_extractor")]
    Extract,
    #[serde(alias = "ifelse")]
    Branch,
}

impl NodeKind {
    pub const ALL: [NodeKind; 9] = [
        NodeKind::Entry,
        NodeKind::Generate,
        NodeKind::Agent,
        NodeKind::Retrieve,
        NodeKind::Answer,
        NodeKind::Classify,
        NodeKind::Http,
        NodeKind::Extract,
        NodeKind::Branch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Entry => "entry",
            NodeKind::Generate => "generate",
            NodeKind::Agent => "agent",
            NodeKind::Retrieve => "retrieve",
            NodeKind::Answer => "answer",
            NodeKind::Classify => "classify",
            NodeKind::Http => "http",
            NodeKind::Extract => "extract",
            NodeKind::Branch => "branch",
        }
    }

    /// Whether the node selects exactly one successor at run time.
    pub fn is_branching(&self) -> bool {
        matches!(self, NodeKind::Classify | NodeKind::Branch)
    }

    /// Whether the node's output is recorded in conversation memory.
    pub fn writes_memory(&self) -> bool {
        matches!(self, NodeKind::Generate | NodeKind::Agent)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single typed unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub label: String,
    #[serde(default, alias = "data")]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            kind,
            config: serde_json::Map::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_config(mut self, key: &str, value: serde_json::Value) -> Self {
        self.config.insert(key.to_string(), value);
        self
    }

    /// String config value, if present and a string.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn config_f64(&self, key: &str) -> Option<f64> {
        self.config.get(key).and_then(|v| v.as_f64())
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(|v| v.as_u64())
    }

    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(|v| v.as_bool())
    }

    /// Deserialize a config entry into a typed value.
    pub fn config_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.config.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(v) => serde_json::from_value(v.clone()).map(Some).map_err(|e| {
                FlowError::InvalidNodeConfig {
                    node_id: self.id.clone(),
                    message: format!("{key}: {e}"),
                }
            }),
        }
    }
}

/// A directed data-flow link between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// A workflow: nodes plus directed edges, in declaration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self {
            id: None,
            name: None,
            nodes,
            edges,
        }
    }

    /// Load a graph from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::GraphNotFound(path.display().to_string()))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn entry(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.kind == NodeKind::Entry)
    }

    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.source == id)
    }

    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.target == id)
    }

    /// Check structural invariants: unique ids, exactly one entry node and
    /// edges between existing nodes. `nextSteps` targets are resolved at run
    /// time, so a stale arm only matters if a run actually takes it.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(FlowError::InvalidGraph(format!("duplicate node id '{}'", node.id)));
            }
        }

        match self.nodes.iter().filter(|n| n.kind == NodeKind::Entry).count() {
            0 => return Err(FlowError::EntryNodeMissing),
            1 => {}
            n => {
                return Err(FlowError::InvalidGraph(format!(
                    "expected exactly one entry node, found {n}"
                )))
            }
        }

        for edge in &self.edges {
            for end in [&edge.source, &edge.target] {
                if !ids.contains(end.as_str()) {
                    return Err(FlowError::InvalidGraph(format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.source, edge.target, end
                    )));
                }
            }
        }

        Ok(())
    }

    /// Count of inbound edges per node.
    pub fn in_degrees(&self) -> HashMap<&str, usize> {
        let mut degrees: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        for edge in &self.edges {
            *degrees.entry(edge.target.as_str()).or_insert(0) += 1;
        }
        degrees
    }
}
