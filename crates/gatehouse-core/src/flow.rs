//! Declarative flow definitions as operators write them.
//!
//! A definition is plain data; it is validated and compiled into an
//! executable graph by the engine's builder.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Transition target meaning "loop back to the node that produced the step".
pub const SELF_TARGET: &str = "self";
/// Transition key matching any decision or status not otherwise mapped.
pub const WILDCARD: &str = "*";
/// Transition target that terminates the flow.
pub const END_TARGET: &str = "END";

/// True for the terminal marker (`END`, any case).
pub fn is_end_marker(target: &str) -> bool {
    target.eq_ignore_ascii_case(END_TARGET)
}

/// A flow as submitted by an operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub graph: FlowGraph,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowGraph {
    /// Id of the first node to run on a fresh turn.
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeSpec>,
}

/// One node of a flow graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSpec {
    /// Type tag, `evaluator` or `responder`.
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub config: NodeConfig,
    #[serde(default)]
    pub transitions: BTreeMap<String, String>,
}

/// Node configuration. Which fields are required depends on the node type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// Inline constitution text (evaluators).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constitution: Option<String>,
    /// Constitution looked up in the text library (evaluators).
    #[serde(default, alias = "constitution_id", skip_serializing_if = "Option::is_none")]
    pub constitution_id: Option<String>,
    /// Regexes that block input without consulting the model (evaluators).
    #[serde(default, alias = "blocked_patterns", skip_serializing_if = "Vec::is_empty")]
    pub blocked_patterns: Vec<String>,
    /// Inline system prompt (responders).
    #[serde(default, alias = "system_prompt", skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// System prompt looked up in the text library (responders).
    #[serde(default, alias = "system_prompt_id", skip_serializing_if = "Option::is_none")]
    pub system_prompt_id: Option<String>,
    /// Tools offered to a responder (empty = every registered tool).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

impl FlowDefinition {
    /// Parse a definition from its JSON wire form.
    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.graph.nodes.get(id)
    }
}

impl NodeSpec {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            config: NodeConfig::default(),
            transitions: BTreeMap::new(),
        }
    }

    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_transition(mut self, key: impl Into<String>, target: impl Into<String>) -> Self {
        self.transitions.insert(key.into(), target.into());
        self
    }
}
