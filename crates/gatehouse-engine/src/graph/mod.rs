//! Compiled flow graphs.
//!
//! A [`FlowDefinition`](gatehouse_core::flow::FlowDefinition) is validated and
//! compiled by [`build`] into a [`CompiledGraph`]: one step producer per node
//! plus a transition table keyed by decision or status. [`route`] walks the
//! table after each step. Compiled graphs are never persisted.

pub mod builder;
pub mod router;

use std::collections::HashMap;
use std::sync::Arc;

use crate::node::{NodeKind, StepProducer};

pub use builder::build;
pub use router::{route, Route};

/// Where a transition leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Node(String),
    /// Back to the node that produced the step.
    SelfLoop,
    End,
}

/// Routing keys of one node mapped to targets.
///
/// Decision and status keys are stored in their canonical upper-case form;
/// keys naming a node id are kept as written.
#[derive(Debug, Clone, Default)]
pub struct TransitionTable {
    entries: HashMap<String, Target>,
}

impl TransitionTable {
    pub fn insert(&mut self, key: &str, target: Target) {
        self.entries.insert(canonical_key(key), target);
    }

    pub fn get(&self, key: &str) -> Option<&Target> {
        self.entries
            .get(key)
            .or_else(|| self.entries.get(&canonical_key(key)))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Upper-case decision and status names; leave anything else alone.
fn canonical_key(key: &str) -> String {
    let key = key.trim();
    if let Ok(d) = key.parse::<gatehouse_core::types::Decision>() {
        return d.as_str().to_string();
    }
    if let Ok(s) = key.parse::<gatehouse_core::types::ResponderStatus>() {
        return s.as_str().to_string();
    }
    key.to_string()
}

pub struct CompiledNode {
    pub kind: NodeKind,
    pub producer: Arc<dyn StepProducer>,
    pub transitions: TransitionTable,
}

/// An executable flow: node id to producer and transition table.
pub struct CompiledGraph {
    pub definition_id: String,
    pub start: String,
    pub nodes: HashMap<String, CompiledNode>,
}

impl CompiledGraph {
    pub fn node(&self, id: &str) -> Option<&CompiledNode> {
        self.nodes.get(id)
    }
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<&String> = self.nodes.keys().collect();
        ids.sort();
        f.debug_struct("CompiledGraph")
            .field("definition_id", &self.definition_id)
            .field("start", &self.start)
            .field("nodes", &ids)
            .finish()
    }
}
