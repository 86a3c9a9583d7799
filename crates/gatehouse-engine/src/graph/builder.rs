use std::collections::HashMap;

use tracing::{debug, warn};

use gatehouse_core::error::{GatehouseError, Result};
use gatehouse_core::flow::{is_end_marker, FlowDefinition, SELF_TARGET, WILDCARD};
use gatehouse_core::types::{Decision, ResponderStatus};

use super::{CompiledGraph, CompiledNode, Target, TransitionTable};
use crate::node::NodeKind;
use crate::registry::Capabilities;

/// Validate a definition and compile it.
///
/// Every problem found is reported in a single `Definition` error; no partial
/// graph is ever returned.
pub fn build(def: &FlowDefinition, caps: &Capabilities) -> Result<CompiledGraph> {
    let mut errors: Vec<String> = Vec::new();

    if def.id.trim().is_empty() {
        errors.push("definition id is empty".to_string());
    }
    if def.graph.nodes.is_empty() {
        errors.push("graph has no nodes".to_string());
    }
    let start = def.graph.start.trim();
    if start.is_empty() {
        errors.push("missing start node".to_string());
    } else if !def.graph.nodes.contains_key(start) {
        errors.push(format!("start node '{}' is not defined", start));
    }

    let mut nodes = HashMap::new();
    for (node_id, spec) in &def.graph.nodes {
        let kind = match spec.node_type.parse::<NodeKind>() {
            Ok(kind) => Some(kind),
            Err(e) => {
                errors.push(format!("node '{}': {}", node_id, e));
                None
            }
        };

        let mut transitions = TransitionTable::default();
        for (key, target) in &spec.transitions {
            match resolve_target(def, target) {
                Some(t) => transitions.insert(key, t),
                None => errors.push(format!(
                    "node '{}': transition '{}' points to unknown node '{}'",
                    node_id, key, target
                )),
            }
            if let Some(kind) = kind {
                if !is_known_key(def, kind, key) {
                    warn!(
                        definition_id = %def.id,
                        node_id = %node_id,
                        key = %key,
                        "Transition key can never match"
                    );
                }
            }
        }

        let Some(kind) = kind else { continue };
        match caps.producer(node_id, kind, spec) {
            Ok(producer) => {
                nodes.insert(
                    node_id.clone(),
                    CompiledNode {
                        kind,
                        producer,
                        transitions,
                    },
                );
            }
            Err(mut node_errors) => errors.append(&mut node_errors),
        }
    }

    if !errors.is_empty() {
        return Err(GatehouseError::Definition(errors.join("; ")));
    }

    debug!(definition_id = %def.id, nodes = nodes.len(), "Compiled flow graph");
    Ok(CompiledGraph {
        definition_id: def.id.clone(),
        start: start.to_string(),
        nodes,
    })
}

/// `self`, `*` and `END` (any case) are markers; anything else must be a node id.
fn resolve_target(def: &FlowDefinition, target: &str) -> Option<Target> {
    let target = target.trim();
    if target == SELF_TARGET {
        Some(Target::SelfLoop)
    } else if is_end_marker(target) || target == WILDCARD {
        Some(Target::End)
    } else if def.graph.nodes.contains_key(target) {
        Some(Target::Node(target.to_string()))
    } else {
        None
    }
}

fn is_known_key(def: &FlowDefinition, kind: NodeKind, key: &str) -> bool {
    let key = key.trim();
    if key == WILDCARD || key == SELF_TARGET {
        return true;
    }
    match kind {
        NodeKind::Evaluator => key.parse::<Decision>().is_ok(),
        NodeKind::Responder => {
            key.parse::<ResponderStatus>().is_ok() || def.graph.nodes.contains_key(key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_core::config::ModelConfig;
    use gatehouse_core::flow::{FlowGraph, NodeConfig, NodeSpec};
    use gatehouse_test_utils::{guarded_flow, ScriptedLlm};
    use gatehouse_tools::ToolRegistry;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn caps() -> Capabilities {
        Capabilities::new(
            Arc::new(ScriptedLlm::default()),
            ModelConfig::new("test"),
            Arc::new(ToolRegistry::with_builtins()),
        )
    }

    fn message(result: Result<CompiledGraph>) -> String {
        match result {
            Err(GatehouseError::Definition(msg)) => msg,
            other => panic!("expected definition error, got {:?}", other),
        }
    }

    #[test]
    fn compiles_guarded_flow() {
        let graph = build(&guarded_flow("chat"), &caps()).unwrap();
        assert_eq!(graph.start, "gate");
        assert_eq!(graph.nodes.len(), 2);
        let gate = graph.node("gate").unwrap();
        assert_eq!(gate.kind, NodeKind::Evaluator);
        assert_eq!(gate.transitions.get("BLOCK"), Some(&Target::End));
        assert_eq!(gate.transitions.get("NEEDS_CLARIFICATION"), Some(&Target::SelfLoop));
    }

    #[test]
    fn missing_start_is_rejected() {
        let mut def = guarded_flow("chat");
        def.graph.start = String::new();
        assert!(message(build(&def, &caps())).contains("missing start node"));
    }

    #[test]
    fn unknown_start_is_rejected() {
        let mut def = guarded_flow("chat");
        def.graph.start = "nowhere".into();
        assert!(message(build(&def, &caps())).contains("start node 'nowhere' is not defined"));
    }

    #[test]
    fn all_problems_are_reported_together() {
        let mut nodes = BTreeMap::new();
        nodes.insert("a".to_string(), NodeSpec::new("router"));
        nodes.insert(
            "b".to_string(),
            NodeSpec::new("responder")
                .with_config(NodeConfig {
                    system_prompt: Some("Help.".into()),
                    ..Default::default()
                })
                .with_transition("COMPLETE", "ghost"),
        );
        nodes.insert("c".to_string(), NodeSpec::new("evaluator"));
        let def = FlowDefinition {
            id: "broken".into(),
            name: String::new(),
            graph: FlowGraph {
                start: "a".into(),
                nodes,
            },
        };

        let msg = message(build(&def, &caps()));
        assert!(msg.contains("node 'a': unknown node type 'router'"), "{}", msg);
        assert!(msg.contains("points to unknown node 'ghost'"), "{}", msg);
        assert!(msg.contains("node 'c': missing constitution"), "{}", msg);
    }

    #[test]
    fn end_marker_and_wildcard_targets_terminate() {
        let mut def = guarded_flow("chat");
        let assistant = def.graph.nodes.get_mut("assistant").unwrap();
        assistant.transitions.insert("ERROR".into(), "end".into());
        assistant.transitions.insert("*".into(), "*".into());
        let graph = build(&def, &caps()).unwrap();
        let table = &graph.node("assistant").unwrap().transitions;
        assert_eq!(table.get("ERROR"), Some(&Target::End));
        assert_eq!(table.get("*"), Some(&Target::End));
    }
}
