use tracing::debug;

use gatehouse_core::flow::{SELF_TARGET, WILDCARD};
use gatehouse_core::types::Step;

use super::{Target, TransitionTable};

/// Router outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Next(String),
    End,
}

/// Pick the node after `current` for a freshly produced step.
///
/// First match wins:
/// 1. the evaluator decision, if the table maps it;
/// 2. the responder routing key (`nextAgent`, then `nextStatus`): the current
///    node id or `self` loops back, a mapped key follows its target;
/// 3. the wildcard;
/// 4. otherwise the flow ends.
pub fn route(step: &Step, current: &str, table: &TransitionTable) -> Route {
    let resolve = |target: &Target| match target {
        Target::Node(id) => Route::Next(id.clone()),
        Target::SelfLoop => Route::Next(current.to_string()),
        Target::End => Route::End,
    };

    if let Some(decision) = step.decision {
        if let Some(target) = table.get(decision.as_str()) {
            return resolve(target);
        }
    }

    let keys = [
        step.next_agent.as_deref(),
        step.next_status.as_ref().map(|s| s.as_str()),
    ];
    for key in keys.into_iter().flatten() {
        if key == current || key == SELF_TARGET {
            return Route::Next(current.to_string());
        }
        if let Some(target) = table.get(key) {
            return resolve(target);
        }
    }

    if let Some(target) = table.get(WILDCARD) {
        return resolve(target);
    }

    debug!(
        node_id = %current,
        decision = ?step.decision,
        status = ?step.next_status,
        "No transition matched, ending flow"
    );
    Route::End
}
