//! Tool confirmation gate.
//!
//! A responder that wants a tool under `confirmAll` parks the call as a
//! [`PendingToolExecution`] and the run stops. The entry then leaves the
//! pending map exactly once, through [`take_pending`], and is settled by either
//! [`apply_confirmation`] or [`apply_denial`]. Removal happens under the
//! instance state lock, so two racing confirms cannot both win.

use serde::{Deserialize, Serialize};
use tracing::info;

use gatehouse_core::error::{GatehouseError, Result};
use gatehouse_core::instance::{InstanceRecord, InstanceStatus, PendingToolExecution};
use gatehouse_core::types::{Step, ToolResult, ToolUsage};

/// What `confirm` returns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfirmation {
    pub execution_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
    pub result: String,
    pub is_error: bool,
}

/// What `deny` returns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDenial {
    pub execution_id: String,
    pub tool_name: String,
}

/// Remove a pending entry, or fail if it is unknown or already settled.
pub(crate) fn take_pending(
    record: &mut InstanceRecord,
    execution_id: &str,
) -> Result<PendingToolExecution> {
    let pending = record
        .pending_tool_executions
        .remove(execution_id)
        .ok_or_else(|| GatehouseError::PendingNotFound {
            instance_id: record.id.to_string(),
            execution_id: execution_id.to_string(),
        })?;
    record.touch();
    Ok(pending)
}

/// Hand the outcome to the requesting node and, once nothing else is
/// pending, let the instance resume there.
fn settle(record: &mut InstanceRecord, node_id: &str, note: String) {
    record.carried_guidance = Some(match record.carried_guidance.take() {
        Some(existing) if !existing.is_empty() => format!("{}\n\n{}", existing, note),
        _ => note,
    });
    record.cursor = Some(node_id.to_string());
    if record.pending_tool_executions.is_empty() {
        record.status = InstanceStatus::ReadyToResume;
    }
    record.touch();
}

/// Record an executed tool call: one `tool` step plus carried guidance.
pub(crate) fn apply_confirmation(
    record: &mut InstanceRecord,
    pending: PendingToolExecution,
    result: ToolResult,
) -> ToolConfirmation {
    let usage = ToolUsage {
        tool_name: pending.tool_name.clone(),
        input: pending.tool_input.clone(),
        output: Some(result.content.clone()),
        is_error: result.is_error,
        execution_id: Some(pending.id.clone()),
    };
    record.append(Step::tool(&pending.node_id, usage));

    let note = format!(
        "The user approved `{}` with {}. It {}:\n{}",
        pending.tool_name,
        pending.tool_input,
        if result.is_error { "failed" } else { "returned" },
        result.content
    );
    settle(record, &pending.node_id, note);

    info!(
        instance_id = %record.id,
        execution_id = %pending.id,
        tool = %pending.tool_name,
        is_error = result.is_error,
        "Tool execution confirmed"
    );
    ToolConfirmation {
        execution_id: pending.id,
        tool_name: pending.tool_name,
        input: pending.tool_input,
        result: result.content,
        is_error: result.is_error,
    }
}

/// Record a denied call. No step is appended.
pub(crate) fn apply_denial(record: &mut InstanceRecord, pending: PendingToolExecution) -> ToolDenial {
    let note = format!(
        "The user denied the request to run `{}` with {}. Do not call it again; \
         answer without it.",
        pending.tool_name, pending.tool_input
    );
    settle(record, &pending.node_id, note);

    info!(
        instance_id = %record.id,
        execution_id = %pending.id,
        tool = %pending.tool_name,
        "Tool execution denied"
    );
    ToolDenial {
        execution_id: pending.id,
        tool_name: pending.tool_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_core::instance::ToolConfirmationSettings;
    use gatehouse_core::types::StepRole;

    fn awaiting() -> (InstanceRecord, String) {
        let mut record = InstanceRecord::new("flow", ToolConfirmationSettings::default());
        let pending = PendingToolExecution::new(
            "calculator",
            serde_json::json!({"expression": "6*7"}),
            "assistant",
        );
        let id = pending.id.clone();
        record.pending_tool_executions.insert(id.clone(), pending);
        record.status = InstanceStatus::AwaitingToolConfirmation;
        (record, id)
    }

    #[test]
    fn pending_can_be_taken_once() {
        let (mut record, id) = awaiting();
        assert!(take_pending(&mut record, &id).is_ok());
        let err = take_pending(&mut record, &id).unwrap_err();
        assert!(matches!(err, GatehouseError::PendingNotFound { .. }));
    }

    #[test]
    fn confirmation_appends_tool_step_and_readies_resume() {
        let (mut record, id) = awaiting();
        let pending = take_pending(&mut record, &id).unwrap();
        let outcome = apply_confirmation(&mut record, pending, ToolResult::success("42"));

        assert_eq!(outcome.tool_name, "calculator");
        assert_eq!(outcome.input["expression"], "6*7");
        assert_eq!(outcome.result, "42");
        assert_eq!(record.history().len(), 1);
        let step = &record.history()[0];
        assert_eq!(step.role, StepRole::Tool);
        assert_eq!(step.agent_id, "assistant");
        assert_eq!(record.status, InstanceStatus::ReadyToResume);
        assert_eq!(record.cursor.as_deref(), Some("assistant"));
        assert!(record.carried_guidance.as_deref().unwrap().contains("42"));
    }

    #[test]
    fn denial_appends_nothing() {
        let (mut record, id) = awaiting();
        let pending = take_pending(&mut record, &id).unwrap();
        let denial = apply_denial(&mut record, pending);

        assert_eq!(denial.execution_id, id);
        assert!(record.history().is_empty());
        assert!(record.pending_tool_executions.is_empty());
        assert_eq!(record.status, InstanceStatus::ReadyToResume);
        assert!(record.carried_guidance.as_deref().unwrap().contains("denied"));
    }
}
