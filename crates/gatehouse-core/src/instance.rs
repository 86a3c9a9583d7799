use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{InstanceId, Step};

/// Lifecycle of a flow instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Waiting for a user message; the next turn starts at the flow's start node.
    Idle,
    Running,
    /// An evaluator asked for clarification; the next turn starts at the cursor.
    AwaitingInput,
    AwaitingToolConfirmation,
    /// A pending tool call was confirmed or denied; `resume` continues at the cursor.
    ReadyToResume,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::AwaitingInput => "awaiting_input",
            Self::AwaitingToolConfirmation => "awaiting_tool_confirmation",
            Self::ReadyToResume => "ready_to_resume",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "awaiting_input" => Ok(Self::AwaitingInput),
            "awaiting_tool_confirmation" => Ok(Self::AwaitingToolConfirmation),
            "ready_to_resume" => Ok(Self::ReadyToResume),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown instance status: {}", other)),
        }
    }
}

/// Per-instance policy for tool side effects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfirmationSettings {
    #[serde(default = "default_confirm_all")]
    pub confirm_all: bool,
    #[serde(default)]
    pub exempted_tools: BTreeSet<String>,
}

fn default_confirm_all() -> bool {
    true
}

impl Default for ToolConfirmationSettings {
    fn default() -> Self {
        Self {
            confirm_all: true,
            exempted_tools: BTreeSet::new(),
        }
    }
}

impl ToolConfirmationSettings {
    /// Whether a call to `tool_name` must wait for a human.
    pub fn requires_confirmation(&self, tool_name: &str) -> bool {
        self.confirm_all && !self.exempted_tools.contains(tool_name)
    }
}

/// A tool call parked until a human confirms or denies it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingToolExecution {
    pub id: String,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    /// Responder node that requested the call.
    pub node_id: String,
    pub created_at: DateTime<Utc>,
}

impl PendingToolExecution {
    pub fn new(tool_name: impl Into<String>, tool_input: serde_json::Value, node_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tool_name: tool_name.into(),
            tool_input,
            node_id: node_id.into(),
            created_at: Utc::now(),
        }
    }
}

/// The durable, non-derived state of one instance.
///
/// History is append-only: steps can be added through [`InstanceRecord::append`]
/// and never edited or removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub definition_id: String,
    #[serde(default)]
    history: Vec<Step>,
    pub pending_tool_executions: BTreeMap<String, PendingToolExecution>,
    pub tool_confirmation_settings: ToolConfirmationSettings,
    pub status: InstanceStatus,
    /// Node the next turn or resume continues at.
    #[serde(default)]
    pub cursor: Option<String>,
    /// User message of the turn in progress.
    #[serde(default)]
    pub last_input: Option<String>,
    /// Hidden guidance handed to the cursor node on resume.
    #[serde(default)]
    pub carried_guidance: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceRecord {
    pub fn new(definition_id: impl Into<String>, settings: ToolConfirmationSettings) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::new(),
            definition_id: definition_id.into(),
            history: Vec::new(),
            pending_tool_executions: BTreeMap::new(),
            tool_confirmation_settings: settings,
            status: InstanceStatus::Idle,
            cursor: None,
            last_input: None,
            carried_guidance: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild a record from persisted parts.
    pub fn restore(mut self, history: Vec<Step>) -> Self {
        self.history = history;
        self
    }

    pub fn history(&self) -> &[Step] {
        &self.history
    }

    pub fn append(&mut self, step: Step) {
        self.history.push(step);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
