use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique flow instance identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who produced a step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepRole {
    User,
    Evaluator,
    Responder,
    Tool,
}

/// Outcome of an evaluator node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Allow,
    Block,
    Caution,
    NeedsClarification,
}

impl Decision {
    pub const ALL: [Decision; 4] = [
        Decision::Allow,
        Decision::Block,
        Decision::Caution,
        Decision::NeedsClarification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "ALLOW",
            Self::Block => "BLOCK",
            Self::Caution => "CAUTION",
            Self::NeedsClarification => "NEEDS_CLARIFICATION",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match normalize_key(s).as_str() {
            "ALLOW" => Ok(Self::Allow),
            "BLOCK" => Ok(Self::Block),
            "CAUTION" => Ok(Self::Caution),
            "NEEDS_CLARIFICATION" => Ok(Self::NeedsClarification),
            other => Err(format!("unknown decision: {}", other)),
        }
    }
}

/// Outcome of a responder node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponderStatus {
    Complete,
    NeedsTool,
    NeedsResearch,
    NeedsReview,
    Error,
    AwaitingToolConfirmation,
}

impl ResponderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "COMPLETE",
            Self::NeedsTool => "NEEDS_TOOL",
            Self::NeedsResearch => "NEEDS_RESEARCH",
            Self::NeedsReview => "NEEDS_REVIEW",
            Self::Error => "ERROR",
            Self::AwaitingToolConfirmation => "AWAITING_TOOL_CONFIRMATION",
        }
    }
}

impl fmt::Display for ResponderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResponderStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match normalize_key(s).as_str() {
            "COMPLETE" => Ok(Self::Complete),
            "NEEDS_TOOL" => Ok(Self::NeedsTool),
            "NEEDS_RESEARCH" => Ok(Self::NeedsResearch),
            "NEEDS_REVIEW" => Ok(Self::NeedsReview),
            "ERROR" => Ok(Self::Error),
            "AWAITING_TOOL_CONFIRMATION" => Ok(Self::AwaitingToolConfirmation),
            other => Err(format!("unknown responder status: {}", other)),
        }
    }
}

/// Upper-case and replace separators so "needs clarification" parses too.
fn normalize_key(s: &str) -> String {
    s.trim()
        .to_uppercase()
        .replace(['-', ' '], "_")
}

/// A tool call attached to a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolUsage {
    pub tool_name: String,
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

/// One unit of flow execution. Immutable once appended to an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub step_id: String,
    /// Node id that produced the step, or "user" for user turns.
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub role: StepRole,
    pub input: String,
    pub response: String,
    #[serde(default)]
    pub hidden_thinking: Option<String>,
    #[serde(default)]
    pub hidden_guidance: Option<String>,
    #[serde(default)]
    pub tool_usage: Option<ToolUsage>,
    #[serde(default)]
    pub decision: Option<Decision>,
    #[serde(default)]
    pub next_status: Option<ResponderStatus>,
    /// Explicit routing key chosen by a responder (a node id or `self`).
    #[serde(default)]
    pub next_agent: Option<String>,
    #[serde(default)]
    pub raw_output: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Set when the producing node stopped before finishing its output.
    #[serde(default)]
    pub incomplete: bool,
}

impl Step {
    fn base(agent_id: impl Into<String>, role: StepRole, input: impl Into<String>) -> Self {
        Self {
            step_id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            timestamp: Utc::now(),
            role,
            input: input.into(),
            response: String::new(),
            hidden_thinking: None,
            hidden_guidance: None,
            tool_usage: None,
            decision: None,
            next_status: None,
            next_agent: None,
            raw_output: None,
            metadata: HashMap::new(),
            incomplete: false,
        }
    }

    /// A user turn entering the flow.
    pub fn user(input: impl Into<String>) -> Self {
        Self::base("user", StepRole::User, input)
    }

    pub fn evaluator(node_id: impl Into<String>, input: impl Into<String>, decision: Decision) -> Self {
        let mut step = Self::base(node_id, StepRole::Evaluator, input);
        step.decision = Some(decision);
        step
    }

    pub fn responder(
        node_id: impl Into<String>,
        input: impl Into<String>,
        status: ResponderStatus,
    ) -> Self {
        let mut step = Self::base(node_id, StepRole::Responder, input);
        step.next_status = Some(status);
        step
    }

    /// Result of a confirmed tool execution.
    pub fn tool(node_id: impl Into<String>, usage: ToolUsage) -> Self {
        let input = usage.input.to_string();
        let mut step = Self::base(node_id, StepRole::Tool, input);
        step.response = usage.output.clone().unwrap_or_default();
        step.tool_usage = Some(usage);
        step
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = response.into();
        self
    }

    pub fn with_thinking(mut self, thinking: impl Into<String>) -> Self {
        let thinking = thinking.into();
        if !thinking.is_empty() {
            self.hidden_thinking = Some(thinking);
        }
        self
    }

    pub fn with_guidance(mut self, guidance: Option<String>) -> Self {
        self.hidden_guidance = guidance.filter(|g| !g.is_empty());
        self
    }

    /// Append a line to the hidden guidance.
    pub fn push_guidance(&mut self, note: &str) {
        match self.hidden_guidance.as_mut() {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(note);
            }
            None => self.hidden_guidance = Some(note.to_string()),
        }
    }

    /// The key a router matches for responder steps: explicit agent first, then status.
    pub fn routing_key(&self) -> Option<&str> {
        self.next_agent
            .as_deref()
            .or_else(|| self.next_status.as_ref().map(|s| s.as_str()))
    }
}

/// Role in a model conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message sent to the model. Nodes are single-shot, so content is plain text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }
}

/// Stop reason from the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

/// A streaming delta from the LLM.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// A chunk of text content.
    TextDelta(String),

    /// A chunk of thinking/reasoning content.
    ThinkingDelta(String),

    /// Start of a tool use block.
    ToolUseStart {
        index: usize,
        id: String,
        name: String,
    },

    /// A chunk of tool use input JSON.
    ToolInputDelta { index: usize, delta: String },

    /// The response is complete.
    Stop(StopReason),

    /// Usage information.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
}

/// Result of a tool execution.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Tool definition for sending to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Context passed to tools during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub instance_id: InstanceId,
    pub node_id: String,
}
