//! Observer-facing events.
//!
//! Steps leave the engine only as [`PublicStep`]s, which have no field for
//! hidden thinking, hidden guidance, raw model output or metadata. Delivery
//! goes through a bounded channel, so a slow observer slows the producer
//! instead of growing a buffer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use gatehouse_core::types::{Decision, InstanceId, ResponderStatus, Step, StepRole, ToolUsage};

/// A step as observers see it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublicStep {
    pub instance_id: InstanceId,
    pub step_id: String,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub role: StepRole,
    pub input: String,
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_usage: Option<ToolUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_status: Option<ResponderStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_agent: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub incomplete: bool,
}

impl PublicStep {
    pub fn from_step(instance_id: &InstanceId, step: &Step) -> Self {
        Self {
            instance_id: instance_id.clone(),
            step_id: step.step_id.clone(),
            agent_id: step.agent_id.clone(),
            timestamp: step.timestamp,
            role: step.role,
            input: step.input.clone(),
            response: step.response.clone(),
            tool_usage: step.tool_usage.clone(),
            decision: step.decision,
            next_status: step.next_status,
            next_agent: step.next_agent.clone(),
            incomplete: step.incomplete,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PartialOutput {
    pub instance_id: InstanceId,
    pub agent_id: String,
    pub delta: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamError {
    pub instance_id: InstanceId,
    pub message: String,
}

/// Wire framing: `{"event": "complete_step" | "partial_output" | "error", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    CompleteStep(PublicStep),
    PartialOutput(PartialOutput),
    Error(StreamError),
}

impl StreamEvent {
    /// Event name as used in the `event` field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CompleteStep(_) => "complete_step",
            Self::PartialOutput(_) => "partial_output",
            Self::Error(_) => "error",
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        match self {
            Self::CompleteStep(s) => &s.instance_id,
            Self::PartialOutput(p) => &p.instance_id,
            Self::Error(e) => &e.instance_id,
        }
    }

    /// The `data` payload alone.
    pub fn data_json(&self) -> serde_json::Value {
        let result = match self {
            Self::CompleteStep(s) => serde_json::to_value(s),
            Self::PartialOutput(p) => serde_json::to_value(p),
            Self::Error(e) => serde_json::to_value(e),
        };
        result.unwrap_or(serde_json::Value::Null)
    }
}

/// Events of one `send` or `resume` call. Ends when the run stops.
pub type StepStream = ReceiverStream<StreamEvent>;

/// Producer half of a [`StepStream`], bound to one instance.
#[derive(Clone)]
pub struct StepEmitter {
    instance_id: InstanceId,
    tx: mpsc::Sender<StreamEvent>,
}

impl StepEmitter {
    pub fn channel(instance_id: InstanceId, buffer: usize) -> (Self, StepStream) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { instance_id, tx }, ReceiverStream::new(rx))
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    async fn send(&self, event: StreamEvent) {
        // A departed observer does not stop the run.
        if self.tx.send(event).await.is_err() {
            debug!(instance_id = %self.instance_id, "Stream observer dropped");
        }
    }

    pub async fn complete_step(&self, step: &Step) {
        self.send(StreamEvent::CompleteStep(PublicStep::from_step(&self.instance_id, step)))
            .await;
    }

    pub async fn partial(&self, agent_id: &str, delta: String) {
        if delta.is_empty() {
            return;
        }
        self.send(StreamEvent::PartialOutput(PartialOutput {
            instance_id: self.instance_id.clone(),
            agent_id: agent_id.to_string(),
            delta,
        }))
        .await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.send(StreamEvent::Error(StreamError {
            instance_id: self.instance_id.clone(),
            message: message.into(),
        }))
        .await;
    }
}
