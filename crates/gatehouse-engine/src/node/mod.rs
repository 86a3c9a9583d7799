pub mod evaluator;
pub mod responder;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use gatehouse_core::error::{GatehouseError, Result};
use gatehouse_core::instance::{PendingToolExecution, ToolConfirmationSettings};
use gatehouse_core::types::{InstanceId, Step, StreamDelta};

use crate::stream::StepEmitter;

/// Node type tag, resolved once when a graph is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Evaluator,
    Responder,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Evaluator => "evaluator",
            Self::Responder => "responder",
        }
    }
}

impl std::str::FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "evaluator" => Ok(Self::Evaluator),
            "responder" => Ok(Self::Responder),
            other => Err(format!("unknown node type '{}'", other)),
        }
    }
}

/// What a node is asked to work on.
#[derive(Debug, Clone)]
pub struct NodeInput {
    /// The user message of the current turn.
    pub content: String,
    /// Hidden guidance handed over by the previous node or a tool result.
    pub guidance: Option<String>,
}

/// Per-invocation context.
pub struct NodeContext {
    pub instance_id: InstanceId,
    pub node_id: String,
    /// Snapshot taken when the node starts.
    pub settings: ToolConfirmationSettings,
    pub cancel: CancellationToken,
    pub emitter: StepEmitter,
}

/// A node's result. Producers never touch instance state; the executor applies this.
#[derive(Debug)]
pub struct NodeOutput {
    pub step: Step,
    /// Tool call parked for confirmation.
    pub pending: Option<PendingToolExecution>,
    /// Guidance for the next node the router selects.
    pub carry_guidance: Option<String>,
}

impl NodeOutput {
    pub fn new(step: Step) -> Self {
        Self {
            step,
            pending: None,
            carry_guidance: None,
        }
    }
}

/// A step-producing capability.
///
/// Returns `Err` only for cancellation. Model and tool failures are folded into
/// the produced step.
pub trait StepProducer: Send + Sync {
    fn kind(&self) -> NodeKind;

    fn produce<'a>(
        &'a self,
        input: NodeInput,
        ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<NodeOutput>>;
}

/// Accumulator for streaming tool call deltas.
#[derive(Debug, Default, Clone)]
pub(crate) struct ToolCallAccumulator {
    pub id: String,
    pub name: String,
    pub input_json: String,
}

impl ToolCallAccumulator {
    /// Parsed input; empty or malformed arguments become an empty object.
    pub fn input(&self) -> serde_json::Value {
        match serde_json::from_str::<serde_json::Value>(&self.input_json) {
            Ok(v @ serde_json::Value::Object(_)) => v,
            Ok(serde_json::Value::Null) | Err(_) if self.input_json.trim().is_empty() => {
                serde_json::json!({})
            }
            Ok(other) => serde_json::json!({ "value": other }),
            Err(_) => serde_json::json!({ "raw": self.input_json }),
        }
    }
}

/// Everything a model stream produced.
#[derive(Debug, Default)]
pub(crate) struct Collected {
    pub text: String,
    pub thinking: String,
    pub tool_calls: Vec<ToolCallAccumulator>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Set when the stream failed after it started.
    pub stream_error: Option<String>,
}

/// Drain a model stream, checking for cancellation between deltas.
///
/// `on_text` sees every text delta as it arrives.
pub(crate) async fn collect_stream<F, Fut>(
    mut stream: BoxStream<'_, Result<StreamDelta>>,
    cancel: &CancellationToken,
    mut on_text: F,
) -> Result<Collected>
where
    F: FnMut(String) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut out = Collected::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GatehouseError::Cancelled),
            next = stream.next() => next,
        };
        let Some(delta) = next else { break };

        match delta {
            Ok(StreamDelta::TextDelta(text)) => {
                out.text.push_str(&text);
                on_text(text).await;
            }
            Ok(StreamDelta::ThinkingDelta(text)) => out.thinking.push_str(&text),
            Ok(StreamDelta::ToolUseStart { index, id, name }) => {
                while out.tool_calls.len() <= index {
                    out.tool_calls.push(ToolCallAccumulator::default());
                }
                out.tool_calls[index].id = id;
                out.tool_calls[index].name = name;
            }
            Ok(StreamDelta::ToolInputDelta { index, delta }) => {
                if let Some(tc) = out.tool_calls.get_mut(index) {
                    tc.input_json.push_str(&delta);
                }
            }
            Ok(StreamDelta::Stop(_)) => {}
            Ok(StreamDelta::Usage {
                input_tokens,
                output_tokens,
            }) => {
                out.input_tokens += input_tokens;
                out.output_tokens += output_tokens;
            }
            Err(e) => {
                out.stream_error = Some(e.to_string());
                break;
            }
        }
    }

    out.tool_calls.retain(|tc| !tc.name.is_empty());
    Ok(out)
}
