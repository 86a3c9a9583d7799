//! Mocks and fixtures shared by Gatehouse tests.
//!
//! [`ScriptedLlm`] replays queued replies in order, one per model call, and
//! records the messages it was sent. [`RecordingTool`] records every input it
//! receives and answers with a fixed output.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};

use gatehouse_core::config::ModelConfig;
use gatehouse_core::error::{GatehouseError, Result};
use gatehouse_core::flow::{FlowDefinition, FlowGraph, NodeConfig, NodeSpec};
use gatehouse_core::traits::{LlmClient, Tool};
use gatehouse_core::types::*;

/// One canned model reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Stream the text as a few deltas, then stop.
    Text(String),
    /// Reasoning followed by visible text.
    ThinkingThenText { thinking: String, text: String },
    /// Optional preface text, then one tool call.
    ToolCall {
        text: String,
        name: String,
        input: serde_json::Value,
    },
    /// Fail to establish the stream.
    Error(String),
    /// Emit the text, then never finish.
    Hang(String),
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn tool_call(name: impl Into<String>, input: serde_json::Value) -> Self {
        Self::ToolCall {
            text: String::new(),
            name: name.into(),
            input,
        }
    }

    /// An evaluator verdict in the JSON shape evaluators expect.
    pub fn verdict(decision: &str, guidance: &str) -> Self {
        Self::Text(
            serde_json::json!({
                "decision": decision,
                "reasoning": format!("scripted {}", decision),
                "guidance": guidance,
                "response": "",
            })
            .to_string(),
        )
    }
}

/// LLM client that replays scripted replies.
#[derive(Clone, Default)]
pub struct ScriptedLlm {
    replies: Arc<Mutex<VecDeque<ScriptedReply>>>,
    requests: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl ScriptedLlm {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into_iter().collect())),
            requests: Arc::default(),
        }
    }

    pub fn push(&self, reply: ScriptedReply) {
        if let Ok(mut q) = self.replies.lock() {
            q.push_back(reply);
        }
    }

    /// Messages of every call so far.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().map(|q| q.len()).unwrap_or_default()
    }
}

/// Split text into a handful of deltas so consumers see real streaming.
fn text_deltas(text: &str) -> Vec<Result<StreamDelta>> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(8)
        .map(|c| Ok(StreamDelta::TextDelta(c.iter().collect())))
        .collect()
}

impl LlmClient for ScriptedLlm {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        messages: Vec<ChatMessage>,
        _tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        if let Ok(mut r) = self.requests.lock() {
            r.push(messages);
        }
        let reply = self.replies.lock().ok().and_then(|mut q| q.pop_front());

        Box::pin(async move {
            let reply = reply.ok_or_else(|| GatehouseError::LlmRequest("script exhausted".into()))?;
            let stream: BoxStream<'_, Result<StreamDelta>> = match reply {
                ScriptedReply::Text(text) => {
                    let mut deltas = text_deltas(&text);
                    deltas.push(Ok(StreamDelta::Stop(StopReason::EndTurn)));
                    stream::iter(deltas).boxed()
                }
                ScriptedReply::ThinkingThenText { thinking, text } => {
                    let mut deltas = vec![Ok(StreamDelta::ThinkingDelta(thinking))];
                    deltas.extend(text_deltas(&text));
                    deltas.push(Ok(StreamDelta::Stop(StopReason::EndTurn)));
                    stream::iter(deltas).boxed()
                }
                ScriptedReply::ToolCall { text, name, input } => {
                    let mut deltas = text_deltas(&text);
                    deltas.push(Ok(StreamDelta::ToolUseStart {
                        index: 0,
                        id: "call_0".into(),
                        name,
                    }));
                    deltas.push(Ok(StreamDelta::ToolInputDelta {
                        index: 0,
                        delta: input.to_string(),
                    }));
                    deltas.push(Ok(StreamDelta::Stop(StopReason::ToolUse)));
                    stream::iter(deltas).boxed()
                }
                ScriptedReply::Error(message) => return Err(GatehouseError::LlmRequest(message)),
                ScriptedReply::Hang(text) => stream::iter(text_deltas(&text))
                    .chain(stream::pending())
                    .boxed(),
            };
            Ok(stream)
        })
    }
}

/// Tool that records its inputs and returns a fixed result.
#[derive(Clone)]
pub struct RecordingTool {
    name: String,
    output: String,
    fail: bool,
    calls: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl RecordingTool {
    pub fn new(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: output.into(),
            fail: false,
            calls: Arc::default(),
        }
    }

    /// A tool whose every call fails with `message`.
    pub fn failing(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            fail: true,
            ..Self::new(name, message)
        }
    }

    pub fn calls(&self) -> Vec<serde_json::Value> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }
}

impl Tool for RecordingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Records its input."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        if let Ok(mut c) = self.calls.lock() {
            c.push(input);
        }
        Box::pin(async move {
            if self.fail {
                Err(GatehouseError::ToolExecution {
                    tool: self.name.clone(),
                    message: self.output.clone(),
                })
            } else {
                Ok(ToolResult::success(self.output.clone()))
            }
        })
    }
}

/// `gate` (evaluator) → `assistant` (responder), the common two-node flow.
pub fn guarded_flow(id: &str) -> FlowDefinition {
    let gate = NodeSpec::new("evaluator")
        .with_config(NodeConfig {
            constitution: Some("Refuse anything harmful.".into()),
            ..Default::default()
        })
        .with_transition("ALLOW", "assistant")
        .with_transition("CAUTION", "assistant")
        .with_transition("BLOCK", "END")
        .with_transition("NEEDS_CLARIFICATION", "self");
    let assistant = NodeSpec::new("responder")
        .with_config(NodeConfig {
            system_prompt: Some("You are a helpful assistant.".into()),
            ..Default::default()
        })
        .with_transition("NEEDS_TOOL", "self")
        .with_transition("COMPLETE", "END");

    let mut nodes = std::collections::BTreeMap::new();
    nodes.insert("gate".to_string(), gate);
    nodes.insert("assistant".to_string(), assistant);
    FlowDefinition {
        id: id.to_string(),
        name: "Guarded".into(),
        graph: FlowGraph {
            start: "gate".into(),
            nodes,
        },
    }
}
