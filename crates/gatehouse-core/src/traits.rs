use std::collections::HashMap;

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::flow::FlowDefinition;
use crate::instance::InstanceRecord;
use crate::types::*;

/// Streaming chat completion client.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// An invocable side effect a responder may request.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in LLM tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with given input and context.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Durable storage for flow definitions and instance state.
///
/// Implementations must treat step history as append-only: saving a record
/// whose history extends what is stored adds the new steps and leaves the
/// stored ones untouched.
pub trait InstanceStore: Send + Sync + 'static {
    fn save_definition(&self, def: &FlowDefinition) -> BoxFuture<'_, Result<()>>;

    fn load_definition(&self, id: &str) -> BoxFuture<'_, Result<Option<FlowDefinition>>>;

    fn list_definitions(&self) -> BoxFuture<'_, Result<Vec<FlowDefinition>>>;

    fn save_instance(&self, record: &InstanceRecord) -> BoxFuture<'_, Result<()>>;

    fn load_instance(&self, id: &InstanceId) -> BoxFuture<'_, Result<Option<InstanceRecord>>>;

    /// Returns true if the instance existed.
    fn delete_instance(&self, id: &InstanceId) -> BoxFuture<'_, Result<bool>>;

    fn list_instances(&self) -> BoxFuture<'_, Result<Vec<InstanceId>>>;
}

/// Read-only lookup of constitutions and system prompts by id.
pub trait TextLibrary: Send + Sync + 'static {
    fn get(&self, id: &str) -> Option<String>;
}

impl TextLibrary for HashMap<String, String> {
    fn get(&self, id: &str) -> Option<String> {
        HashMap::get(self, id).cloned()
    }
}
