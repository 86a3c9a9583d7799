use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use gatehouse_core::config::ModelConfig;
use gatehouse_core::error::{GatehouseError, Result};
use gatehouse_core::instance::PendingToolExecution;
use gatehouse_core::traits::LlmClient;
use gatehouse_core::types::{ChatMessage, ResponderStatus, Step, ToolContext, ToolUsage};
use gatehouse_tools::ToolRegistry;

use super::{collect_stream, NodeContext, NodeInput, NodeKind, NodeOutput, StepProducer};

const ROUTING_INSTRUCTIONS: &str = "When you are done, you may end your reply with one line \
`NEXT_STATUS: <COMPLETE|NEEDS_RESEARCH|NEEDS_REVIEW|ERROR>` or `NEXT_AGENT: <node id>` \
to say what should happen next. Use at most one tool per reply.";

const FAILURE_RESPONSE: &str = "Sorry, I couldn't produce a response.";

/// A trailing routing line in a responder reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Status(ResponderStatus),
    Agent(String),
    /// A `NEXT_STATUS` line naming no status the model may choose.
    Invalid(String),
}

/// Parse a single line as a routing directive.
pub fn parse_directive(line: &str) -> Option<Directive> {
    let line = line.trim();
    let (key, value) = line.split_once(':')?;
    let value = value.trim().trim_matches('`').trim();
    match key.trim().trim_matches('`').to_ascii_uppercase().as_str() {
        "NEXT_STATUS" => Some(match value.parse::<ResponderStatus>() {
            // Only the engine parks a call for confirmation.
            Ok(ResponderStatus::AwaitingToolConfirmation) | Err(_) => {
                Directive::Invalid(value.to_string())
            }
            Ok(status) => Directive::Status(status),
        }),
        "NEXT_AGENT" if !value.is_empty() => Some(Directive::Agent(value.to_string())),
        _ => None,
    }
}

/// Split the last non-blank line off as a directive, if it is one.
pub fn split_directive(text: &str) -> (String, Option<Directive>) {
    let trimmed = text.trim_end();
    let (head, last) = match trimmed.rfind('\n') {
        Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
        None => ("", trimmed),
    };
    match parse_directive(last) {
        Some(directive) => (head.trim_end().to_string(), Some(directive)),
        None => (trimmed.to_string(), None),
    }
}

/// Holds back lines that may be routing directives so they never reach
/// observers. A directive line is released after all if visible text follows it.
#[derive(Default)]
struct DirectiveFilter {
    line: String,
    /// Part of the current line was already released.
    released: bool,
    /// A complete directive line plus any blank lines after it.
    held: String,
}

const DIRECTIVE_KEYS: [&str; 2] = ["NEXT_STATUS:", "NEXT_AGENT:"];

fn could_be_directive(partial: &str) -> bool {
    let t = partial.trim_start().to_ascii_uppercase();
    DIRECTIVE_KEYS
        .iter()
        .any(|k| k.starts_with(t.as_str()) || t.starts_with(k))
}

impl DirectiveFilter {
    fn release(&mut self, out: &mut String, text: &str) {
        out.push_str(&std::mem::take(&mut self.held));
        out.push_str(text);
    }

    fn end_line(&mut self, out: &mut String) {
        let line = std::mem::take(&mut self.line);
        if self.released {
            out.push_str(&line);
        } else if parse_directive(&line).is_some() {
            out.push_str(&std::mem::take(&mut self.held));
            self.held = line;
        } else if line.trim().is_empty() && !self.held.is_empty() {
            self.held.push_str(&line);
        } else {
            self.release(out, &line);
        }
        self.released = false;
    }

    fn push(&mut self, delta: &str) -> String {
        let mut out = String::new();
        for ch in delta.chars() {
            self.line.push(ch);
            if ch == '\n' {
                self.end_line(&mut out);
            }
        }
        if !self.line.is_empty() && (self.released || !could_be_directive(&self.line)) {
            let line = std::mem::take(&mut self.line);
            self.release(&mut out, &line);
            self.released = true;
        }
        out
    }

    /// Flush at end of stream. A trailing directive is dropped.
    fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.line);
        if !self.released && (rest.trim().is_empty() || parse_directive(&rest).is_some()) {
            self.held.clear();
            return String::new();
        }
        let mut out = String::new();
        self.release(&mut out, &rest);
        out
    }
}

/// Describe a parked tool call for the user.
fn describe_call(tool_name: &str, input: &serde_json::Value, execution_id: &str) -> String {
    let mut args = input.to_string();
    if args.len() > 200 {
        let cut = (0..=200).rev().find(|i| args.is_char_boundary(*i)).unwrap_or(0);
        args.truncate(cut);
        args.push_str("...");
    }
    format!(
        "I'd like to run `{}` with {}. Confirm or deny execution {} to continue.",
        tool_name, args, execution_id
    )
}

/// Produces the user-facing answer, optionally calling one tool.
pub struct ResponderNode {
    node_id: String,
    system_prompt: String,
    allowed_tools: Vec<String>,
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
    tools: Arc<ToolRegistry>,
}

impl ResponderNode {
    pub fn new(
        node_id: impl Into<String>,
        system_prompt: String,
        allowed_tools: Vec<String>,
        llm: Arc<dyn LlmClient>,
        model: ModelConfig,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            system_prompt,
            allowed_tools,
            llm,
            model,
            tools,
        }
    }

    fn messages(&self, input: &NodeInput) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(format!(
            "{}\n\n{}",
            self.system_prompt.trim(),
            ROUTING_INSTRUCTIONS
        ))];
        if let Some(g) = &input.guidance {
            messages.push(ChatMessage::system(format!(
                "Guidance for this reply (not visible to the user):\n{}",
                g
            )));
        }
        messages.push(ChatMessage::user(input.content.clone()));
        messages
    }

    fn tool_allowed(&self, name: &str) -> bool {
        self.allowed_tools.is_empty() || self.allowed_tools.iter().any(|t| t == name)
    }

    async fn respond(&self, input: NodeInput, ctx: &NodeContext) -> Result<NodeOutput> {
        let tool_defs = self.tools.definitions(&self.allowed_tools);

        let stream = tokio::select! {
            result = self.llm.chat_stream(&self.model, self.messages(&input), &tool_defs) => result,
            _ = ctx.cancel.cancelled() => return Err(GatehouseError::Cancelled),
        };
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!(node_id = %self.node_id, error = %e, "Responder model call failed");
                let mut step = Step::responder(&self.node_id, &input.content, ResponderStatus::Error)
                    .with_response(FAILURE_RESPONSE)
                    .with_guidance(input.guidance.clone());
                step.push_guidance(&format!("Note: responder model call failed: {}", e));
                return Ok(NodeOutput::new(step));
            }
        };

        let mut filter = DirectiveFilter::default();
        let emitter = &ctx.emitter;
        let node_id = self.node_id.as_str();
        let collected = collect_stream(stream, &ctx.cancel, |delta| {
            let visible = filter.push(&delta);
            async move { emitter.partial(node_id, visible).await }
        })
        .await?;
        emitter.partial(node_id, filter.finish()).await;

        let (body, directive) = split_directive(&collected.text);
        let mut step = Step::responder(&self.node_id, &input.content, ResponderStatus::Complete)
            .with_response(body.clone())
            .with_thinking(collected.thinking.clone())
            .with_guidance(input.guidance.clone());
        step.raw_output = Some(collected.text.clone());
        if collected.input_tokens + collected.output_tokens > 0 {
            step.metadata.insert(
                "usage".into(),
                serde_json::json!({
                    "inputTokens": collected.input_tokens,
                    "outputTokens": collected.output_tokens,
                }),
            );
        }

        let mut directed_status = None;
        match directive {
            Some(Directive::Status(status)) => directed_status = Some(status),
            Some(Directive::Agent(agent)) => step.next_agent = Some(agent),
            Some(Directive::Invalid(value)) => {
                step.push_guidance(&format!("Note: ignored unknown status '{}'.", value));
            }
            None => {}
        }

        if let Some(err) = &collected.stream_error {
            warn!(node_id = %self.node_id, error = %err, "Responder stream failed mid-reply");
            step.next_status = Some(ResponderStatus::Error);
            step.incomplete = true;
            step.push_guidance(&format!("Note: model stream failed: {}", err));
            if step.response.is_empty() {
                step.response = FAILURE_RESPONSE.to_string();
            }
            return Ok(NodeOutput::new(step));
        }

        if collected.tool_calls.len() > 1 {
            warn!(
                node_id = %self.node_id,
                count = collected.tool_calls.len(),
                "Model requested several tools; only the first is used"
            );
            step.metadata
                .insert("ignoredToolCalls".into(), serde_json::json!(collected.tool_calls.len() - 1));
        }

        let Some(call) = collected.tool_calls.first() else {
            step.next_status = Some(directed_status.unwrap_or(ResponderStatus::Complete));
            let carry = (!body.is_empty())
                .then(|| format!("Response from `{}`:\n{}", self.node_id, body));
            return Ok(NodeOutput {
                step,
                pending: None,
                carry_guidance: carry,
            });
        };

        let tool_name = call.name.clone();
        let tool_input = call.input();

        if self.tool_allowed(&tool_name) && ctx.settings.requires_confirmation(&tool_name) {
            let pending = PendingToolExecution::new(&tool_name, tool_input.clone(), &self.node_id);
            info!(
                instance_id = %ctx.instance_id,
                node_id = %self.node_id,
                tool = %tool_name,
                execution_id = %pending.id,
                "Tool call awaiting confirmation"
            );
            let description = describe_call(&tool_name, &tool_input, &pending.id);
            step.response = if body.is_empty() {
                description
            } else {
                format!("{}\n\n{}", body, description)
            };
            step.next_status = Some(ResponderStatus::AwaitingToolConfirmation);
            step.next_agent = None;
            step.tool_usage = Some(ToolUsage {
                tool_name,
                input: tool_input,
                output: None,
                is_error: false,
                execution_id: Some(pending.id.clone()),
            });
            return Ok(NodeOutput {
                step,
                pending: Some(pending),
                carry_guidance: None,
            });
        }

        let result = if self.tool_allowed(&tool_name) {
            debug!(node_id = %self.node_id, tool = %tool_name, "Executing tool without confirmation");
            let tool_ctx = ToolContext {
                instance_id: ctx.instance_id.clone(),
                node_id: self.node_id.clone(),
            };
            tokio::select! {
                result = self.tools.execute_folded(&tool_name, tool_input.clone(), tool_ctx) => result,
                _ = ctx.cancel.cancelled() => return Err(GatehouseError::Cancelled),
            }
        } else {
            warn!(node_id = %self.node_id, tool = %tool_name, "Model requested a tool this node may not use");
            gatehouse_core::types::ToolResult::error(format!(
                "Tool '{}' is not available to this node",
                tool_name
            ))
        };

        let carry = format!(
            "Tool `{}` was called with {} and {}:\n{}",
            tool_name,
            tool_input,
            if result.is_error { "failed" } else { "returned" },
            result.content
        );
        step.next_status = Some(directed_status.unwrap_or(ResponderStatus::NeedsTool));
        step.tool_usage = Some(ToolUsage {
            tool_name,
            input: tool_input,
            output: Some(result.content),
            is_error: result.is_error,
            execution_id: None,
        });
        Ok(NodeOutput {
            step,
            pending: None,
            carry_guidance: Some(carry),
        })
    }
}

impl StepProducer for ResponderNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Responder
    }

    fn produce<'a>(
        &'a self,
        input: NodeInput,
        ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(self.respond(input, ctx))
    }
}
