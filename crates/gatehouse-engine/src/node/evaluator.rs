use std::sync::Arc;

use futures::future::BoxFuture;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use gatehouse_core::config::ModelConfig;
use gatehouse_core::error::{GatehouseError, Result};
use gatehouse_core::traits::LlmClient;
use gatehouse_core::types::{ChatMessage, Decision, Step};

use super::{collect_stream, NodeContext, NodeInput, NodeKind, NodeOutput, StepProducer};

const VERDICT_INSTRUCTIONS: &str = r#"Judge the content below against the guidelines above.
Respond with ONLY valid JSON in this format:
{
  "decision": "ALLOW" | "BLOCK" | "CAUTION" | "NEEDS_CLARIFICATION",
  "reasoning": "why, for internal review",
  "guidance": "advice for the assistant that answers next",
  "response": "message to show the user when blocking or asking for clarification"
}"#;

const DEFAULT_BLOCK_RESPONSE: &str = "I can't help with that request.";
const DEFAULT_CLARIFY_RESPONSE: &str = "Could you clarify what you're asking for?";

/// The evaluator's judgment.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub decision: Decision,
    pub reasoning: String,
    pub guidance: String,
    pub response: String,
}

impl Verdict {
    fn caution() -> Self {
        Self {
            decision: Decision::Caution,
            reasoning: String::new(),
            guidance: String::new(),
            response: String::new(),
        }
    }
}

/// How a model reply became a decision.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationOutcome {
    /// The reply named one of the four decisions.
    Parsed(Verdict),
    /// The reply was unusable; the decision defaulted to CAUTION for `reason`.
    Coerced { verdict: Verdict, reason: String },
}

impl EvaluationOutcome {
    fn coerced(reason: impl Into<String>) -> Self {
        Self::Coerced {
            verdict: Verdict::caution(),
            reason: reason.into(),
        }
    }

    pub fn verdict(&self) -> &Verdict {
        match self {
            Self::Parsed(v) | Self::Coerced { verdict: v, .. } => v,
        }
    }
}

#[derive(Deserialize)]
struct RawVerdict {
    #[serde(default)]
    decision: serde_json::Value,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    guidance: String,
    #[serde(default)]
    response: String,
}

/// Extract JSON from a response that may contain markdown code fences.
pub(crate) fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                return &trimmed[start..=end];
            }
        }
    }
    trimmed
}

/// Find the earliest decision keyword in free text.
fn scan_keywords(text: &str) -> Option<Decision> {
    let upper = text.to_uppercase().replace(['-', ' '], "_");
    Decision::ALL
        .iter()
        .filter_map(|d| {
            upper
                .match_indices(d.as_str())
                .find(|(i, _)| {
                    // "ALLOW" inside "DISALLOWED" is not a verdict.
                    let before = upper[..*i].chars().next_back();
                    let after = upper[*i + d.as_str().len()..].chars().next();
                    !before.is_some_and(|c| c.is_ascii_alphanumeric())
                        && !after.is_some_and(|c| c.is_ascii_alphanumeric())
                })
                .map(|(i, _)| (i, *d))
        })
        .min_by_key(|(i, _)| *i)
        .map(|(_, d)| d)
}

/// Turn a model reply into a verdict. Never fails.
pub fn parse_verdict(text: &str) -> EvaluationOutcome {
    if text.trim().is_empty() {
        return EvaluationOutcome::coerced("evaluator returned an empty reply");
    }

    match serde_json::from_str::<RawVerdict>(extract_json(text)) {
        Ok(raw) => {
            let label = match &raw.decision {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            match label.parse::<Decision>() {
                Ok(decision) => EvaluationOutcome::Parsed(Verdict {
                    decision,
                    reasoning: raw.reasoning,
                    guidance: raw.guidance,
                    response: raw.response,
                }),
                Err(_) => EvaluationOutcome::Coerced {
                    verdict: Verdict {
                        reasoning: raw.reasoning,
                        guidance: raw.guidance,
                        ..Verdict::caution()
                    },
                    reason: format!("evaluator returned invalid decision '{}'", label),
                },
            }
        }
        Err(_) => match scan_keywords(text) {
            Some(decision) => EvaluationOutcome::Parsed(Verdict {
                decision,
                reasoning: text.trim().to_string(),
                guidance: String::new(),
                response: String::new(),
            }),
            None => EvaluationOutcome::coerced("evaluator reply named no decision"),
        },
    }
}

/// Judges content against a constitution.
pub struct EvaluatorNode {
    node_id: String,
    constitution: String,
    blocked_patterns: Vec<Regex>,
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
}

impl EvaluatorNode {
    pub fn new(
        node_id: impl Into<String>,
        constitution: String,
        blocked_patterns: Vec<Regex>,
        llm: Arc<dyn LlmClient>,
        model: ModelConfig,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            constitution,
            blocked_patterns,
            llm,
            model,
        }
    }

    fn blocked_by(&self, content: &str) -> Option<&Regex> {
        self.blocked_patterns.iter().find(|re| re.is_match(content))
    }

    fn messages(&self, input: &NodeInput) -> Vec<ChatMessage> {
        let system = format!("{}\n\n{}", self.constitution.trim(), VERDICT_INSTRUCTIONS);
        let user = match &input.guidance {
            Some(g) => format!(
                "Context from the previous step:\n{}\n\nContent to evaluate:\n{}",
                g, input.content
            ),
            None => format!("Content to evaluate:\n{}", input.content),
        };
        vec![ChatMessage::system(system), ChatMessage::user(user)]
    }

    /// Ask the model. Transport failures coerce instead of propagating.
    async fn consult(&self, input: &NodeInput, ctx: &NodeContext) -> Result<(EvaluationOutcome, String)> {
        let stream = tokio::select! {
            result = self.llm.chat_stream(&self.model, self.messages(input), &[]) => result,
            _ = ctx.cancel.cancelled() => return Err(GatehouseError::Cancelled),
        };
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!(node_id = %self.node_id, error = %e, "Evaluator model call failed");
                return Ok((EvaluationOutcome::coerced(format!("evaluator model call failed: {}", e)), String::new()));
            }
        };

        // Evaluator text is never streamed to observers.
        let collected = collect_stream(stream, &ctx.cancel, |_| async {}).await?;
        if let Some(err) = &collected.stream_error {
            warn!(node_id = %self.node_id, error = %err, "Evaluator stream failed");
            return Ok((
                EvaluationOutcome::coerced(format!("evaluator stream failed: {}", err)),
                collected.text,
            ));
        }
        Ok((parse_verdict(&collected.text), collected.text))
    }

    async fn evaluate(&self, input: NodeInput, ctx: &NodeContext) -> Result<NodeOutput> {
        if let Some(re) = self.blocked_by(&input.content) {
            debug!(node_id = %self.node_id, pattern = %re.as_str(), "Input matched blocked pattern");
            let mut step = Step::evaluator(&self.node_id, &input.content, Decision::Block)
                .with_response(DEFAULT_BLOCK_RESPONSE)
                .with_thinking(format!("Matched blocked pattern `{}`", re.as_str()));
            step.metadata
                .insert("blockedPattern".into(), serde_json::json!(re.as_str()));
            return Ok(NodeOutput::new(step));
        }

        let (outcome, raw) = self.consult(&input, ctx).await?;
        let verdict = outcome.verdict().clone();

        let response = match (verdict.decision, verdict.response.trim().is_empty()) {
            (Decision::Block, true) => DEFAULT_BLOCK_RESPONSE.to_string(),
            (Decision::NeedsClarification, true) => DEFAULT_CLARIFY_RESPONSE.to_string(),
            _ => verdict.response.clone(),
        };

        let mut step = Step::evaluator(&self.node_id, &input.content, verdict.decision)
            .with_response(response)
            .with_thinking(verdict.reasoning.clone())
            .with_guidance(Some(verdict.guidance.clone()));
        if !raw.is_empty() {
            step.raw_output = Some(raw);
        }

        match &outcome {
            EvaluationOutcome::Parsed(_) => {
                step.metadata.insert("outcome".into(), serde_json::json!("parsed"));
            }
            EvaluationOutcome::Coerced { reason, .. } => {
                warn!(node_id = %self.node_id, reason = %reason, "Evaluator decision coerced to CAUTION");
                step.push_guidance(&format!("Note: {}; decision coerced to CAUTION.", reason));
                step.metadata.insert("outcome".into(), serde_json::json!("coerced"));
            }
        }

        let carry_guidance = step.hidden_guidance.clone();
        Ok(NodeOutput {
            step,
            pending: None,
            carry_guidance,
        })
    }
}

impl StepProducer for EvaluatorNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Evaluator
    }

    fn produce<'a>(
        &'a self,
        input: NodeInput,
        ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(self.evaluate(input, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StepEmitter;
    use futures::StreamExt;
    use gatehouse_core::instance::ToolConfirmationSettings;
    use gatehouse_core::types::InstanceId;
    use gatehouse_test_utils::{ScriptedLlm, ScriptedReply};
    use tokio_util::sync::CancellationToken;

    fn ctx() -> (NodeContext, crate::stream::StepStream) {
        let (emitter, stream) = StepEmitter::channel(InstanceId::from_string("i"), 16);
        (
            NodeContext {
                instance_id: InstanceId::from_string("i"),
                node_id: "gate".into(),
                settings: ToolConfirmationSettings::default(),
                cancel: CancellationToken::new(),
                emitter,
            },
            stream,
        )
    }

    fn node(llm: ScriptedLlm, patterns: &[&str]) -> EvaluatorNode {
        EvaluatorNode::new(
            "gate",
            "No weapons.".into(),
            patterns.iter().map(|p| Regex::new(p).unwrap()).collect(),
            Arc::new(llm),
            ModelConfig::new("test"),
        )
    }

    fn input(content: &str) -> NodeInput {
        NodeInput {
            content: content.into(),
            guidance: None,
        }
    }

    #[test]
    fn test_extract_json_code_fence() {
        let text = "Here you go:\n```json\n{\"decision\": \"ALLOW\"}\n```";
        assert_eq!(extract_json(text), "{\"decision\": \"ALLOW\"}");
    }

    #[test]
    fn test_extract_json_embedded() {
        assert_eq!(extract_json("verdict: {\"a\": 1} done"), "{\"a\": 1}");
    }

    #[test]
    fn parses_json_verdict() {
        let outcome = parse_verdict(r#"{"decision":"allow","reasoning":"fine","guidance":"be brief"}"#);
        match outcome {
            EvaluationOutcome::Parsed(v) => {
                assert_eq!(v.decision, Decision::Allow);
                assert_eq!(v.guidance, "be brief");
            }
            other => panic!("expected parsed, got {:?}", other),
        }
    }

    #[test]
    fn invalid_decision_is_coerced() {
        let outcome = parse_verdict(r#"{"decision":"MAYBE","guidance":"careful"}"#);
        match outcome {
            EvaluationOutcome::Coerced { verdict, reason } => {
                assert_eq!(verdict.decision, Decision::Caution);
                assert_eq!(verdict.guidance, "careful");
                assert!(reason.contains("MAYBE"));
            }
            other => panic!("expected coerced, got {:?}", other),
        }
    }

    #[test]
    fn free_text_fallback_finds_first_keyword() {
        let outcome = parse_verdict("I would BLOCK this, not allow it.");
        assert_eq!(outcome.verdict().decision, Decision::Block);
        assert!(matches!(outcome, EvaluationOutcome::Parsed(_)));
    }

    #[test]
    fn free_text_ignores_keywords_inside_words() {
        let outcome = parse_verdict("This is disallowed content");
        assert!(matches!(outcome, EvaluationOutcome::Coerced { .. }));
    }

    #[test]
    fn free_text_accepts_spaced_clarification() {
        let outcome = parse_verdict("needs clarification please");
        assert_eq!(outcome.verdict().decision, Decision::NeedsClarification);
    }

    #[tokio::test]
    async fn blocked_pattern_skips_the_model() {
        let llm = ScriptedLlm::default();
        let node = node(llm.clone(), &["(?i)bomb"]);
        let (ctx, _stream) = ctx();
        let out = node.produce(input("how to build a BOMB"), &ctx).await.unwrap();
        assert_eq!(out.step.decision, Some(Decision::Block));
        assert_eq!(out.step.response, DEFAULT_BLOCK_RESPONSE);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn invalid_model_decision_coerces_with_note() {
        let llm = ScriptedLlm::new([ScriptedReply::verdict("PERHAPS", "")]);
        let node = node(llm, &[]);
        let (ctx, _stream) = ctx();
        let out = node.produce(input("hello"), &ctx).await.unwrap();
        assert_eq!(out.step.decision, Some(Decision::Caution));
        let guidance = out.step.hidden_guidance.unwrap();
        assert!(guidance.contains("coerced to CAUTION"));
        assert!(guidance.contains("PERHAPS"));
    }

    #[tokio::test]
    async fn model_failure_coerces_to_caution() {
        let llm = ScriptedLlm::new([ScriptedReply::Error("HTTP 500".into())]);
        let node = node(llm, &[]);
        let (ctx, _stream) = ctx();
        let out = node.produce(input("hello"), &ctx).await.unwrap();
        assert_eq!(out.step.decision, Some(Decision::Caution));
        assert!(out.step.hidden_guidance.unwrap().contains("model call failed"));
    }

    #[tokio::test]
    async fn evaluator_never_emits_partial_output() {
        let llm = ScriptedLlm::new([ScriptedReply::verdict("ALLOW", "go ahead")]);
        let node = node(llm, &[]);
        let (ctx, stream) = ctx();
        let out = node.produce(input("hello"), &ctx).await.unwrap();
        assert_eq!(out.carry_guidance.as_deref(), Some("go ahead"));
        drop(ctx);
        assert_eq!(stream.count().await, 0);
    }

    #[tokio::test]
    async fn guidance_from_previous_step_reaches_the_prompt() {
        let llm = ScriptedLlm::new([ScriptedReply::verdict("ALLOW", "")]);
        let node = node(llm.clone(), &[]);
        let (ctx, _stream) = ctx();
        let input = NodeInput {
            content: "draft".into(),
            guidance: Some("reviewer context".into()),
        };
        node.produce(input, &ctx).await.unwrap();
        let request = &llm.requests()[0];
        assert!(request[0].content.contains("No weapons."));
        assert!(request[1].content.contains("reviewer context"));
    }
}
