use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use gatehouse_core::config::ModelConfig;
use gatehouse_core::flow::NodeSpec;
use gatehouse_core::traits::{LlmClient, TextLibrary};
use gatehouse_tools::ToolRegistry;

use crate::node::evaluator::EvaluatorNode;
use crate::node::responder::ResponderNode;
use crate::node::{NodeKind, StepProducer};

/// Everything a node needs from the outside world. Shared read-only by all instances.
#[derive(Clone)]
pub struct Capabilities {
    pub llm: Arc<dyn LlmClient>,
    pub model: ModelConfig,
    pub tools: Arc<ToolRegistry>,
    pub library: Arc<dyn TextLibrary>,
}

impl Capabilities {
    pub fn new(llm: Arc<dyn LlmClient>, model: ModelConfig, tools: Arc<ToolRegistry>) -> Self {
        Self {
            llm,
            model,
            tools,
            library: Arc::new(HashMap::<String, String>::new()),
        }
    }

    pub fn with_library(mut self, library: Arc<dyn TextLibrary>) -> Self {
        self.library = library;
        self
    }

    /// Inline text wins; otherwise look the id up in the library.
    fn resolve_text(
        &self,
        node_id: &str,
        what: &str,
        inline: Option<&str>,
        id: Option<&str>,
    ) -> Result<String, String> {
        if let Some(text) = inline.filter(|t| !t.trim().is_empty()) {
            return Ok(text.to_string());
        }
        match id {
            Some(id) => self
                .library
                .get(id)
                .ok_or_else(|| format!("node '{}': {} '{}' not found in library", node_id, what, id)),
            None => Err(format!("node '{}': missing {}", node_id, what)),
        }
    }

    /// Construct the step producer for one node, or every problem found with its config.
    pub fn producer(
        &self,
        node_id: &str,
        kind: NodeKind,
        spec: &NodeSpec,
    ) -> Result<Arc<dyn StepProducer>, Vec<String>> {
        let config = &spec.config;
        let mut errors = Vec::new();

        match kind {
            NodeKind::Evaluator => {
                let constitution = self.resolve_text(
                    node_id,
                    "constitution",
                    config.constitution.as_deref(),
                    config.constitution_id.as_deref(),
                );
                let mut patterns = Vec::new();
                for pattern in &config.blocked_patterns {
                    match Regex::new(pattern) {
                        Ok(re) => patterns.push(re),
                        Err(e) => errors.push(format!(
                            "node '{}': invalid blocked pattern '{}': {}",
                            node_id, pattern, e
                        )),
                    }
                }
                match constitution {
                    Ok(constitution) if errors.is_empty() => Ok(Arc::new(EvaluatorNode::new(
                        node_id,
                        constitution,
                        patterns,
                        self.llm.clone(),
                        self.model.clone(),
                    ))),
                    Ok(_) => Err(errors),
                    Err(e) => {
                        errors.insert(0, e);
                        Err(errors)
                    }
                }
            }
            NodeKind::Responder => {
                let prompt = self.resolve_text(
                    node_id,
                    "system prompt",
                    config.system_prompt.as_deref(),
                    config.system_prompt_id.as_deref(),
                );
                for tool in &config.tools {
                    if !self.tools.contains(tool) {
                        errors.push(format!("node '{}': unknown tool '{}'", node_id, tool));
                    }
                }
                match prompt {
                    Ok(prompt) if errors.is_empty() => Ok(Arc::new(ResponderNode::new(
                        node_id,
                        prompt,
                        config.tools.clone(),
                        self.llm.clone(),
                        self.model.clone(),
                        self.tools.clone(),
                    ))),
                    Ok(_) => Err(errors),
                    Err(e) => {
                        errors.insert(0, e);
                        Err(errors)
                    }
                }
            }
        }
    }
}
