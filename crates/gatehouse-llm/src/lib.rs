pub mod openai;
pub mod retry;
pub mod streaming;

use gatehouse_core::config::ModelConfig;
use gatehouse_core::traits::LlmClient;

pub use openai::OpenAiClient;
pub use retry::RetryingClient;

/// Create an LLM client based on the provider name.
///
/// Every provider is reached through the OpenAI-compatible chat completions
/// API (OpenAI, Ollama, vLLM, Groq, OpenRouter, ...); `base_url` selects the host.
pub fn create_client(config: &ModelConfig) -> Box<dyn LlmClient> {
    tracing::debug!(provider = %config.provider, model = %config.model_id, "Creating LLM client");
    Box::new(OpenAiClient::new())
}
