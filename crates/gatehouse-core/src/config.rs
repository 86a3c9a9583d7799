use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GatehouseError, Result};
use crate::instance::ToolConfirmationSettings;

/// Top-level Gatehouse configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub library: LibraryConfig,
    /// Directory of `*.json` flow definitions registered at startup.
    #[serde(default)]
    pub flows_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on node executions per `send`/`resume` call.
    #[serde(default = "default_max_steps_per_run")]
    pub max_steps_per_run: usize,
    /// Capacity of the per-run event channel.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    /// Initial `confirmAll` for new instances.
    #[serde(default = "default_confirm_all")]
    pub confirm_all_by_default: bool,
    /// Initial `exemptedTools` for new instances.
    #[serde(default)]
    pub exempted_tools: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps_per_run: default_max_steps_per_run(),
            stream_buffer: default_stream_buffer(),
            confirm_all_by_default: default_confirm_all(),
            exempted_tools: vec![],
        }
    }
}

impl EngineConfig {
    /// Tool confirmation settings a new instance starts with.
    pub fn initial_settings(&self) -> ToolConfirmationSettings {
        ToolConfirmationSettings {
            confirm_all: self.confirm_all_by_default,
            exempted_tools: self.exempted_tools.iter().cloned().collect(),
        }
    }
}

fn default_max_steps_per_run() -> usize { 25 }
fn default_stream_buffer() -> usize { 64 }
fn default_confirm_all() -> bool { true }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl ModelConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            provider: default_provider(),
            model_id: model_id.into(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            retry: None,
        }
    }
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path. `~/` is expanded.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "~/.gatehouse/gatehouse.db".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Timeout applied to every tool call, overriding shorter tool defaults.
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout(),
        }
    }
}

fn default_tool_timeout() -> u64 { 30 }

/// Constitutions and system prompts addressable by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Inline texts keyed by id.
    #[serde(default)]
    pub texts: HashMap<String, String>,
    /// Directory of `<id>.md` / `<id>.txt` files.
    #[serde(default)]
    pub dir: Option<String>,
}

impl LibraryConfig {
    /// Collect inline texts plus every `.md`/`.txt` file in `dir`.
    /// Inline entries win on id collisions.
    pub fn load_texts(&self) -> Result<HashMap<String, String>> {
        let mut texts = HashMap::new();
        if let Some(dir) = &self.dir {
            let dir = expand_home(dir);
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                let is_text = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e == "md" || e == "txt");
                if !is_text {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    texts.insert(stem.to_string(), std::fs::read_to_string(&path)?);
                }
            }
        }
        texts.extend(self.texts.clone());
        Ok(texts)
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| GatehouseError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded)
            .map_err(|e| GatehouseError::Config(e.to_string()))
    }

    /// Resolve the store path (expand ~).
    pub fn store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }

    pub fn flows_dir(&self) -> Option<PathBuf> {
        self.flows_dir.as_deref().map(expand_home)
    }
}

/// Expand a leading `~/` to `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
