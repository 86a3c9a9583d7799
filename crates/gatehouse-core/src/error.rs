use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatehouseError {
    // Definition errors
    #[error("Flow definition error: {0}")]
    Definition(String),

    #[error("Flow definition not found: {0}")]
    DefinitionNotFound(String),

    // Instance errors
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Pending tool execution not found: {execution_id} (instance {instance_id})")]
    PendingNotFound {
        instance_id: String,
        execution_id: String,
    },

    #[error("Instance {0} already has an execution in flight")]
    InstanceBusy(String),

    #[error("Invalid instance state: {0}")]
    InvalidState(String),

    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    #[error("Execution cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatehouseError {
    /// True for the not-found family, which callers usually surface as 404.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::DefinitionNotFound(_) | Self::InstanceNotFound(_) | Self::PendingNotFound { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, GatehouseError>;
