use thiserror::Error;

pub type Result<T> = std::result::Result<T, ToolError>;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("tool timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("invalid registry: {0}")]
    Registry(String),
}

impl From<serde_json::Error> for ToolError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidArguments(e.to_string())
    }
}
