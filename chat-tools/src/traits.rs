use crate::error::{Result, ToolError};
use async_trait::async_trait;
use chat_llm::ConversationId;
use serde::{Deserialize, Serialize};

/// Whether a tool runs as soon as the model asks for it or waits for the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    Auto,
    Human,
}

impl ApprovalMode {
    pub fn requires_confirmation(self) -> bool {
        matches!(self, Self::Human)
    }
}

pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
    pub approval: ApprovalMode,
}

/// Per-call context handed to executors.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub conversation_id: ConversationId,
}

impl ToolContext {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self { conversation_id }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn execute(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value>;
}

pub(crate) fn require_string(args: &serde_json::Value, key: &str) -> Result<String> {
    let Some(v) = args.get(key) else {
        return Err(ToolError::InvalidArguments(format!("missing key: {key}")));
    };
    match v {
        serde_json::Value::String(s) if !s.trim().is_empty() => Ok(s.clone()),
        serde_json::Value::String(_) => Err(ToolError::InvalidArguments(format!(
            "key {key} must not be empty"
        ))),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be string, got {other:?}"
        ))),
    }
}

pub(crate) fn optional_string(args: &serde_json::Value, key: &str) -> Result<Option<String>> {
    let Some(v) = args.get(key) else {
        return Ok(None);
    };
    match v {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s.clone())),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be string, got {other:?}"
        ))),
    }
}

pub(crate) fn optional_u64(args: &serde_json::Value, key: &str) -> Result<Option<u64>> {
    let Some(v) = args.get(key) else {
        return Ok(None);
    };
    match v {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Number(n) => n.as_u64().map(Some).ok_or_else(|| {
            ToolError::InvalidArguments(format!("key {key} must be a non-negative integer"))
        }),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be number, got {other:?}"
        ))),
    }
}
