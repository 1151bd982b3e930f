//! Conversation data model and streaming model client for the chat agent.
//!
//! The orchestrator only sees [`ModelClient`]; [`LlmClient`] is the
//! OpenAI-compatible HTTP implementation used by the binary.

mod client;
mod error;
mod openai;
mod types;

pub use client::{ChunkStream, LlmClient, ModelClient, ModelRequest, validate_tool_name};
pub use error::{LlmError, Result};
pub use types::{
    CallId, ConversationId, FinishReason, InvocationState, Message, MessageId, OutputPart, Part,
    Role, StreamChunk, ToolDefinition, ToolInvocation, ToolOutcome, ToolResult, Usage,
};
