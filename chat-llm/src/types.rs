use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declares a string-backed identifier newtype.
#[macro_export]
macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, ::serde::Serialize, ::serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl ::std::ops::Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(MessageId);
id_newtype!(CallId);
id_newtype!(ConversationId);

impl MessageId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl CallId {
    pub fn generate() -> Self {
        Self(format!("call_{}", uuid::Uuid::new_v4().simple()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Lifecycle of a single tool invocation.
///
/// `InputStreaming` and `InputAvailable` are transient states seen while the
/// model is still producing the call. `AwaitingConfirmation` is the only
/// non-terminal state that may be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvocationState {
    InputStreaming,
    InputAvailable,
    AwaitingConfirmation,
    Executed,
    Failed,
    Denied,
}

impl InvocationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Executed | Self::Failed | Self::Denied)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ToolOutcome {
    Output { value: serde_json::Value },
    Error { message: String },
    Denied { message: String },
}

impl ToolOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// The invocation state this outcome moves its invocation into.
    pub fn terminal_state(&self) -> InvocationState {
        match self {
            Self::Output { .. } => InvocationState::Executed,
            Self::Error { .. } => InvocationState::Failed,
            Self::Denied { .. } => InvocationState::Denied,
        }
    }

    /// Serialized form handed back to the model as the tool message body.
    pub fn to_model_content(&self) -> String {
        match self {
            Self::Output { value } => match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            Self::Error { message } => serde_json::json!({ "error": message }).to_string(),
            Self::Denied { message } => serde_json::json!({ "denied": message }).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub call_id: CallId,
    pub tool_name: String,
    pub input: serde_json::Value,
    pub state: InvocationState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: CallId,
    pub tool_name: String,
    pub outcome: ToolOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text { text: String },
    ToolInvocation(ToolInvocation),
    ToolResult(ToolResult),
    /// A user-authored approve/deny for a pending invocation.
    Decision { call_id: CallId, approve: bool },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn is_tool_part(&self) -> bool {
        matches!(self, Self::ToolInvocation(_) | Self::ToolResult(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "MessageId::generate")]
    pub id: MessageId,
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<Part>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            id: MessageId::generate(),
            role,
            parts,
            created_at: Utc::now(),
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![Part::text(text)])
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.parts.iter().filter_map(|p| match p {
            Part::ToolInvocation(inv) => Some(inv),
            _ => None,
        })
    }

    pub fn results(&self) -> impl Iterator<Item = &ToolResult> {
        self.parts.iter().filter_map(|p| match p {
            Part::ToolResult(r) => Some(r),
            _ => None,
        })
    }

    pub fn decision_for(&self, call_id: &CallId) -> Option<bool> {
        self.parts.iter().find_map(|p| match p {
            Part::Decision {
                call_id: id,
                approve,
            } if id == call_id => Some(*approve),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    AwaitingConfirmation,
    RoundTripLimit,
}

/// Incremental unit streamed to the client during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutputPart {
    Start {
        message_id: MessageId,
    },
    StepStart {
        round: u32,
    },
    TextDelta {
        delta: String,
    },
    ToolInputAvailable {
        call_id: CallId,
        tool_name: String,
        input: serde_json::Value,
    },
    ToolApprovalRequested {
        call_id: CallId,
        tool_name: String,
        input: serde_json::Value,
    },
    ToolOutput {
        call_id: CallId,
        tool_name: String,
        outcome: ToolOutcome,
    },
    Finish {
        reason: FinishReason,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// Create a `ToolDefinition` after validating the name against provider constraints.
    pub fn validated(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> crate::error::Result<Self> {
        let name = name.into();
        crate::client::validate_tool_name(&name)?;
        Ok(Self {
            name,
            description: description.into(),
            parameters,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// One event of a single model round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamChunk {
    Delta { content: String },
    ToolCallStart { index: u32, id: String, name: String },
    ToolCallDelta { index: u32, arguments: String },
    Done { usage: Usage },
}
