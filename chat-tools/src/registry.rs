use crate::error::{Result, ToolError};
use crate::traits::{ApprovalMode, Tool, ToolContext, ToolSpec};
use chat_llm::ToolDefinition;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Closed set of tools the agent knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ToolId {
    #[serde(rename = "getWeatherInformation")]
    GetWeatherInformation,
    #[serde(rename = "getLocalTime")]
    GetLocalTime,
    #[serde(rename = "scheduleTask")]
    ScheduleTask,
    #[serde(rename = "getScheduledTasks")]
    GetScheduledTasks,
    #[serde(rename = "cancelScheduledTask")]
    CancelScheduledTask,
}

impl ToolId {
    pub const ALL: [ToolId; 5] = [
        ToolId::GetWeatherInformation,
        ToolId::GetLocalTime,
        ToolId::ScheduleTask,
        ToolId::GetScheduledTasks,
        ToolId::CancelScheduledTask,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetWeatherInformation => "getWeatherInformation",
            Self::GetLocalTime => "getLocalTime",
            Self::ScheduleTask => "scheduleTask",
            Self::GetScheduledTasks => "getScheduledTasks",
            Self::CancelScheduledTask => "cancelScheduledTask",
        }
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolId {
    type Err = ToolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| ToolError::UnknownTool(s.to_string()))
    }
}

pub struct ToolDescriptor {
    pub id: ToolId,
    pub description: String,
    pub parameters_schema: serde_json::Value,
    pub approval: ApprovalMode,
    executor: Option<Arc<dyn Tool>>,
}

impl ToolDescriptor {
    pub fn name(&self) -> &'static str {
        self.id.as_str()
    }

    pub fn requires_confirmation(&self) -> bool {
        self.approval.requires_confirmation()
    }

    pub fn has_executor(&self) -> bool {
        self.executor.is_some()
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description.clone(),
            parameters: self.parameters_schema.clone(),
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(tool = %self.id))]
    pub async fn execute(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let Some(executor) = self.executor.as_ref() else {
            return Err(ToolError::ExecutionFailed(format!(
                "tool {} has no executor",
                self.id
            )));
        };
        executor.execute(ctx, arguments).await
    }
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("id", &self.id)
            .field("approval", &self.approval)
            .field("has_executor", &self.has_executor())
            .finish()
    }
}

/// Read-only table of tools, built once at startup.
#[derive(Debug)]
pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    pub fn get(&self, id: ToolId) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.id == id)
    }

    /// Resolves a model-supplied tool name. The only place names are matched as strings.
    pub fn lookup(&self, name: &str) -> Option<&ToolDescriptor> {
        let id = ToolId::from_str(name).ok()?;
        self.get(id)
    }

    pub fn requires_confirmation(&self, name: &str) -> bool {
        self.lookup(name)
            .is_some_and(ToolDescriptor::requires_confirmation)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.iter()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(ToolDescriptor::definition).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[derive(Default)]
pub struct ToolRegistryBuilder {
    entries: Vec<(ToolId, ToolSpec, Option<Arc<dyn Tool>>)>,
    overrides: HashMap<ToolId, ApprovalMode>,
}

impl ToolRegistryBuilder {
    pub fn register(mut self, id: ToolId, tool: Arc<dyn Tool>) -> Self {
        let spec = tool.spec();
        self.entries.push((id, spec, Some(tool)));
        self
    }

    /// Declares a tool the model may call but that has no executor.
    pub fn declare(mut self, id: ToolId, spec: ToolSpec) -> Self {
        self.entries.push((id, spec, None));
        self
    }

    pub fn approval_overrides(mut self, overrides: &HashMap<ToolId, ApprovalMode>) -> Self {
        self.overrides
            .extend(overrides.iter().map(|(id, mode)| (*id, *mode)));
        self
    }

    pub fn build(self) -> Result<ToolRegistry> {
        let mut tools: Vec<ToolDescriptor> = Vec::with_capacity(self.entries.len());
        for (id, spec, executor) in self.entries {
            if spec.name != id.as_str() {
                return Err(ToolError::Registry(format!(
                    "tool spec name {} does not match id {id}",
                    spec.name
                )));
            }
            chat_llm::validate_tool_name(&spec.name)
                .map_err(|e| ToolError::Registry(e.to_string()))?;
            if tools.iter().any(|t| t.id == id) {
                return Err(ToolError::Registry(format!("tool {id} registered twice")));
            }
            let approval = self.overrides.get(&id).copied().unwrap_or(spec.approval);
            tools.push(ToolDescriptor {
                id,
                description: spec.description,
                parameters_schema: spec.parameters_schema,
                approval,
                executor,
            });
        }
        for id in self.overrides.keys() {
            if !tools.iter().any(|t| t.id == *id) {
                tracing::warn!(tool = %id, "approval override for unregistered tool ignored");
            }
        }
        Ok(ToolRegistry { tools })
    }
}
