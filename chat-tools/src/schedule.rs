use crate::error::{Result, ToolError};
use crate::traits::{ApprovalMode, Tool, ToolContext, ToolSpec, require_string};
use async_trait::async_trait;
use chat_llm::ConversationId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

chat_llm::id_newtype!(TaskId);

impl TaskId {
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }
}

/// When a scheduled task fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FireSpec {
    At { at: DateTime<Utc> },
    Delay { seconds: u64 },
    Cron { expression: String },
}

impl FireSpec {
    pub fn is_recurring(&self) -> bool {
        matches!(self, Self::Cron { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: TaskId,
    pub conversation_id: ConversationId,
    pub description: String,
    pub fire: FireSpec,
    pub created_at: DateTime<Utc>,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Scheduler boundary used by the scheduling tools.
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    async fn schedule(
        &self,
        conversation_id: &ConversationId,
        description: &str,
        fire: FireSpec,
    ) -> Result<ScheduledTask>;

    async fn list(&self, conversation_id: &ConversationId) -> Result<Vec<ScheduledTask>>;

    /// Returns `false` when the conversation owns no task with that id.
    async fn cancel(&self, conversation_id: &ConversationId, task_id: &TaskId) -> Result<bool>;
}

/// Parses the `when` object of a `scheduleTask` call.
///
/// Returns `Ok(None)` for `no-schedule`.
pub fn parse_when(when: &serde_json::Value) -> Result<Option<FireSpec>> {
    let kind = when
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidArguments("when.type is required".to_string()))?;
    match kind {
        "scheduled" => {
            let raw = require_string(when, "date")?;
            let at = DateTime::parse_from_rfc3339(&raw)
                .map_err(|e| {
                    ToolError::InvalidArguments(format!("when.date must be RFC 3339: {e}"))
                })?
                .with_timezone(&Utc);
            Ok(Some(FireSpec::At { at }))
        }
        "delayed" => {
            let seconds = crate::traits::optional_u64(when, "delayInSeconds")?.ok_or_else(|| {
                ToolError::InvalidArguments("when.delayInSeconds is required".to_string())
            })?;
            Ok(Some(FireSpec::Delay { seconds }))
        }
        "cron" => {
            let expression = require_string(when, "cron")?;
            Ok(Some(FireSpec::Cron { expression }))
        }
        "no-schedule" => Ok(None),
        other => Err(ToolError::InvalidArguments(format!(
            "unknown schedule type: {other}"
        ))),
    }
}

pub struct ScheduleTaskTool {
    scheduler: Arc<dyn TaskScheduler>,
}

impl ScheduleTaskTool {
    pub fn new(scheduler: Arc<dyn TaskScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Tool for ScheduleTaskTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "scheduleTask".to_string(),
            description: "Schedule a task to be executed at a later time.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "description": { "type": "string" },
                    "when": {
                        "type": "object",
                        "properties": {
                            "type": {
                                "type": "string",
                                "enum": ["scheduled", "delayed", "cron", "no-schedule"]
                            },
                            "date": { "type": "string", "description": "RFC 3339 timestamp, for type=scheduled" },
                            "delayInSeconds": { "type": "integer", "minimum": 0, "description": "for type=delayed" },
                            "cron": { "type": "string", "description": "cron expression, for type=cron" }
                        },
                        "required": ["type"]
                    }
                },
                "required": ["description", "when"]
            }),
            approval: ApprovalMode::Auto,
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let description = require_string(&arguments, "description")?;
        let when = arguments
            .get("when")
            .ok_or_else(|| ToolError::InvalidArguments("missing key: when".to_string()))?;
        let Some(fire) = parse_when(when)? else {
            return Ok(serde_json::Value::String(
                "Not a valid schedule input".to_string(),
            ));
        };

        let task = self
            .scheduler
            .schedule(&ctx.conversation_id, &description, fire)
            .await?;
        tracing::info!(task_id = %task.id, conversation_id = %ctx.conversation_id, "task scheduled");
        Ok(serde_json::json!({
            "status": "scheduled",
            "task": task,
        }))
    }
}

pub struct GetScheduledTasksTool {
    scheduler: Arc<dyn TaskScheduler>,
}

impl GetScheduledTasksTool {
    pub fn new(scheduler: Arc<dyn TaskScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Tool for GetScheduledTasksTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "getScheduledTasks".to_string(),
            description: "List all tasks that have been scheduled.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {}
            }),
            approval: ApprovalMode::Auto,
        }
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        _arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let tasks = self.scheduler.list(&ctx.conversation_id).await?;
        if tasks.is_empty() {
            return Ok(serde_json::Value::String(
                "No scheduled tasks found.".to_string(),
            ));
        }
        Ok(serde_json::to_value(tasks)?)
    }
}

pub struct CancelScheduledTaskTool {
    scheduler: Arc<dyn TaskScheduler>,
}

impl CancelScheduledTaskTool {
    pub fn new(scheduler: Arc<dyn TaskScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Tool for CancelScheduledTaskTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "cancelScheduledTask".to_string(),
            description: "Cancel a scheduled task using its ID.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "taskId": { "type": "string" }
                },
                "required": ["taskId"]
            }),
            approval: ApprovalMode::Auto,
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let task_id = TaskId::new(require_string(&arguments, "taskId")?);
        if !self.scheduler.cancel(&ctx.conversation_id, &task_id).await? {
            return Err(ToolError::ExecutionFailed(format!(
                "no scheduled task with id {task_id}"
            )));
        }
        Ok(serde_json::Value::String(format!(
            "Task {task_id} has been successfully canceled."
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingScheduler {
        tasks: Mutex<Vec<ScheduledTask>>,
    }

    #[async_trait]
    impl TaskScheduler for RecordingScheduler {
        async fn schedule(
            &self,
            conversation_id: &ConversationId,
            description: &str,
            fire: FireSpec,
        ) -> Result<ScheduledTask> {
            let task = ScheduledTask {
                id: TaskId::generate(),
                conversation_id: conversation_id.clone(),
                description: description.to_string(),
                fire,
                created_at: Utc::now(),
                next_run_at: None,
            };
            self.tasks.lock().expect("lock").push(task.clone());
            Ok(task)
        }

        async fn list(&self, conversation_id: &ConversationId) -> Result<Vec<ScheduledTask>> {
            Ok(self
                .tasks
                .lock()
                .expect("lock")
                .iter()
                .filter(|t| &t.conversation_id == conversation_id)
                .cloned()
                .collect())
        }

        async fn cancel(&self, conversation_id: &ConversationId, task_id: &TaskId) -> Result<bool> {
            let mut tasks = self.tasks.lock().expect("lock");
            let before = tasks.len();
            tasks.retain(|t| !(&t.id == task_id && &t.conversation_id == conversation_id));
            Ok(tasks.len() != before)
        }
    }

    fn ctx() -> ToolContext {
        ToolContext::new(ConversationId::new("conv-1"))
    }

    #[test]
    fn when_variants_parse() {
        let at = parse_when(&serde_json::json!({
            "type": "scheduled",
            "date": "2030-01-01T09:00:00Z"
        }))
        .expect("parse");
        assert!(matches!(at, Some(FireSpec::At { .. })));

        let delay = parse_when(&serde_json::json!({ "type": "delayed", "delayInSeconds": 30 }))
            .expect("parse");
        assert_eq!(delay, Some(FireSpec::Delay { seconds: 30 }));

        let none = parse_when(&serde_json::json!({ "type": "no-schedule" })).expect("parse");
        assert_eq!(none, None);

        assert!(parse_when(&serde_json::json!({ "type": "delayed" })).is_err());
        assert!(parse_when(&serde_json::json!({ "type": "weekly" })).is_err());
    }

    #[tokio::test]
    async fn schedule_list_cancel_flow() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let schedule = ScheduleTaskTool::new(scheduler.clone());
        let list = GetScheduledTasksTool::new(scheduler.clone());
        let cancel = CancelScheduledTaskTool::new(scheduler.clone());

        let empty = list.execute(&ctx(), serde_json::json!({})).await.expect("list");
        assert_eq!(empty, serde_json::json!("No scheduled tasks found."));

        let out = schedule
            .execute(
                &ctx(),
                serde_json::json!({
                    "description": "send report",
                    "when": { "type": "cron", "cron": "0 9 * * *" }
                }),
            )
            .await
            .expect("schedule");
        let id = out["task"]["id"].as_str().expect("id").to_string();

        let listed = list.execute(&ctx(), serde_json::json!({})).await.expect("list");
        assert_eq!(listed[0]["description"], "send report");

        let canceled = cancel
            .execute(&ctx(), serde_json::json!({ "taskId": id }))
            .await
            .expect("cancel");
        assert!(canceled.as_str().expect("text").contains("successfully canceled"));

        let err = cancel
            .execute(&ctx(), serde_json::json!({ "taskId": "missing" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed(_)));
    }

    #[tokio::test]
    async fn cancel_does_not_reach_other_conversations() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let schedule = ScheduleTaskTool::new(scheduler.clone());
        let cancel = CancelScheduledTaskTool::new(scheduler.clone());
        let alice = ToolContext::new(ConversationId::new("alice"));
        let bob = ToolContext::new(ConversationId::new("bob"));

        let out = schedule
            .execute(
                &alice,
                serde_json::json!({
                    "description": "pay rent",
                    "when": { "type": "delayed", "delayInSeconds": 60 }
                }),
            )
            .await
            .expect("schedule");
        let id = out["task"]["id"].as_str().expect("id").to_string();

        let err = cancel
            .execute(&bob, serde_json::json!({ "taskId": id }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed(_)));
        assert_eq!(scheduler.tasks.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn no_schedule_is_rejected_without_scheduling() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let schedule = ScheduleTaskTool::new(scheduler.clone());
        let out = schedule
            .execute(
                &ctx(),
                serde_json::json!({ "description": "x", "when": { "type": "no-schedule" } }),
            )
            .await
            .expect("no-schedule");
        assert_eq!(out, serde_json::json!("Not a valid schedule input"));
        assert!(scheduler.tasks.lock().expect("lock").is_empty());
    }
}
