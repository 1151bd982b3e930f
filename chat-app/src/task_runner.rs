use async_trait::async_trait;
use chat_llm::Message;
use chat_tools::ScheduledTask;

/// Receives scheduled tasks as they come due.
#[async_trait]
pub trait TaskFiredHandler: Send + Sync {
    async fn on_task_fired(&self, task: &ScheduledTask) -> anyhow::Result<()>;
}

pub fn task_fired_text(description: &str) -> String {
    format!("Running scheduled task: {description}")
}

/// Appends the synthetic user message announcing a fired task.
pub fn on_task_fired(description: &str, mut history: Vec<Message>) -> Vec<Message> {
    history.push(Message::user_text(task_fired_text(description)));
    history
}
