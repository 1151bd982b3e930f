//! Per-conversation turn pipeline: sanitize, resolve confirmations, stream, persist.

use crate::confirmation::{ConfirmationResolver, ResolvedCall};
use crate::orchestrator::{StreamOrchestrator, TurnInput};
use crate::sanitizer::sanitize;
use crate::store::ConversationStore;
use crate::task_runner::{self, TaskFiredHandler};
use anyhow::Result;
use async_trait::async_trait;
use chat_llm::{ConversationId, Message, OutputPart, Role};
use chat_tools::{ScheduledTask, ToolContext, ToolRegistry};
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_WELCOME_MESSAGE: &str = "**Welcome! I'm your AI assistant.**

Here is what I can do:
- **Weather information**: the weather in any city (asks for your confirmation first)
- **Local time**: the current time for a location
- **Task scheduling**: run tasks at a specific time, after a delay, or on a recurring schedule
- **Task management**: list and cancel scheduled tasks

What would you like to do today?";

#[derive(Debug, Deserialize)]
pub struct TurnRequest {
    pub message: Message,
    /// Full client-side history. When absent the stored history is used.
    #[serde(default)]
    pub history: Option<Vec<Message>>,
}

pub struct ChatAgent {
    store: Arc<dyn ConversationStore>,
    resolver: ConfirmationResolver,
    orchestrator: StreamOrchestrator,
    locks: Arc<DashMap<ConversationId, Arc<Mutex<()>>>>,
    active: Arc<DashMap<ConversationId, CancellationToken>>,
    welcome_message: String,
}

/// Exclusive access to one conversation. The map entry is pruned once nobody
/// holds or waits on it.
struct ConversationLock {
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<ConversationId, Arc<Mutex<()>>>>,
    conversation_id: ConversationId,
}

impl Drop for ConversationLock {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.conversation_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Held for the lifetime of a streaming turn.
struct TurnGuard {
    _lock: ConversationLock,
    active: Arc<DashMap<ConversationId, CancellationToken>>,
    conversation_id: ConversationId,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.active.remove(&self.conversation_id);
    }
}

impl ChatAgent {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        registry: Arc<ToolRegistry>,
        orchestrator: StreamOrchestrator,
        tool_timeout: Duration,
        welcome_message: Option<String>,
    ) -> Self {
        Self {
            store,
            resolver: ConfirmationResolver::new(registry, tool_timeout),
            orchestrator,
            locks: Arc::new(DashMap::new()),
            active: Arc::new(DashMap::new()),
            welcome_message: welcome_message
                .unwrap_or_else(|| DEFAULT_WELCOME_MESSAGE.to_string()),
        }
    }

    async fn lock(&self, id: &ConversationId) -> ConversationLock {
        let mutex = self.locks.entry(id.clone()).or_default().clone();
        ConversationLock {
            guard: Some(mutex.lock_owned().await),
            locks: self.locks.clone(),
            conversation_id: id.clone(),
        }
    }

    /// Client attach. Seeds the welcome message into an empty conversation.
    #[tracing::instrument(level = "info", skip_all, fields(conversation_id = %id))]
    pub async fn connect(&self, id: &ConversationId) -> Result<Vec<Message>> {
        let _lock = self.lock(id).await;
        let history = self.store.load_history(id).await?;
        if !history.is_empty() {
            return Ok(history);
        }
        let seeded = vec![Message::assistant_text(self.welcome_message.clone())];
        self.store.save_history(id, &seeded).await?;
        tracing::info!("seeded welcome message");
        Ok(seeded)
    }

    pub async fn history(&self, id: &ConversationId) -> Result<Vec<Message>> {
        self.store.load_history(id).await
    }

    pub fn is_active(&self, id: &ConversationId) -> bool {
        self.active.contains_key(id)
    }

    /// Cancels the active turn. Returns `false` when none is running.
    pub fn cancel(&self, id: &ConversationId) -> bool {
        match self.active.get(id) {
            Some(token) => {
                token.cancel();
                tracing::info!(conversation_id = %id, "turn cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Runs one turn. The conversation stays locked until the returned stream ends.
    #[tracing::instrument(level = "info", skip_all, fields(conversation_id = %id))]
    pub async fn submit_turn(
        &self,
        id: &ConversationId,
        request: TurnRequest,
    ) -> Result<mpsc::Receiver<OutputPart>> {
        let TurnRequest { message, history } = request;
        if message.role != Role::User {
            return Err(anyhow::anyhow!(
                "turn message must have role user, got {:?}",
                message.role
            ));
        }

        let lock = self.lock(id).await;

        let mut history = match history {
            Some(history) => history,
            None => self.store.load_history(id).await?,
        };
        if history.last().map(|m| &m.id) != Some(&message.id) {
            history.push(message);
        }

        let ctx = ToolContext::new(id.clone());
        let resolution = self.resolver.resolve(&ctx, sanitize(&history)).await;
        self.store.save_history(id, &resolution.messages).await?;
        tracing::info!(
            messages = resolution.messages.len(),
            resolved = resolution.resolved.len(),
            pending = ?resolution.pending,
            "turn history prepared"
        );

        let cancel = CancellationToken::new();
        self.active.insert(id.clone(), cancel.clone());
        let turn_guard = TurnGuard {
            _lock: lock,
            active: self.active.clone(),
            conversation_id: id.clone(),
        };

        let store = self.store.clone();
        let conversation_id = id.clone();
        let persisted = resolution.messages.clone();
        let input = TurnInput {
            context: ctx,
            history: resolution.messages,
            resolved: resolution
                .resolved
                .iter()
                .map(ResolvedCall::to_output_part)
                .collect(),
        };
        let rx = self.orchestrator.run(input, cancel, move |assistant| async move {
            let _turn = turn_guard;
            let mut history = persisted;
            if !assistant.parts.is_empty() {
                history.push(assistant);
            }
            if let Err(e) = store.save_history(&conversation_id, &history).await {
                tracing::error!(%conversation_id, error = %e, "failed to persist finished turn");
            }
        });
        Ok(rx)
    }
}

#[async_trait]
impl TaskFiredHandler for ChatAgent {
    async fn on_task_fired(&self, task: &ScheduledTask) -> Result<()> {
        let id = &task.conversation_id;
        let _lock = self.lock(id).await;
        let history = self.store.load_history(id).await?;
        let updated = task_runner::on_task_fired(&task.description, history);
        self.store.save_history(id, &updated).await?;
        tracing::info!(conversation_id = %id, task_id = %task.id, "scheduled task recorded in history");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirmation::tests::{CountingWeather, registry_with};
    use crate::orchestrator::tests::{ScriptedModel, call, settings, text};
    use crate::store::MemoryStore;
    use chat_llm::{CallId, FinishReason, InvocationState, Part, ToolOutcome};
    use chat_tools::{FireSpec, TaskId};
    use chrono::Utc;
    use std::sync::atomic::Ordering;

    struct Fixture {
        agent: ChatAgent,
        store: Arc<MemoryStore>,
        model: Arc<ScriptedModel>,
        weather: Arc<CountingWeather>,
    }

    fn fixture(model: ScriptedModel) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let model = Arc::new(model);
        let weather = Arc::new(CountingWeather::default());
        let registry = registry_with(weather.clone());
        let orchestrator = StreamOrchestrator::new(model.clone(), registry.clone(), settings());
        let agent = ChatAgent::new(
            store.clone(),
            registry,
            orchestrator,
            Duration::from_secs(5),
            None,
        );
        Fixture {
            agent,
            store,
            model,
            weather,
        }
    }

    async fn drain(mut rx: mpsc::Receiver<OutputPart>) -> Vec<OutputPart> {
        let mut out = Vec::new();
        while let Some(part) = rx.recv().await {
            out.push(part);
        }
        out
    }

    fn turn(text: &str) -> TurnRequest {
        TurnRequest {
            message: Message::user_text(text),
            history: None,
        }
    }

    #[tokio::test]
    async fn connect_seeds_welcome_once() {
        let f = fixture(ScriptedModel::default());
        let id = ConversationId::new("c1");

        let seeded = f.agent.connect(&id).await.expect("connect");
        assert_eq!(seeded.len(), 1);
        assert_eq!(seeded[0].role, Role::Assistant);
        assert_eq!(seeded[0].text(), DEFAULT_WELCOME_MESSAGE);

        let again = f.agent.connect(&id).await.expect("reconnect");
        assert_eq!(again, seeded);
        assert_eq!(f.store.load_history(&id).await.expect("load").len(), 1);
    }

    #[tokio::test]
    async fn connect_leaves_existing_history_alone() {
        let f = fixture(ScriptedModel::default());
        let id = ConversationId::new("c1");
        let existing = vec![Message::user_text("hello")];
        f.store.save_history(&id, &existing).await.expect("save");

        let history = f.agent.connect(&id).await.expect("connect");
        assert_eq!(history, existing);
    }

    #[tokio::test]
    async fn turn_persists_user_and_assistant_messages() {
        let f = fixture(ScriptedModel::new(vec![text("Hi! How can I help?")]));
        let id = ConversationId::new("c1");

        let parts = drain(f.agent.submit_turn(&id, turn("hello")).await.expect("turn")).await;
        assert!(matches!(
            parts.last(),
            Some(OutputPart::Finish {
                reason: FinishReason::Stop
            })
        ));

        let history = f.agent.history(&id).await.expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text(), "hello");
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].text(), "Hi! How can I help?");
        assert!(!f.agent.is_active(&id));
        assert!(f.agent.locks.is_empty());
    }

    #[tokio::test]
    async fn conversation_locks_are_pruned_after_use() {
        let f = fixture(ScriptedModel::default());
        for n in 0..3 {
            f.agent
                .connect(&ConversationId::new(format!("c{n}")))
                .await
                .expect("connect");
        }
        assert!(f.agent.locks.is_empty());

        let id = ConversationId::new("busy");
        let held = f.agent.lock(&id).await;
        let waiting = f.agent.locks.get(&id).map(|m| m.clone()).expect("entry");
        drop(held);
        assert!(f.agent.locks.contains_key(&id), "entry kept while someone waits");
        drop(waiting);

        drop(f.agent.lock(&id).await);
        assert!(f.agent.locks.is_empty());
    }

    #[tokio::test]
    async fn approval_round_trip_runs_the_tool_once() {
        let f = fixture(ScriptedModel::new(vec![
            call(0, "w1", "getWeatherInformation", r#"{"city":"Paris"}"#),
            text("It is sunny in Paris."),
        ]));
        let id = ConversationId::new("c1");

        let first = drain(
            f.agent
                .submit_turn(&id, turn("weather in Paris?"))
                .await
                .expect("turn"),
        )
        .await;
        assert!(first.iter().any(|p| matches!(p, OutputPart::ToolApprovalRequested { .. })));
        assert!(f.weather.calls.lock().expect("lock").is_empty());

        let decision = Message::new(
            Role::User,
            vec![Part::Decision {
                call_id: CallId::new("w1"),
                approve: true,
            }],
        );
        let second = drain(
            f.agent
                .submit_turn(
                    &id,
                    TurnRequest {
                        message: decision,
                        history: None,
                    },
                )
                .await
                .expect("turn"),
        )
        .await;

        assert!(matches!(second[0], OutputPart::Start { .. }));
        assert!(matches!(
            &second[1],
            OutputPart::ToolOutput { outcome: ToolOutcome::Output { .. }, .. }
        ));
        assert_eq!(
            *f.weather.calls.lock().expect("lock"),
            vec![serde_json::json!({ "city": "Paris" })]
        );
        assert_eq!(f.model.calls.load(Ordering::SeqCst), 2);

        let history = f.agent.history(&id).await.expect("history");
        let inv = history
            .iter()
            .flat_map(|m| m.invocations())
            .next()
            .expect("invocation");
        assert_eq!(inv.state, InvocationState::Executed);
        assert_eq!(history.last().expect("reply").text(), "It is sunny in Paris.");
    }

    #[tokio::test]
    async fn client_history_replaces_stored_history() {
        let f = fixture(ScriptedModel::new(vec![text("ok")]));
        let id = ConversationId::new("c1");
        f.store
            .save_history(&id, &[Message::user_text("stale")])
            .await
            .expect("save");

        let message = Message::user_text("fresh");
        let request = TurnRequest {
            history: Some(vec![message.clone()]),
            message,
        };
        drain(f.agent.submit_turn(&id, request).await.expect("turn")).await;

        let history = f.agent.history(&id).await.expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text(), "fresh");
    }

    #[tokio::test]
    async fn non_user_turn_is_rejected() {
        let f = fixture(ScriptedModel::default());
        let request = TurnRequest {
            message: Message::assistant_text("not me"),
            history: None,
        };
        assert!(f.agent.submit_turn(&ConversationId::new("c"), request).await.is_err());
        assert!(!f.agent.cancel(&ConversationId::new("c")));
    }

    #[tokio::test]
    async fn fired_task_is_appended_to_stored_history() {
        let f = fixture(ScriptedModel::default());
        let id = ConversationId::new("c1");
        let before = vec![Message::assistant_text("welcome")];
        f.store.save_history(&id, &before).await.expect("save");

        let task = ScheduledTask {
            id: TaskId::generate(),
            conversation_id: id.clone(),
            description: "send report".to_string(),
            fire: FireSpec::Delay { seconds: 0 },
            created_at: Utc::now(),
            next_run_at: None,
        };
        f.agent.on_task_fired(&task).await.expect("fire");

        let history = f.agent.history(&id).await.expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], before[0]);
        assert_eq!(history[1].role, Role::User);
        assert!(history[1].text().contains("send report"));
        assert_eq!(f.model.calls.load(Ordering::SeqCst), 0);
    }
}
