//! In-process scheduler backing the scheduling tools.

use crate::config::SchedulerConfig;
use crate::store::TaskStore;
use crate::task_runner::TaskFiredHandler;
use anyhow::Result;
use async_trait::async_trait;
use chat_llm::ConversationId;
use chat_tools::{FireSpec, ScheduledTask, TaskId, TaskScheduler, ToolError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Scheduler {
    cfg: SchedulerConfig,
    tasks: Arc<RwLock<HashMap<TaskId, ScheduledTask>>>,
    store: Arc<dyn TaskStore>,
    shutdown: CancellationToken,
    background_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Scheduler {
    /// Loads persisted tasks. The tick loop is started separately by [`Scheduler::start`].
    pub async fn load(cfg: SchedulerConfig, store: Arc<dyn TaskStore>) -> Result<Self> {
        let mut tasks = HashMap::new();
        for task in store.load_tasks().await? {
            tasks.insert(task.id.clone(), task);
        }
        tracing::info!(tasks = tasks.len(), "scheduler loaded persisted tasks");
        Ok(Self {
            cfg,
            tasks: Arc::new(RwLock::new(tasks)),
            store,
            shutdown: CancellationToken::new(),
            background_tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub async fn start(self: &Arc<Self>, handler: Arc<dyn TaskFiredHandler>) {
        if !self.cfg.enabled {
            tracing::info!("scheduler disabled");
            return;
        }
        let this = self.clone();
        let shutdown = self.shutdown.child_token();
        let tick_ms = self.cfg.tick_interval_ms.max(10);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(tick_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("scheduler loop received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {}
                }
                this.tick(Utc::now(), handler.as_ref()).await;
            }
        });
        self.background_tasks.lock().await.push(handle);
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = {
            let mut guard = self.background_tasks.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(std::time::Duration::from_secs(5), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "scheduler background task join failed");
                }
                Err(_) => {
                    tracing::warn!("timed out waiting for scheduler background task shutdown");
                }
            }
        }
    }

    /// Fires every task due at `now`. Returns how many fired.
    ///
    /// A one-shot task whose handler fails stays scheduled and is retried on the next tick.
    /// Recurring tasks advance either way.
    pub async fn tick(&self, now: DateTime<Utc>, handler: &dyn TaskFiredHandler) -> usize {
        let due: Vec<ScheduledTask> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.next_run_at.is_some_and(|next| next <= now))
            .cloned()
            .collect();

        for task in &due {
            tracing::info!(
                task_id = %task.id,
                conversation_id = %task.conversation_id,
                description = %task.description,
                "scheduled task fired"
            );
            let handled = match handler.on_task_fired(task).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(task_id = %task.id, error = %e, "scheduled task handler failed");
                    false
                }
            };

            if task.fire.is_recurring() {
                match compute_next_run_at(&task.fire, now) {
                    Ok(Some(next)) => {
                        self.reschedule(&task.id, next).await;
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(task_id = %task.id, error = %e, "failed to reschedule recurring task");
                    }
                }
            } else if !handled {
                tracing::warn!(task_id = %task.id, "one-shot task kept for retry");
                continue;
            }
            self.finish(&task.id).await;
        }
        due.len()
    }

    async fn reschedule(&self, task_id: &TaskId, next: DateTime<Utc>) {
        let updated = {
            let mut tasks = self.tasks.write().await;
            // Canceled while its handler ran.
            let Some(task) = tasks.get_mut(task_id) else {
                return;
            };
            task.next_run_at = Some(next);
            task.clone()
        };
        if let Err(e) = self.store.upsert_task(&updated).await {
            tracing::error!(%task_id, error = %e, "failed to persist rescheduled task");
        }
    }

    async fn finish(&self, task_id: &TaskId) {
        self.tasks.write().await.remove(task_id);
        if let Err(e) = self.store.delete_task(task_id).await {
            tracing::error!(%task_id, error = %e, "failed to delete finished task");
        }
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }
}

#[async_trait]
impl TaskScheduler for Scheduler {
    #[tracing::instrument(level = "info", skip_all, fields(conversation_id = %conversation_id))]
    async fn schedule(
        &self,
        conversation_id: &ConversationId,
        description: &str,
        fire: FireSpec,
    ) -> chat_tools::Result<ScheduledTask> {
        let description = description.trim();
        if description.is_empty() {
            return Err(ToolError::InvalidArguments(
                "description must not be empty".to_string(),
            ));
        }
        let now = Utc::now();
        let next_run_at = compute_next_run_at(&fire, now)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        let task = ScheduledTask {
            id: TaskId::generate(),
            conversation_id: conversation_id.clone(),
            description: description.to_string(),
            fire,
            created_at: now,
            next_run_at,
        };
        self.store
            .upsert_task(&task)
            .await
            .map_err(|e| ToolError::Scheduler(e.to_string()))?;
        self.tasks.write().await.insert(task.id.clone(), task.clone());
        tracing::info!(
            task_id = %task.id,
            next_run_at = ?task.next_run_at,
            recurring = task.fire.is_recurring(),
            "task scheduled"
        );
        Ok(task)
    }

    async fn list(&self, conversation_id: &ConversationId) -> chat_tools::Result<Vec<ScheduledTask>> {
        let mut out: Vec<ScheduledTask> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| &t.conversation_id == conversation_id)
            .cloned()
            .collect();
        out.sort_by_key(|t| (t.next_run_at, t.created_at));
        Ok(out)
    }

    async fn cancel(
        &self,
        conversation_id: &ConversationId,
        task_id: &TaskId,
    ) -> chat_tools::Result<bool> {
        {
            let mut tasks = self.tasks.write().await;
            let owned = tasks
                .get(task_id)
                .is_some_and(|t| &t.conversation_id == conversation_id);
            if !owned {
                return Ok(false);
            }
            tasks.remove(task_id);
        }
        self.store
            .delete_task(task_id)
            .await
            .map_err(|e| ToolError::Scheduler(e.to_string()))?;
        tracing::info!(%task_id, "task canceled");
        Ok(true)
    }
}

/// The `cron` crate wants a leading seconds field; 5-field expressions get one.
pub fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

pub fn compute_next_run_at(fire: &FireSpec, from: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match fire {
        FireSpec::At { at } => Ok(Some(*at)),
        FireSpec::Delay { seconds } => {
            let seconds = i64::try_from(*seconds)
                .map_err(|_| anyhow::anyhow!("delay is too large: {seconds}"))?;
            let delta = ChronoDuration::try_seconds(seconds)
                .ok_or_else(|| anyhow::anyhow!("delay is too large: {seconds}"))?;
            Ok(Some(from + delta))
        }
        FireSpec::Cron { expression } => {
            let schedule = Schedule::from_str(&normalize_cron(expression))
                .map_err(|e| anyhow::anyhow!("invalid cron expression: {e}"))?;
            Ok(schedule.after(&from).next())
        }
    }
}
