//! Drives one model turn and streams its output parts.
//!
//! Each round-trip is one `ModelClient::stream` call. Auto-executing tools run
//! inline and feed the next round-trip; the first confirmation-required call
//! ends the turn with that call left pending.

use crate::config::ChatAgentConfig;
use crate::confirmation::run_tool;
use crate::prompt::build_system_prompt;
use chat_llm::{
    CallId, FinishReason, InvocationState, LlmError, Message, ModelClient, ModelRequest,
    OutputPart, Part, Role, StreamChunk, ToolInvocation, ToolOutcome, ToolResult, Usage,
};
use chat_tools::{ToolContext, ToolRegistry};
use chrono::Utc;
use futures_util::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("model invocation failed: {0}")]
    ModelInvocation(#[from] LlmError),

    #[error("round-trip limit reached ({0})")]
    RoundTripLimit(u32),

    #[error("turn cancelled")]
    Cancelled,

    #[error("client disconnected")]
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_round_trips: u32,
    pub tool_timeout: Duration,
    pub stream_buffer: usize,
    pub system_preamble: Option<String>,
}

impl From<&ChatAgentConfig> for OrchestratorSettings {
    fn from(cfg: &ChatAgentConfig) -> Self {
        Self {
            max_round_trips: cfg.agent.max_round_trips,
            tool_timeout: cfg.agent.tool_timeout(),
            stream_buffer: cfg.agent.stream_buffer,
            system_preamble: cfg.general.system_prompt.clone(),
        }
    }
}

pub struct TurnInput {
    pub context: ToolContext,
    /// Sanitized and resolved history, ending with the user's message.
    pub history: Vec<Message>,
    /// Outputs of calls resolved before this turn, replayed after `start`.
    pub resolved: Vec<OutputPart>,
}

#[derive(Clone)]
pub struct StreamOrchestrator {
    model: Arc<dyn ModelClient>,
    registry: Arc<ToolRegistry>,
    settings: Arc<OrchestratorSettings>,
}

#[derive(Debug, Default)]
struct RoundOutput {
    text: String,
    tool_calls: Vec<StreamedCall>,
    usage: Usage,
}

#[derive(Debug)]
struct StreamedCall {
    index: u32,
    id: String,
    name: String,
    arguments: String,
}

impl StreamOrchestrator {
    pub fn new(
        model: Arc<dyn ModelClient>,
        registry: Arc<ToolRegistry>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            model,
            registry,
            settings: Arc::new(settings),
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.model()
    }

    /// Starts the turn on a background task and returns its output parts.
    ///
    /// `finalize` receives the assembled assistant message when the turn ends
    /// normally (including at the round-trip cap). It is dropped without being
    /// called on cancellation, client disconnect or model failure.
    pub fn run<F, Fut>(
        &self,
        input: TurnInput,
        cancel: CancellationToken,
        finalize: F,
    ) -> mpsc::Receiver<OutputPart>
    where
        F: FnOnce(Message) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.settings.stream_buffer.max(1));
        let this = self.clone();
        tokio::spawn(async move {
            let conversation_id = input.context.conversation_id.clone();
            let started = Instant::now();
            match this.drive(&tx, &cancel, input).await {
                Ok((message, reason)) => {
                    let _ = tx.send(OutputPart::Finish { reason }).await;
                    tracing::info!(
                        %conversation_id,
                        reason = ?reason,
                        parts = message.parts.len(),
                        latency_ms = started.elapsed().as_millis() as u64,
                        "turn finished"
                    );
                    finalize(message).await;
                }
                Err(TurnError::Cancelled) | Err(TurnError::Disconnected) => {
                    tracing::info!(%conversation_id, "turn stopped before completion");
                }
                Err(e) => {
                    tracing::error!(%conversation_id, error = %e, "turn failed");
                    let _ = tx
                        .send(OutputPart::Error {
                            message: e.to_string(),
                        })
                        .await;
                }
            }
        });
        rx
    }

    #[tracing::instrument(level = "info", skip_all, fields(conversation_id = %input.context.conversation_id))]
    async fn drive(
        &self,
        tx: &mpsc::Sender<OutputPart>,
        cancel: &CancellationToken,
        input: TurnInput,
    ) -> Result<(Message, FinishReason), TurnError> {
        let TurnInput {
            context,
            history,
            resolved,
        } = input;
        let mut assembled = Message::new(Role::Assistant, Vec::new());
        emit(
            tx,
            OutputPart::Start {
                message_id: assembled.id.clone(),
            },
        )
        .await?;
        for part in resolved {
            emit(tx, part).await?;
        }

        let system_prompt = build_system_prompt(
            Utc::now(),
            &self.registry,
            self.settings.system_preamble.as_deref(),
        );
        let tools = self.registry.definitions();
        let max = self.settings.max_round_trips;

        let mut round = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(TurnError::Cancelled);
            }
            if round >= max {
                let e = TurnError::RoundTripLimit(max);
                tracing::warn!(max_round_trips = max, "round-trip limit reached");
                emit(
                    tx,
                    OutputPart::Error {
                        message: e.to_string(),
                    },
                )
                .await?;
                return Ok((assembled, FinishReason::RoundTripLimit));
            }
            round += 1;
            emit(tx, OutputPart::StepStart { round }).await?;

            let mut messages = history.clone();
            if !assembled.parts.is_empty() {
                messages.push(assembled.clone());
            }
            let request = ModelRequest {
                system_prompt: system_prompt.clone(),
                messages,
                tools: tools.clone(),
            };
            let output = self.stream_round(tx, cancel, &request, round).await?;

            if !output.text.is_empty() {
                assembled.parts.push(Part::text(output.text));
            }
            if output.tool_calls.is_empty() {
                return Ok((assembled, FinishReason::Stop));
            }
            let awaiting = self
                .handle_tool_calls(tx, cancel, &context, &mut assembled, output.tool_calls)
                .await?;
            if awaiting {
                return Ok((assembled, FinishReason::AwaitingConfirmation));
            }
        }
    }

    async fn stream_round(
        &self,
        tx: &mpsc::Sender<OutputPart>,
        cancel: &CancellationToken,
        request: &ModelRequest,
        round: u32,
    ) -> Result<RoundOutput, TurnError> {
        let started = Instant::now();
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Err(TurnError::Cancelled),
            stream = self.model.stream(request) => stream?,
        };

        let mut output = RoundOutput::default();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            match chunk? {
                StreamChunk::Delta { content } => {
                    output.text.push_str(&content);
                    emit(tx, OutputPart::TextDelta { delta: content }).await?;
                }
                StreamChunk::ToolCallStart { index, id, name } => {
                    tracing::debug!(tool_call_id = %id, tool_name = %name, "model tool call started");
                    output.tool_calls.push(StreamedCall {
                        index,
                        id,
                        name,
                        arguments: String::new(),
                    });
                }
                StreamChunk::ToolCallDelta { index, arguments } => {
                    if let Some(call) = output
                        .tool_calls
                        .iter_mut()
                        .rev()
                        .find(|c| c.index == index)
                    {
                        call.arguments.push_str(&arguments);
                    }
                }
                StreamChunk::Done { usage } => output.usage = usage,
            }
        }

        tracing::info!(
            round,
            model = %self.model.model(),
            latency_ms = started.elapsed().as_millis() as u64,
            text_len = output.text.len(),
            tool_calls = output.tool_calls.len(),
            prompt_tokens = output.usage.prompt_tokens,
            completion_tokens = output.usage.completion_tokens,
            "model round-trip completed"
        );
        Ok(output)
    }

    /// Returns `true` when a call is now awaiting confirmation.
    async fn handle_tool_calls(
        &self,
        tx: &mpsc::Sender<OutputPart>,
        cancel: &CancellationToken,
        ctx: &ToolContext,
        assembled: &mut Message,
        calls: Vec<StreamedCall>,
    ) -> Result<bool, TurnError> {
        let mut awaiting = false;
        for call in calls {
            let call_id = if call.id.is_empty() {
                CallId::generate()
            } else {
                CallId::new(call.id)
            };
            if awaiting {
                tracing::warn!(
                    %call_id,
                    tool_name = %call.name,
                    "dropping tool call issued after a call awaiting confirmation"
                );
                continue;
            }

            let input = match parse_arguments(&call.arguments) {
                Ok(v) => v,
                Err(message) => {
                    let raw = serde_json::Value::String(call.arguments.clone());
                    record_failure(tx, assembled, call_id, call.name, raw, message).await?;
                    continue;
                }
            };
            let Some(descriptor) = self.registry.lookup(&call.name) else {
                tracing::error!(%call_id, tool_name = %call.name, "model called unknown tool");
                let message = format!("unknown tool: {}", call.name);
                record_failure(tx, assembled, call_id, call.name, input, message).await?;
                continue;
            };

            if descriptor.requires_confirmation() {
                tracing::info!(%call_id, tool_name = %call.name, "tool call requires confirmation");
                assembled.parts.push(Part::ToolInvocation(ToolInvocation {
                    call_id: call_id.clone(),
                    tool_name: call.name.clone(),
                    input: input.clone(),
                    state: InvocationState::AwaitingConfirmation,
                }));
                emit(
                    tx,
                    OutputPart::ToolApprovalRequested {
                        call_id,
                        tool_name: call.name,
                        input,
                    },
                )
                .await?;
                awaiting = true;
                continue;
            }

            emit(
                tx,
                OutputPart::ToolInputAvailable {
                    call_id: call_id.clone(),
                    tool_name: call.name.clone(),
                    input: input.clone(),
                },
            )
            .await?;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                outcome = run_tool(descriptor, ctx, &call_id, input.clone(), self.settings.tool_timeout) => outcome,
            };
            record_outcome(tx, assembled, call_id, call.name, input, outcome).await?;
        }
        Ok(awaiting)
    }
}

fn parse_arguments(raw: &str) -> Result<serde_json::Value, String> {
    if raw.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(v @ serde_json::Value::Object(_)) => Ok(v),
        Ok(_) => Err("tool arguments must be a JSON object".to_string()),
        Err(e) => Err(format!("invalid tool arguments: {e}")),
    }
}

async fn record_failure(
    tx: &mpsc::Sender<OutputPart>,
    assembled: &mut Message,
    call_id: CallId,
    tool_name: String,
    input: serde_json::Value,
    message: String,
) -> Result<(), TurnError> {
    record_outcome(
        tx,
        assembled,
        call_id,
        tool_name,
        input,
        ToolOutcome::Error { message },
    )
    .await
}

async fn record_outcome(
    tx: &mpsc::Sender<OutputPart>,
    assembled: &mut Message,
    call_id: CallId,
    tool_name: String,
    input: serde_json::Value,
    outcome: ToolOutcome,
) -> Result<(), TurnError> {
    assembled.parts.push(Part::ToolInvocation(ToolInvocation {
        call_id: call_id.clone(),
        tool_name: tool_name.clone(),
        input,
        state: outcome.terminal_state(),
    }));
    assembled.parts.push(Part::ToolResult(ToolResult {
        call_id: call_id.clone(),
        tool_name: tool_name.clone(),
        outcome: outcome.clone(),
    }));
    emit(
        tx,
        OutputPart::ToolOutput {
            call_id,
            tool_name,
            outcome,
        },
    )
    .await
}

async fn emit(tx: &mpsc::Sender<OutputPart>, part: OutputPart) -> Result<(), TurnError> {
    tx.send(part).await.map_err(|_| TurnError::Disconnected)
}
