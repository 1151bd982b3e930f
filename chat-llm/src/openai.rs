use crate::client::ChunkStream;
use crate::error::{LlmError, Result};
use crate::types::{Message, Part, Role, StreamChunk, ToolDefinition, ToolResult, Usage};
use bytes::Bytes;
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            http,
            url: format!("{base_url}/chat/completions"),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn chat_stream(
        &self,
        system_prompt: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ChunkStream> {
        let req = OpenAiChatRequest::new(&self.model, system_prompt, messages, tools);
        tracing::debug!(
            url = %self.url,
            messages = req.messages.len(),
            tools = req.tools.len(),
            "sending streaming chat request"
        );

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http(format!(
                "chat stream status={status} body={body}"
            )));
        }

        let sse = Box::pin(decode_sse(response.bytes_stream()));
        Ok(Box::pin(chunks_from_sse(sse)))
    }
}

fn chunks_from_sse<S>(sse: S) -> impl Stream<Item = Result<StreamChunk>> + Send
where
    S: Stream<Item = Result<SseEvent>> + Send + Unpin + 'static,
{
    futures_util::stream::unfold(
        (sse, OpenAiStreamState::new()),
        |(mut sse, mut state)| async move {
            loop {
                if let Some(chunk) = state.pending.pop_front() {
                    return Some((Ok(chunk), (sse, state)));
                }
                if state.done {
                    return None;
                }
                let next = sse.next().await?;
                match next {
                    Ok(SseEvent::Data(data)) => {
                        if data.trim() == "[DONE]" {
                            state.done = true;
                            let usage = state.usage.clone().unwrap_or_default();
                            return Some((Ok(StreamChunk::Done { usage }), (sse, state)));
                        }
                        if let Err(e) = state.ingest(&data) {
                            return Some((Err(e), (sse, state)));
                        }
                    }
                    Ok(SseEvent::Other) => continue,
                    Err(e) => return Some((Err(e), (sse, state))),
                }
            }
        },
    )
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    stream: bool,
    stream_options: OpenAiStreamOptions,
}

#[derive(Debug, Serialize)]
struct OpenAiStreamOptions {
    include_usage: bool,
}

impl OpenAiChatRequest {
    fn new(
        model: &str,
        system_prompt: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Self {
        let mut wire = Vec::with_capacity(messages.len() + 1);
        if !system_prompt.is_empty() {
            wire.push(OpenAiMessage::plain("system", system_prompt.to_string()));
        }
        wire.extend(to_openai_messages(messages));

        let tools: Vec<OpenAiTool> = tools.iter().map(to_openai_tool).collect();
        let tool_choice = (!tools.is_empty()).then(|| "auto".to_string());
        Self {
            model: model.to_string(),
            messages: wire,
            tools,
            tool_choice,
            stream: true,
            stream_options: OpenAiStreamOptions {
                include_usage: true,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    r#type: String,
    function: OpenAiToolFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

fn to_openai_tool(t: &ToolDefinition) -> OpenAiTool {
    OpenAiTool {
        r#type: "function".to_string(),
        function: OpenAiToolFunction {
            name: t.name.clone(),
            description: t.description.clone(),
            parameters: t.parameters.clone(),
        },
    }
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OpenAiToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl OpenAiMessage {
    fn plain(role: &str, content: String) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiToolCall {
    id: String,
    r#type: String,
    function: OpenAiToolFunctionCall,
}

#[derive(Debug, Serialize)]
struct OpenAiToolFunctionCall {
    name: String,
    arguments: String,
}

/// Flattens the part-based history into chat-completions messages.
///
/// Invocations without a result are omitted: the endpoint rejects an
/// assistant `tool_calls` entry that is not followed by its tool message.
/// Each assistant segment is followed by the tool messages of its calls.
fn to_openai_messages(messages: &[Message]) -> Vec<OpenAiMessage> {
    let results: HashMap<&str, &ToolResult> = messages
        .iter()
        .flat_map(|m| m.results())
        .map(|r| (r.call_id.as_str(), r))
        .collect();

    let mut out = Vec::new();
    for m in messages {
        match m.role {
            Role::User | Role::System => {
                let text = m.text();
                if !text.is_empty() {
                    let role = if m.role == Role::User { "user" } else { "system" };
                    out.push(OpenAiMessage::plain(role, text));
                }
            }
            Role::Assistant => {
                let mut segment = AssistantSegment::default();
                for part in &m.parts {
                    match part {
                        Part::Text { text } => {
                            if !segment.calls.is_empty() {
                                segment.flush(&results, &mut out);
                            }
                            segment.content.push_str(text);
                        }
                        Part::ToolInvocation(inv) => {
                            if results.contains_key(inv.call_id.as_str()) {
                                segment.calls.push(OpenAiToolCall {
                                    id: inv.call_id.to_string(),
                                    r#type: "function".to_string(),
                                    function: OpenAiToolFunctionCall {
                                        name: inv.tool_name.clone(),
                                        arguments: inv.input.to_string(),
                                    },
                                });
                            }
                        }
                        Part::ToolResult(_) | Part::Decision { .. } => {}
                    }
                }
                segment.flush(&results, &mut out);
            }
        }
    }
    out
}

#[derive(Default)]
struct AssistantSegment {
    content: String,
    calls: Vec<OpenAiToolCall>,
}

impl AssistantSegment {
    fn flush(&mut self, results: &HashMap<&str, &ToolResult>, out: &mut Vec<OpenAiMessage>) {
        if self.content.is_empty() && self.calls.is_empty() {
            return;
        }
        let calls = std::mem::take(&mut self.calls);
        let tool_messages: Vec<OpenAiMessage> = calls
            .iter()
            .filter_map(|c| results.get(c.id.as_str()))
            .map(|r| OpenAiMessage {
                role: "tool".to_string(),
                content: Some(r.outcome.to_model_content()),
                tool_calls: Vec::new(),
                tool_call_id: Some(r.call_id.to_string()),
            })
            .collect();
        out.push(OpenAiMessage {
            role: "assistant".to_string(),
            content: Some(std::mem::take(&mut self.content)).filter(|s| !s.is_empty()),
            tool_calls: calls,
            tool_call_id: None,
        });
        out.extend(tool_messages);
    }
}

#[derive(Debug)]
enum SseEvent {
    Data(String),
    Other,
}

fn decode_sse<S>(bytes_stream: S) -> impl Stream<Item = Result<SseEvent>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    // Bytes are buffered until a full event arrives; a chunk boundary may split a UTF-8 sequence.
    futures_util::stream::unfold(
        (bytes_stream, Vec::<u8>::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                if let Some(idx) = find_event_boundary(&buffer) {
                    let raw: Vec<u8> = buffer.drain(..idx + 2).take(idx).collect();
                    return Some((decode_event(&raw), (stream, buffer)));
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
                        continue;
                    }
                    Some(Err(e)) => {
                        return Some((Err(LlmError::Http(e.to_string())), (stream, buffer)));
                    }
                    None => {
                        if buffer.iter().all(u8::is_ascii_whitespace) {
                            return None;
                        }
                        let raw = std::mem::take(&mut buffer);
                        return Some((decode_event(&raw), (stream, buffer)));
                    }
                }
            }
        },
    )
}

fn find_event_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

fn decode_event(raw: &[u8]) -> Result<SseEvent> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| LlmError::StreamParse(format!("sse event is not valid utf-8: {e}")))?;
    Ok(parse_sse_event(text))
}

fn parse_sse_event(raw: &str) -> SseEvent {
    let data_lines: Vec<&str> = raw
        .lines()
        .filter_map(|line| line.trim_end().strip_prefix("data:"))
        .map(str::trim_start)
        .collect();
    if data_lines.is_empty() {
        SseEvent::Other
    } else {
        SseEvent::Data(data_lines.join("\n"))
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamResponseChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiStreamUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiStreamDeltaToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDeltaToolCall {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiStreamDeltaToolFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDeltaToolFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct OpenAiStreamToolCallState {
    id: Option<String>,
    name: Option<String>,
    started: bool,
    /// Argument fragments that arrived before id and name were both known.
    buffered: String,
}

#[derive(Debug)]
struct OpenAiStreamState {
    tool_calls: HashMap<u32, OpenAiStreamToolCallState>,
    pending: VecDeque<StreamChunk>,
    usage: Option<Usage>,
    done: bool,
}

impl OpenAiStreamState {
    fn new() -> Self {
        Self {
            tool_calls: HashMap::new(),
            pending: VecDeque::new(),
            usage: None,
            done: false,
        }
    }

    fn ingest(&mut self, data: &str) -> Result<()> {
        let chunk: OpenAiStreamResponseChunk = serde_json::from_str(data).map_err(|e| {
            LlmError::StreamParse(format!("chat chunk json error={e} data={data}"))
        })?;

        if let Some(u) = chunk.usage.as_ref() {
            self.usage = Some(Usage {
                prompt_tokens: u.prompt_tokens.unwrap_or(0) as u32,
                completion_tokens: u.completion_tokens.unwrap_or(0) as u32,
            });
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(());
        };
        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            self.pending.push_back(StreamChunk::Delta { content });
        }

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let index = tc.index.unwrap_or(0);
            let entry = self.tool_calls.entry(index).or_default();
            if entry.id.is_none() {
                entry.id = tc.id.clone();
            }
            let (name, arguments) = match tc.function {
                Some(f) => (f.name, f.arguments.unwrap_or_default()),
                None => (None, String::new()),
            };
            if entry.name.is_none() {
                entry.name = name;
            }

            if !entry.started {
                entry.buffered.push_str(&arguments);
                let (Some(id), Some(name)) = (entry.id.clone(), entry.name.clone()) else {
                    continue;
                };
                entry.started = true;
                self.pending
                    .push_back(StreamChunk::ToolCallStart { index, id, name });
                if !entry.buffered.is_empty() {
                    self.pending.push_back(StreamChunk::ToolCallDelta {
                        index,
                        arguments: std::mem::take(&mut entry.buffered),
                    });
                }
            } else if !arguments.is_empty() {
                self.pending
                    .push_back(StreamChunk::ToolCallDelta { index, arguments });
            }
        }
        Ok(())
    }
}
