//! Human-in-the-loop resolution of confirmation-required tool calls.

use chat_llm::{CallId, InvocationState, Message, OutputPart, Part, Role, ToolOutcome, ToolResult};
use chat_tools::{ToolContext, ToolDescriptor, ToolRegistry};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DENIAL_MESSAGE: &str = "The user declined this action.";

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCall {
    pub call_id: CallId,
    pub tool_name: String,
    pub outcome: ToolOutcome,
}

impl ResolvedCall {
    pub fn to_output_part(&self) -> OutputPart {
        OutputPart::ToolOutput {
            call_id: self.call_id.clone(),
            tool_name: self.tool_name.clone(),
            outcome: self.outcome.clone(),
        }
    }
}

#[derive(Debug)]
pub struct Resolution {
    pub messages: Vec<Message>,
    pub resolved: Vec<ResolvedCall>,
    /// First call still waiting for a decision; later calls were not examined.
    pub pending: Option<CallId>,
}

pub struct ConfirmationResolver {
    registry: Arc<ToolRegistry>,
    tool_timeout: Duration,
}

impl ConfirmationResolver {
    pub fn new(registry: Arc<ToolRegistry>, tool_timeout: Duration) -> Self {
        Self {
            registry,
            tool_timeout,
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(conversation_id = %ctx.conversation_id))]
    pub async fn resolve(&self, ctx: &ToolContext, mut messages: Vec<Message>) -> Resolution {
        let answered: HashSet<CallId> = messages
            .iter()
            .flat_map(|m| m.results())
            .map(|r| r.call_id.clone())
            .collect();

        let candidates: Vec<(usize, CallId, String, serde_json::Value)> = messages
            .iter()
            .enumerate()
            .flat_map(|(mi, m)| m.invocations().map(move |inv| (mi, inv)))
            .filter(|(_, inv)| !answered.contains(&inv.call_id))
            .filter(|(_, inv)| self.registry.requires_confirmation(&inv.tool_name))
            .map(|(mi, inv)| {
                (
                    mi,
                    inv.call_id.clone(),
                    inv.tool_name.clone(),
                    inv.input.clone(),
                )
            })
            .collect();

        let mut resolved = Vec::new();
        let mut pending = None;
        for (mi, call_id, tool_name, input) in candidates {
            let Some(approve) = find_decision(&messages[mi + 1..], &call_id) else {
                tracing::info!(%call_id, %tool_name, "tool call awaiting confirmation");
                set_state(&mut messages[mi], &call_id, InvocationState::AwaitingConfirmation);
                pending = Some(call_id);
                break;
            };

            let outcome = if approve {
                tracing::info!(%call_id, %tool_name, "tool call approved by user");
                match self.registry.lookup(&tool_name) {
                    Some(descriptor) => {
                        run_tool(descriptor, ctx, &call_id, input, self.tool_timeout).await
                    }
                    None => ToolOutcome::Error {
                        message: format!("unknown tool: {tool_name}"),
                    },
                }
            } else {
                tracing::warn!(%call_id, %tool_name, "tool call denied by user");
                ToolOutcome::Denied {
                    message: DENIAL_MESSAGE.to_string(),
                }
            };

            attach_result(&mut messages[mi], &call_id, &tool_name, outcome.clone());
            resolved.push(ResolvedCall {
                call_id,
                tool_name,
                outcome,
            });
        }

        Resolution {
            messages,
            resolved,
            pending,
        }
    }
}

/// First decision for `call_id` among later user messages.
fn find_decision(later: &[Message], call_id: &CallId) -> Option<bool> {
    later
        .iter()
        .filter(|m| m.role == Role::User)
        .find_map(|m| m.decision_for(call_id))
}

fn set_state(message: &mut Message, call_id: &CallId, state: InvocationState) {
    for part in &mut message.parts {
        if let Part::ToolInvocation(inv) = part {
            if &inv.call_id == call_id {
                inv.state = state;
            }
        }
    }
}

/// Records `outcome` right after the invocation it answers.
fn attach_result(message: &mut Message, call_id: &CallId, tool_name: &str, outcome: ToolOutcome) {
    let Some(index) = message.parts.iter().position(
        |p| matches!(p, Part::ToolInvocation(inv) if &inv.call_id == call_id),
    ) else {
        return;
    };
    if let Part::ToolInvocation(inv) = &mut message.parts[index] {
        inv.state = outcome.terminal_state();
    }
    message.parts.insert(
        index + 1,
        Part::ToolResult(ToolResult {
            call_id: call_id.clone(),
            tool_name: tool_name.to_string(),
            outcome,
        }),
    );
}

/// Runs one executor under `timeout`. Failures become error outcomes.
pub(crate) async fn run_tool(
    descriptor: &ToolDescriptor,
    ctx: &ToolContext,
    call_id: &CallId,
    input: serde_json::Value,
    timeout: Duration,
) -> ToolOutcome {
    let started = Instant::now();
    let result = tokio::time::timeout(timeout, descriptor.execute(ctx, input)).await;
    let latency_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(Ok(value)) => {
            tracing::info!(%call_id, tool_name = descriptor.name(), latency_ms, "tool call executed");
            ToolOutcome::Output { value }
        }
        Ok(Err(e)) => {
            tracing::warn!(%call_id, tool_name = descriptor.name(), latency_ms, error = %e, "tool call failed");
            ToolOutcome::Error {
                message: e.to_string(),
            }
        }
        Err(_) => {
            let e = chat_tools::ToolError::Timeout(timeout);
            tracing::warn!(%call_id, tool_name = descriptor.name(), error = %e, "tool call timed out");
            ToolOutcome::Error {
                message: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sanitizer::sanitize;
    use async_trait::async_trait;
    use chat_llm::{ConversationId, ToolInvocation};
    use chat_tools::{ApprovalMode, Tool, ToolError, ToolId, ToolSpec, WeatherTool};
    use serde_json::json;
    use std::sync::Mutex;

    /// Weather stand-in that records every call.
    #[derive(Default)]
    pub(crate) struct CountingWeather {
        pub calls: Mutex<Vec<serde_json::Value>>,
        pub fail: bool,
    }

    #[async_trait]
    impl Tool for CountingWeather {
        fn spec(&self) -> ToolSpec {
            WeatherTool::new().spec()
        }

        async fn execute(
            &self,
            _ctx: &ToolContext,
            arguments: serde_json::Value,
        ) -> chat_tools::Result<serde_json::Value> {
            self.calls.lock().expect("lock").push(arguments.clone());
            if self.fail {
                return Err(ToolError::ExecutionFailed("weather service down".to_string()));
            }
            let city = arguments["city"].as_str().unwrap_or_default().to_string();
            Ok(json!(format!("The weather in {city} is sunny")))
        }
    }

    pub(crate) fn registry_with(weather: Arc<CountingWeather>) -> Arc<ToolRegistry> {
        Arc::new(
            ToolRegistry::builder()
                .register(ToolId::GetWeatherInformation, weather)
                .register(
                    ToolId::GetLocalTime,
                    Arc::new(chat_tools::LocalTimeTool::new()),
                )
                .build()
                .expect("registry"),
        )
    }

    fn resolver(weather: Arc<CountingWeather>) -> ConfirmationResolver {
        ConfirmationResolver::new(registry_with(weather), Duration::from_secs(5))
    }

    fn ctx() -> ToolContext {
        ToolContext::new(ConversationId::new("conv"))
    }

    fn weather_call(call: &str, city: &str) -> Part {
        Part::ToolInvocation(ToolInvocation {
            call_id: CallId::new(call),
            tool_name: "getWeatherInformation".to_string(),
            input: json!({ "city": city }),
            state: InvocationState::AwaitingConfirmation,
        })
    }

    fn decision(call: &str, approve: bool) -> Message {
        Message::new(
            Role::User,
            vec![Part::Decision {
                call_id: CallId::new(call),
                approve,
            }],
        )
    }

    fn result_of<'a>(messages: &'a [Message], call: &str) -> Option<&'a ToolResult> {
        messages
            .iter()
            .flat_map(|m| m.results())
            .find(|r| r.call_id.as_str() == call)
    }

    #[tokio::test]
    async fn approval_runs_executor_exactly_once_with_recorded_input() {
        let weather = Arc::new(CountingWeather::default());
        let history = vec![
            Message::user_text("weather in Paris?"),
            Message::new(Role::Assistant, vec![weather_call("c1", "Paris")]),
            decision("c1", true),
        ];
        let res = resolver(weather.clone()).resolve(&ctx(), history).await;

        assert_eq!(*weather.calls.lock().expect("lock"), vec![json!({ "city": "Paris" })]);
        let result = result_of(&res.messages, "c1").expect("result attached");
        assert_eq!(
            result.outcome,
            ToolOutcome::Output {
                value: json!("The weather in Paris is sunny")
            }
        );
        let inv = res.messages[1].invocations().next().expect("invocation");
        assert_eq!(inv.state, InvocationState::Executed);
        assert!(matches!(res.messages[1].parts[1], Part::ToolResult(_)));
        assert_eq!(res.resolved.len(), 1);
        assert!(res.pending.is_none());
    }

    #[tokio::test]
    async fn denial_records_fixed_result_without_running_executor() {
        let weather = Arc::new(CountingWeather::default());
        let history = vec![
            Message::new(Role::Assistant, vec![weather_call("c1", "Paris")]),
            decision("c1", false),
        ];
        let res = resolver(weather.clone()).resolve(&ctx(), history).await;

        assert!(weather.calls.lock().expect("lock").is_empty());
        let result = result_of(&res.messages, "c1").expect("result attached");
        assert_eq!(
            result.outcome,
            ToolOutcome::Denied {
                message: DENIAL_MESSAGE.to_string()
            }
        );
        assert_eq!(
            res.messages[0].invocations().next().map(|i| i.state),
            Some(InvocationState::Denied)
        );
    }

    #[tokio::test]
    async fn unresolved_earlier_call_blocks_later_decided_call() {
        let weather = Arc::new(CountingWeather::default());
        let history = vec![
            Message::new(Role::Assistant, vec![weather_call("a", "Paris")]),
            Message::new(Role::Assistant, vec![weather_call("b", "Rome")]),
            decision("b", true),
        ];
        let res = resolver(weather.clone()).resolve(&ctx(), history).await;

        assert!(weather.calls.lock().expect("lock").is_empty());
        assert!(result_of(&res.messages, "b").is_none());
        assert_eq!(res.pending, Some(CallId::new("a")));
    }

    #[tokio::test]
    async fn executor_failure_is_captured_as_error_result() {
        let weather = Arc::new(CountingWeather {
            fail: true,
            ..CountingWeather::default()
        });
        let history = vec![
            Message::new(Role::Assistant, vec![weather_call("c1", "Paris")]),
            decision("c1", true),
        ];
        let res = resolver(weather).resolve(&ctx(), history).await;
        let result = result_of(&res.messages, "c1").expect("result attached");
        assert!(result.outcome.is_error());
        assert_eq!(
            res.messages[0].invocations().next().map(|i| i.state),
            Some(InvocationState::Failed)
        );
    }

    #[tokio::test]
    async fn first_decision_wins() {
        let weather = Arc::new(CountingWeather::default());
        let history = vec![
            Message::new(Role::Assistant, vec![weather_call("c1", "Paris")]),
            decision("c1", false),
            decision("c1", true),
        ];
        let res = resolver(weather.clone()).resolve(&ctx(), history).await;
        assert!(weather.calls.lock().expect("lock").is_empty());
        assert!(matches!(
            result_of(&res.messages, "c1").map(|r| &r.outcome),
            Some(ToolOutcome::Denied { .. })
        ));
    }

    #[tokio::test]
    async fn auto_tools_and_answered_calls_are_left_alone() {
        let weather = Arc::new(CountingWeather::default());
        let history = vec![Message::new(
            Role::Assistant,
            vec![Part::ToolInvocation(ToolInvocation {
                call_id: CallId::new("t1"),
                tool_name: "getLocalTime".to_string(),
                input: json!({ "location": "UTC" }),
                state: InvocationState::InputAvailable,
            })],
        )];
        let res = resolver(weather).resolve(&ctx(), history.clone()).await;
        assert_eq!(res.messages, history);
        assert!(res.resolved.is_empty());
        assert!(res.pending.is_none());
    }

    #[tokio::test]
    async fn overridden_approval_makes_auto_tool_wait() {
        let overrides = std::collections::HashMap::from([(ToolId::GetLocalTime, ApprovalMode::Human)]);
        let registry = Arc::new(
            ToolRegistry::builder()
                .register(ToolId::GetLocalTime, Arc::new(chat_tools::LocalTimeTool::new()))
                .approval_overrides(&overrides)
                .build()
                .expect("registry"),
        );
        let history = vec![Message::new(
            Role::Assistant,
            vec![Part::ToolInvocation(ToolInvocation {
                call_id: CallId::new("t1"),
                tool_name: "getLocalTime".to_string(),
                input: json!({ "location": "UTC" }),
                state: InvocationState::InputAvailable,
            })],
        )];
        let res = ConfirmationResolver::new(registry, Duration::from_secs(5))
            .resolve(&ctx(), history)
            .await;
        assert_eq!(res.pending, Some(CallId::new("t1")));
        assert_eq!(
            res.messages[0].invocations().next().map(|i| i.state),
            Some(InvocationState::AwaitingConfirmation)
        );
    }

    #[tokio::test]
    async fn sanitize_then_resolve_leaves_at_most_one_trailing_pending_call() {
        let weather = Arc::new(CountingWeather::default());
        let history = vec![
            Message::new(Role::Assistant, vec![weather_call("old", "Oslo")]),
            Message::user_text("something else"),
            Message::new(Role::Assistant, vec![Part::text("ok")]),
            Message::new(
                Role::Assistant,
                vec![weather_call("c1", "Paris"), weather_call("c2", "Rome")],
            ),
            decision("c1", true),
        ];
        let res = resolver(weather)
            .resolve(&ctx(), sanitize(&history))
            .await;

        let invocations: Vec<&ToolInvocation> =
            res.messages.iter().flat_map(|m| m.invocations()).collect();
        let unresolved: Vec<&ToolInvocation> = invocations
            .iter()
            .copied()
            .filter(|inv| result_of(&res.messages, inv.call_id.as_str()).is_none())
            .collect();
        assert!(unresolved.len() <= 1);
        if let Some(last) = unresolved.first() {
            assert_eq!(
                invocations.last().map(|i| &i.call_id),
                Some(&last.call_id)
            );
        }
        assert!(result_of(&res.messages, "old").is_none());
    }
}
