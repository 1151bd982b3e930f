//! History repair after interrupted streams.
//!
//! Rules, applied in one pass over the history:
//! - a tool result counts only if its invocation appears earlier; the earliest
//!   result for a call id wins and later ones are discarded;
//! - an invocation without a result survives only if it is the last invocation
//!   in the history and no assistant message follows the message carrying it
//!   (a later assistant reply means the call was abandoned, even when it is the
//!   last invocation);
//! - repeated invocations of one call id keep the first occurrence;
//! - messages emptied by the above are dropped. Everything else is untouched.

use chat_llm::{CallId, InvocationState, Message, Part, Role};
use std::collections::{HashMap, HashSet};

pub fn sanitize(history: &[Message]) -> Vec<Message> {
    let mut seen_invocations: HashSet<&CallId> = HashSet::new();
    let mut outcomes: HashMap<&CallId, InvocationState> = HashMap::new();
    // (message index, part index) of every part that is dropped.
    let mut dropped: HashSet<(usize, usize)> = HashSet::new();
    let mut last_invocation: Option<(usize, usize, &CallId)> = None;

    for (mi, message) in history.iter().enumerate() {
        for (pi, part) in message.parts.iter().enumerate() {
            match part {
                Part::ToolInvocation(inv) => {
                    if !seen_invocations.insert(&inv.call_id) {
                        dropped.insert((mi, pi));
                        continue;
                    }
                    last_invocation = Some((mi, pi, &inv.call_id));
                }
                Part::ToolResult(result) => {
                    if !seen_invocations.contains(&result.call_id)
                        || outcomes.contains_key(&result.call_id)
                    {
                        dropped.insert((mi, pi));
                        continue;
                    }
                    outcomes.insert(&result.call_id, result.outcome.terminal_state());
                }
                Part::Text { .. } | Part::Decision { .. } => {}
            }
        }
    }

    let trailing_pending = last_invocation.and_then(|(mi, pi, call_id)| {
        let superseded = history[mi + 1..]
            .iter()
            .any(|m| m.role == Role::Assistant);
        (!outcomes.contains_key(call_id) && !superseded).then_some((mi, pi))
    });

    for (mi, message) in history.iter().enumerate() {
        for (pi, part) in message.parts.iter().enumerate() {
            if let Part::ToolInvocation(inv) = part {
                if !outcomes.contains_key(&inv.call_id)
                    && trailing_pending != Some((mi, pi))
                    && !dropped.contains(&(mi, pi))
                {
                    tracing::debug!(
                        call_id = %inv.call_id,
                        tool_name = %inv.tool_name,
                        "dropping orphaned tool invocation"
                    );
                    dropped.insert((mi, pi));
                }
            }
        }
    }

    if dropped.is_empty() && !needs_state_repair(history, &outcomes) {
        return history.to_vec();
    }

    let mut out = Vec::with_capacity(history.len());
    let mut dropped_messages = 0usize;
    for (mi, message) in history.iter().enumerate() {
        let had_parts = !message.parts.is_empty();
        let parts: Vec<Part> = message
            .parts
            .iter()
            .enumerate()
            .filter(|(pi, _)| !dropped.contains(&(mi, *pi)))
            .map(|(_, part)| repair_state(part, &outcomes))
            .collect();
        if had_parts && parts.is_empty() {
            dropped_messages += 1;
            continue;
        }
        out.push(Message {
            id: message.id.clone(),
            role: message.role,
            parts,
            created_at: message.created_at,
        });
    }

    tracing::debug!(
        dropped_parts = dropped.len(),
        dropped_messages,
        messages_in = history.len(),
        messages_out = out.len(),
        "history sanitized"
    );
    out
}

fn needs_state_repair(history: &[Message], outcomes: &HashMap<&CallId, InvocationState>) -> bool {
    history.iter().flat_map(|m| m.invocations()).any(|inv| {
        outcomes
            .get(&inv.call_id)
            .is_some_and(|state| *state != inv.state)
    })
}

/// Resolved invocations take the state implied by their result.
fn repair_state(part: &Part, outcomes: &HashMap<&CallId, InvocationState>) -> Part {
    match part {
        Part::ToolInvocation(inv) => match outcomes.get(&inv.call_id) {
            Some(state) if *state != inv.state => {
                let mut inv = inv.clone();
                inv.state = *state;
                Part::ToolInvocation(inv)
            }
            _ => part.clone(),
        },
        other => other.clone(),
    }
}
