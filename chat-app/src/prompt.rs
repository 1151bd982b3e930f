use chat_tools::ToolRegistry;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt::Write;

const BASE_INSTRUCTIONS: &str = "You are a helpful assistant that can check the weather, \
tell the local time, and schedule tasks for the user.";

/// Builds the system instructions for one turn.
pub fn build_system_prompt(
    now: DateTime<Utc>,
    registry: &ToolRegistry,
    preamble: Option<&str>,
) -> String {
    let mut out = String::new();
    if let Some(preamble) = preamble.map(str::trim).filter(|p| !p.is_empty()) {
        out.push_str(preamble);
        out.push_str("\n\n");
    }
    out.push_str(BASE_INSTRUCTIONS);
    out.push_str("\n\nYou have access to the following tools:\n");
    for (i, tool) in registry.descriptors().enumerate() {
        let mode = if tool.requires_confirmation() {
            "requires user confirmation"
        } else {
            "auto-executes"
        };
        let _ = writeln!(
            out,
            "{}. **{}** - {} ({mode})",
            i + 1,
            tool.name(),
            tool.description
        );
    }
    out.push('\n');
    out.push_str(&schedule_guidance(now));
    out.push_str(
        "\nTools that require confirmation are shown to the user before they run. \
Do not claim such a tool has run until its result is available.\n\
If the user asks to schedule a task, use the scheduleTask tool.\n",
    );
    out
}

fn schedule_guidance(now: DateTime<Utc>) -> String {
    format!(
        "[Schedule Task]\n\
Current time: {now}\n\
When the user asks for something to happen later, call scheduleTask with a \
`when` object whose `type` is one of:\n\
- \"scheduled\": a specific moment; set `date` to an RFC 3339 timestamp after the current time.\n\
- \"delayed\": relative to now; set `delayInSeconds` to a whole number of seconds.\n\
- \"cron\": a recurring schedule; set `cron` to a cron expression \
(minute hour day-of-month month day-of-week).\n\
- \"no-schedule\": the request has no usable time information.\n\
Resolve relative phrases such as \"tomorrow at 9\" against the current time above.\n",
        now = now.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirmation::tests::{CountingWeather, registry_with};
    use chrono::TimeZone;
    use std::sync::Arc;

    #[test]
    fn prompt_lists_tools_time_and_guidance() {
        let registry = registry_with(Arc::new(CountingWeather::default()));
        let now = Utc
            .with_ymd_and_hms(2025, 5, 4, 12, 30, 0)
            .single()
            .expect("valid date");
        let prompt = build_system_prompt(now, &registry, Some("Be brief."));

        assert!(prompt.starts_with("Be brief."));
        assert!(prompt.contains("2025-05-04T12:30:00Z"));
        assert!(prompt.contains("**getWeatherInformation**"));
        assert!(prompt.contains("(requires user confirmation)"));
        assert!(prompt.contains("**getLocalTime**"));
        assert!(prompt.contains("\"delayed\""));
        assert!(prompt.contains("\"cron\""));
    }

    #[test]
    fn blank_preamble_is_ignored() {
        let registry = registry_with(Arc::new(CountingWeather::default()));
        let prompt = build_system_prompt(Utc::now(), &registry, Some("   "));
        assert!(prompt.starts_with(BASE_INSTRUCTIONS));
    }
}
