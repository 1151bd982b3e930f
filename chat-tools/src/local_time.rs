use crate::error::Result;
use crate::traits::{ApprovalMode, Tool, ToolContext, ToolSpec, require_string};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Offset, Utc};

/// Reports the local time for a location.
///
/// Locations written as a UTC offset (`UTC+2`, `+05:30`, `GMT-7`) are resolved
/// exactly; any other location name falls back to UTC.
pub struct LocalTimeTool {
    clock: fn() -> DateTime<Utc>,
}

impl LocalTimeTool {
    pub fn new() -> Self {
        Self { clock: Utc::now }
    }

    #[cfg(test)]
    fn with_clock(clock: fn() -> DateTime<Utc>) -> Self {
        Self { clock }
    }
}

impl Default for LocalTimeTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for LocalTimeTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "getLocalTime".to_string(),
            description: "Get the local time for a specified location.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "location": { "type": "string" }
                },
                "required": ["location"]
            }),
            approval: ApprovalMode::Auto,
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(
        &self,
        _ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let location = require_string(&arguments, "location")?;
        let now = (self.clock)();
        let (offset, resolved) = match parse_utc_offset(&location) {
            Some(offset) => (offset, true),
            None => (Utc.fix(), false),
        };
        let local = now.with_timezone(&offset);
        Ok(serde_json::json!({
            "location": location,
            "time": local.format("%H:%M").to_string(),
            "iso8601": local.to_rfc3339(),
            "utc_offset": offset.to_string(),
            "offset_resolved": resolved,
        }))
    }
}

fn parse_utc_offset(location: &str) -> Option<FixedOffset> {
    let upper = location.trim().to_ascii_uppercase();
    let rest = upper
        .strip_prefix("UTC")
        .or_else(|| upper.strip_prefix("GMT"))
        .unwrap_or(&upper);
    if rest.is_empty() {
        return (upper == "UTC" || upper == "GMT").then(|| Utc.fix());
    }
    let (sign, digits) = match rest.as_bytes()[0] {
        b'+' => (1, &rest[1..]),
        b'-' => (-1, &rest[1..]),
        _ => return None,
    };
    let (hours, minutes) = match digits.split_once(':') {
        Some((h, m)) => (offset_field(h)?, offset_field(m)?),
        None => (offset_field(digits)?, 0),
    };
    if hours > 14 || minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// One or two ASCII digits; no sign.
fn offset_field(field: &str) -> Option<i32> {
    if field.is_empty() || field.len() > 2 || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_llm::ConversationId;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0)
            .single()
            .expect("valid date")
    }

    #[test]
    fn offsets_parse() {
        assert_eq!(parse_utc_offset("UTC+2"), FixedOffset::east_opt(7200));
        assert_eq!(parse_utc_offset("+05:30"), FixedOffset::east_opt(19800));
        assert_eq!(parse_utc_offset("gmt-7"), FixedOffset::east_opt(-25200));
        assert_eq!(parse_utc_offset("UTC"), FixedOffset::east_opt(0));
        assert_eq!(parse_utc_offset("Paris"), None);
        assert_eq!(parse_utc_offset("UTC+20"), None);
    }

    #[test]
    fn signed_offset_fields_are_rejected() {
        assert_eq!(parse_utc_offset("UTC+-5"), None);
        assert_eq!(parse_utc_offset("UTC+5:-30"), None);
        assert_eq!(parse_utc_offset("UTC++5"), None);
        assert_eq!(parse_utc_offset("UTC-5:+30"), None);
        assert_eq!(parse_utc_offset("UTC+"), None);
        assert_eq!(parse_utc_offset("UTC-05:30"), FixedOffset::east_opt(-19800));
    }

    #[tokio::test]
    async fn local_time_applies_offset() {
        let tool = LocalTimeTool::with_clock(fixed_now);
        let ctx = ToolContext::new(ConversationId::new("c"));
        let out = tool
            .execute(&ctx, serde_json::json!({ "location": "UTC+2" }))
            .await
            .expect("time");
        assert_eq!(out["time"], "10:00");
        assert_eq!(out["offset_resolved"], true);

        let out = tool
            .execute(&ctx, serde_json::json!({ "location": "Lisbon" }))
            .await
            .expect("time");
        assert_eq!(out["time"], "08:00");
        assert_eq!(out["offset_resolved"], false);
    }
}
