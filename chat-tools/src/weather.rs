use crate::error::Result;
use crate::traits::{ApprovalMode, Tool, ToolContext, ToolSpec, require_string};
use async_trait::async_trait;

/// Reports the weather for a city. Requires the user's confirmation.
pub struct WeatherTool;

impl WeatherTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WeatherTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WeatherTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "getWeatherInformation".to_string(),
            description: "Show the weather in a given city to the user.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "city": { "type": "string" }
                },
                "required": ["city"]
            }),
            approval: ApprovalMode::Human,
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(
        &self,
        _ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let city = require_string(&arguments, "city")?;
        tracing::info!(%city, "weather lookup");
        Ok(serde_json::Value::String(format!(
            "The weather in {city} is sunny"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_llm::ConversationId;

    #[tokio::test]
    async fn weather_reports_city() {
        let ctx = ToolContext::new(ConversationId::new("c"));
        let out = WeatherTool::new()
            .execute(&ctx, serde_json::json!({ "city": "Paris" }))
            .await
            .expect("weather");
        assert_eq!(out, serde_json::json!("The weather in Paris is sunny"));
    }

    #[tokio::test]
    async fn weather_requires_city() {
        let ctx = ToolContext::new(ConversationId::new("c"));
        let err = WeatherTool::new()
            .execute(&ctx, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing key: city"));
    }
}
