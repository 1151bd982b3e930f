//! Chat agent configuration loader.
//!
//! TOML file first, then environment overrides, then validation.

use chat_tools::{ApprovalMode, ToolId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatAgentConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_model")]
    pub model: String,
    /// Extra instructions placed before the generated system prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Replaces the built-in welcome text seeded into new conversations.
    #[serde(default)]
    pub welcome_message: Option<String>,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            system_prompt: None,
            welcome_message: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible API root, e.g.
    /// `https://api.cloudflare.com/client/v4/accounts/<account>/ai/v1`.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

fn default_request_timeout_seconds() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_round_trips")]
    pub max_round_trips: u32,
    #[serde(default = "default_tool_timeout_seconds")]
    pub tool_timeout_seconds: u64,
    /// Capacity of the per-turn output channel.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

fn default_max_round_trips() -> u32 {
    10
}

fn default_tool_timeout_seconds() -> u64 {
    30
}

fn default_stream_buffer() -> usize {
    64
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_round_trips: default_max_round_trips(),
            tool_timeout_seconds: default_tool_timeout_seconds(),
            stream_buffer: default_stream_buffer(),
        }
    }
}

impl AgentConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_data_dir_string")]
    pub data_dir: String,
    #[serde(default)]
    pub storage: StorageBackend,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_data_dir_string() -> String {
    "~/.chat-agent/data".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    300
}

fn default_http_max_in_flight() -> usize {
    256
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir_string(),
            storage: StorageBackend::default(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_tick_interval_ms() -> u64 {
    1000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolsConfig {
    /// Per-tool override of the built-in approval mode.
    #[serde(default)]
    pub approval: HashMap<ToolId, ApprovalMode>,
}

impl ChatAgentConfig {
    /// Loads the config file. A missing file at the default location yields defaults;
    /// a missing file at an explicit path is an error.
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);
        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::parse(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
                tracing::warn!(config_path = %path.display(), "config file not found; using defaults");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("CHAT_AGENT_MODEL") {
            self.general.model = v;
        }
        if let Some(v) = get("CHAT_AGENT_BASE_URL") {
            self.llm.base_url = Some(v);
        }
        if let Some(v) = get("CHAT_AGENT_API_KEY").or_else(|| get("OPENAI_API_KEY")) {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = get("CHAT_AGENT_BIND_ADDR") {
            self.runtime.bind_addr = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.model.trim().is_empty() {
            return Err(anyhow::anyhow!("general.model is required"));
        }
        if self.agent.max_round_trips == 0 {
            return Err(anyhow::anyhow!("agent.max_round_trips must be > 0"));
        }
        if self.agent.tool_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("agent.tool_timeout_seconds must be > 0"));
        }
        if self.agent.stream_buffer == 0 {
            return Err(anyhow::anyhow!("agent.stream_buffer must be > 0"));
        }
        if self.llm.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("llm.request_timeout_seconds must be > 0"));
        }
        if let Some(url) = self.llm.base_url.as_deref() {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(anyhow::anyhow!(
                    "llm.base_url must be an http(s) url, got {url:?}"
                ));
            }
        }
        self.runtime
            .bind_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| {
                anyhow::anyhow!("runtime.bind_addr {:?} is invalid: {e}", self.runtime.bind_addr)
            })?;
        if self.runtime.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("runtime.http_max_in_flight must be > 0"));
        }
        if self.scheduler.enabled && self.scheduler.tick_interval_ms == 0 {
            return Err(anyhow::anyhow!("scheduler.tick_interval_ms must be > 0"));
        }
        Ok(())
    }

    pub fn api_key(&self) -> Option<String> {
        self.llm.api_key.clone().filter(|s| !s.trim().is_empty())
    }

    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        expand_home(&self.runtime.data_dir)
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".chat-agent").join("config.toml")
}

fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim();
    if !trimmed.starts_with("~/") {
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(trimmed.replacen('~', &home, 1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = ChatAgentConfig::parse("").expect("parse");
        assert_eq!(cfg.general.model, DEFAULT_MODEL);
        assert_eq!(cfg.agent.max_round_trips, 10);
        assert_eq!(cfg.runtime.storage, StorageBackend::Sqlite);
        assert!(cfg.scheduler.enabled);
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn sections_and_approval_overrides_parse() {
        let cfg = ChatAgentConfig::parse(
            r#"
[general]
model = "@cf/meta/llama-3.3-70b-instruct-fp8-fast"

[llm]
base_url = "https://api.cloudflare.com/client/v4/accounts/abc/ai/v1"

[agent]
max_round_trips = 4

[runtime]
storage = "memory"

[tools.approval]
getLocalTime = "human"
getWeatherInformation = "auto"
"#,
        )
        .expect("parse");
        assert_eq!(cfg.agent.max_round_trips, 4);
        assert_eq!(cfg.runtime.storage, StorageBackend::Memory);
        assert_eq!(
            cfg.tools.approval.get(&ToolId::GetLocalTime),
            Some(&ApprovalMode::Human)
        );
        assert_eq!(
            cfg.tools.approval.get(&ToolId::GetWeatherInformation),
            Some(&ApprovalMode::Auto)
        );
    }

    #[test]
    fn unknown_tool_in_approval_table_is_rejected() {
        let err = ChatAgentConfig::parse("[tools.approval]\nshell = \"auto\"\n").unwrap_err();
        assert!(err.to_string().contains("shell"));
    }

    #[test]
    fn env_overrides_apply_and_ignore_blank_values() {
        let mut cfg = ChatAgentConfig::default();
        cfg.apply_env_overrides(|key| match key {
            "CHAT_AGENT_MODEL" => Some("  ".to_string()),
            "OPENAI_API_KEY" => Some("sk-test".to_string()),
            "CHAT_AGENT_BIND_ADDR" => Some("0.0.0.0:9000".to_string()),
            _ => None,
        });
        assert_eq!(cfg.general.model, DEFAULT_MODEL);
        assert_eq!(cfg.api_key().as_deref(), Some("sk-test"));
        assert_eq!(cfg.runtime.bind_addr, "0.0.0.0:9000");
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = ChatAgentConfig::default();
        cfg.agent.max_round_trips = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ChatAgentConfig::default();
        cfg.runtime.bind_addr = "nope".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = ChatAgentConfig::default();
        cfg.llm.base_url = Some("ftp://x".to_string());
        assert!(cfg.validate().is_err());
    }
}
