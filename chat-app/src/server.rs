//! Chat agent HTTP server.
//!
//! Wires storage, scheduler, tool registry and model client into [`AppState`]
//! and mounts the API routes.

use crate::config::{ChatAgentConfig, RuntimeConfig, StorageBackend};
use crate::conversation::ChatAgent;
use crate::orchestrator::{OrchestratorSettings, StreamOrchestrator};
use crate::routes;
use crate::scheduler::Scheduler;
use crate::store::{ConversationStore, MemoryStore, SqliteStore, TaskStore};
use anyhow::Result;
use axum::http::{HeaderMap, Method, Request, StatusCode, header};
use axum::response::Response;
use axum::{Extension, Router};
use chat_llm::LlmClient;
use chat_tools::ToolRegistry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub agent: Arc<ChatAgent>,
    pub scheduler: Arc<Scheduler>,
    pub registry: Arc<ToolRegistry>,
    pub model: String,
    pub base_url: String,
    pub llm_configured: bool,
    pub storage: StorageBackend,
    pub started_at: Instant,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = ChatAgentConfig::load_with_path(config_path).await?;
    let scheduler = Arc::new(
        Scheduler::load(cfg.scheduler.clone(), Arc::new(MemoryStore::new())).await?,
    );
    let registry = chat_tools::default_registry(scheduler, &cfg.tools.approval)?;
    let confirmation_tools: Vec<&str> = registry
        .descriptors()
        .filter(|d| d.requires_confirmation())
        .map(|d| d.name())
        .collect();
    tracing::info!(
        model = %cfg.general.model,
        llm_base_url = ?cfg.llm.base_url,
        llm_api_key_configured = cfg.api_key().is_some(),
        runtime_storage = ?cfg.runtime.storage,
        runtime_data_dir = %cfg.runtime.data_dir,
        runtime_bind_addr = %cfg.runtime.bind_addr,
        tool_count = registry.len(),
        confirmation_tools = ?confirmation_tools,
        config_path = %path.display(),
        "config ok"
    );
    if cfg.api_key().is_none() {
        tracing::warn!("no model api key configured; set llm.api_key or CHAT_AGENT_API_KEY");
    }
    Ok(())
}

pub async fn build_state(cfg: &ChatAgentConfig) -> Result<Arc<AppState>> {
    let (conversations, tasks) = match cfg.runtime.storage {
        StorageBackend::Sqlite => {
            let store = Arc::new(SqliteStore::open(cfg.data_dir()?).await?);
            let conversations: Arc<dyn ConversationStore> = store.clone();
            let tasks: Arc<dyn TaskStore> = store;
            (conversations, tasks)
        }
        StorageBackend::Memory => {
            tracing::warn!("memory storage selected; conversations are lost on restart");
            let store = Arc::new(MemoryStore::new());
            let conversations: Arc<dyn ConversationStore> = store.clone();
            let tasks: Arc<dyn TaskStore> = store;
            (conversations, tasks)
        }
    };

    let scheduler = Arc::new(Scheduler::load(cfg.scheduler.clone(), tasks).await?);
    let registry = Arc::new(chat_tools::default_registry(
        scheduler.clone(),
        &cfg.tools.approval,
    )?);
    tracing::info!(
        tool_count = registry.len(),
        tools = ?registry.descriptors().map(|d| d.name()).collect::<Vec<_>>(),
        "tool registry built"
    );

    let api_key = cfg.api_key().unwrap_or_default();
    let client = LlmClient::new(
        cfg.llm.base_url.as_deref(),
        &api_key,
        &cfg.general.model,
        Duration::from_secs(cfg.llm.request_timeout_seconds),
    );
    let base_url = client.base_url().to_string();
    let llm_configured = client.has_credentials();
    if !llm_configured {
        tracing::warn!("no model api key configured; turns will fail until one is set");
    }

    let orchestrator = StreamOrchestrator::new(
        Arc::new(client),
        registry.clone(),
        OrchestratorSettings::from(cfg),
    );
    let agent = Arc::new(ChatAgent::new(
        conversations,
        registry.clone(),
        orchestrator,
        cfg.agent.tool_timeout(),
        cfg.general.welcome_message.clone(),
    ));

    Ok(Arc::new(AppState {
        agent,
        scheduler,
        registry,
        model: cfg.general.model.clone(),
        base_url,
        llm_configured,
        storage: cfg.runtime.storage,
        started_at: Instant::now(),
    }))
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = ChatAgentConfig::load_with_path(config_path).await?;
    let addr: SocketAddr = cfg
        .runtime
        .bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind addr {}: {e}", cfg.runtime.bind_addr))?;
    tracing::info!(
        config_path = %cfg_path.display(),
        model = %cfg.general.model,
        llm_base_url = ?cfg.llm.base_url,
        runtime_storage = ?cfg.runtime.storage,
        runtime_data_dir = %cfg.runtime.data_dir,
        runtime_http_timeout_seconds = cfg.runtime.http_timeout_seconds,
        runtime_http_max_in_flight = cfg.runtime.http_max_in_flight,
        agent_max_round_trips = cfg.agent.max_round_trips,
        agent_tool_timeout_seconds = cfg.agent.tool_timeout_seconds,
        scheduler_enabled = cfg.scheduler.enabled,
        scheduler_tick_interval_ms = cfg.scheduler.tick_interval_ms,
        bind_addr = %addr,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let state = build_state(&cfg).await?;
    state.scheduler.start(state.agent.clone()).await;

    let app = app(state.clone(), &cfg.runtime);
    let shutdown = CancellationToken::new();

    tracing::info!(%addr, "chat agent serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    state.scheduler.shutdown().await;
    Ok(())
}

pub fn app(state: Arc<AppState>, runtime: &RuntimeConfig) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(AllowOrigin::any());

    routes::router()
        .layer(Extension(state))
        .layer(cors)
        .layer(GlobalConcurrencyLimitLayer::new(runtime.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(runtime.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
            _ = shutdown.cancelled() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::warn!("received ctrl-c; beginning graceful shutdown"),
                Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
            },
            _ = shutdown.cancelled() => {}
        }
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backed_state_builds_without_credentials() {
        let mut cfg = ChatAgentConfig::default();
        cfg.runtime.storage = StorageBackend::Memory;
        cfg.llm.api_key = None;
        let state = build_state(&cfg).await.expect("state");
        assert!(!state.llm_configured);
        assert_eq!(state.registry.len(), 5);
        assert_eq!(state.model, crate::config::DEFAULT_MODEL);
    }

    #[tokio::test]
    async fn sqlite_state_uses_data_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = ChatAgentConfig::default();
        cfg.runtime.data_dir = dir.path().display().to_string();
        let state = build_state(&cfg).await.expect("state");
        assert_eq!(state.storage, StorageBackend::Sqlite);
        assert!(dir.path().join("chat-agent.sqlite3").exists());
    }

    #[test]
    fn request_id_falls_back_to_missing() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_id_from_headers(&headers), "missing");
        headers.insert("x-request-id", "abc".parse().expect("header"));
        assert_eq!(request_id_from_headers(&headers), "abc");
    }
}
