//! chat-agent main binary.

mod config;
mod confirmation;
mod conversation;
mod init;
mod orchestrator;
mod prompt;
mod routes;
mod sanitizer;
mod scheduler;
mod server;
mod store;
mod task_runner;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(
    name = "chat-agent",
    version,
    about = "Chat agent with human-confirmed tools and scheduled tasks"
)]
struct Cli {
    /// Config file path (default: ~/.chat-agent/config.toml).
    #[arg(long, global = true, env = "CHAT_AGENT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP server (default).
    Serve,
    /// Write a config template if none exists (idempotent).
    Init,
    /// Validate config and report what the server would run with.
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(anyhow::anyhow!("failed to load .env: {e}"));
        }
    }
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Serve);

    match command {
        Command::Serve => server::serve(cli.config).await,
        Command::Init => {
            let report = init::initialize(cli.config).await?;
            if report.created.is_empty() {
                println!(
                    "chat-agent init: already initialized at {}",
                    report.root.display()
                );
            } else {
                println!("chat-agent init: initialized {}", report.root.display());
                for path in &report.created {
                    println!("created {}", path.display());
                }
            }
            println!("next: set llm.api_key or CHAT_AGENT_API_KEY, then run `chat-agent serve`");
            Ok(())
        }
        Command::Doctor => server::doctor(cli.config).await,
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(
            "info,chat_agent=debug,chat_llm=debug,chat_tools=debug,tower_http=info",
        ),
    };
    let log_format = std::env::var("CHAT_AGENT_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    match log_format.as_str() {
        "json" => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .init(),
        "pretty" => builder.pretty().init(),
        "compact" => builder.compact().init(),
        other => {
            return Err(anyhow::anyhow!(
                "unsupported CHAT_AGENT_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::info!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_serve_and_accepts_global_config() {
        let cli = Cli::try_parse_from(["chat-agent"]).expect("parse");
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["chat-agent", "doctor", "--config", "/tmp/c.toml"])
            .expect("parse");
        assert!(matches!(cli.command, Some(Command::Doctor)));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
    }

    #[test]
    fn panic_payloads_render_as_text() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_payload_to_string(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(42_u8);
        assert_eq!(panic_payload_to_string(boxed.as_ref()), "non-string panic payload");
    }
}
