use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;

mod commands;

#[derive(Parser)]
#[command(name = "agent-session")]
#[command(about = "Open agent channels, watch their events, and issue correlated requests")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom config directory (defaults to ~/.agent-session)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every session event as a JSON line until Ctrl+C
    Listen(ListenArgs),

    /// Send one correlated request and print the response
    Request(RequestArgs),
}

#[derive(Args)]
pub(crate) struct ListenArgs {
    /// Channel to open (repeatable)
    #[arg(short, long = "channel", required = true)]
    pub channels: Vec<String>,
}

#[derive(Args)]
pub(crate) struct RequestArgs {
    /// Channel to send on
    #[arg(short, long)]
    pub channel: String,

    /// Request message type, e.g. FetchDocument
    #[arg(short, long)]
    pub message_type: String,

    /// Request field as key=value; values that parse as JSON are sent as JSON
    #[arg(short, long = "field", value_parser = parse_field)]
    pub fields: Vec<(String, serde_json::Value)>,

    /// Response field holding an entity to cache (e.g. document)
    #[arg(long, requires_all = ["entity_type", "category"])]
    pub entity_field: Option<String>,

    /// Entity type applied when the response entity has none
    #[arg(long)]
    pub entity_type: Option<String>,

    /// Category to store the entity under
    #[arg(long)]
    pub category: Option<String>,
}

fn parse_field(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    if key.is_empty() {
        return Err(format!("empty field name in `{raw}`"));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries JSON lines.
    let default_directive = if cli.debug {
        "agent_session=debug,agent_session_cli=debug,info"
    } else {
        "agent_session=info,agent_session_cli=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config_dir = agent_session::config::resolve_config_dir(cli.config_dir)?;
    let config = agent_session::SessionConfig::load(&config_dir)?;

    match cli.command {
        Commands::Listen(args) => commands::listen(config, args).await,
        Commands::Request(args) => commands::request(config, args).await,
    }
}
