//! # parley
//!
//! `parley serve` runs the turn server; `parley connect` opens a supervised
//! client connection and relays stdin lines as user turns.

#![deny(unsafe_code)]

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use parley_client::{ConnectionSupervisor, SupervisorConfig, WsConnector};
use parley_core::store::InMemorySessionStore;
use parley_core::{ClientFrame, ServerFrame, TemplateStore};
use parley_llm::{AnthropicClient, LlmExecutor, LlmPlanner};
use parley_server::shutdown::wait_for_signal;
use parley_server::{ParleyServer, ServerConfig};
use parley_settings::ParleySettings;
use parley_telemetry::{init_telemetry, TelemetryConfig};
use tokio::io::{AsyncBufReadExt, BufReader};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "parley", about = "Streaming two-stage turn server")]
struct Cli {
    /// Settings file (defaults to `~/.parley/settings.json`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the WebSocket turn server.
    Serve(ServeArgs),
    /// Connect to a server and chat from stdin.
    Connect(ConnectArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Args, Debug)]
struct ConnectArgs {
    /// Server URL, e.g. `ws://127.0.0.1:9480/ws`.
    #[arg(long)]
    url: Option<String>,

    /// Subject to bind the session to.
    #[arg(long, default_value = "guest")]
    subject: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = cli
        .config
        .clone()
        .unwrap_or_else(parley_settings::settings_path);
    let settings = parley_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;

    let _telemetry = init_telemetry(TelemetryConfig::from(&settings.telemetry))
        .context("Failed to initialize logging")?;

    match cli.command {
        Command::Serve(args) => serve(settings, args).await,
        Command::Connect(args) => connect(settings, args).await,
    }
}

async fn serve(settings: ParleySettings, args: ServeArgs) -> Result<()> {
    let mut config = ServerConfig::from_settings(&settings);
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let client = Arc::new(
        AnthropicClient::from_settings(&settings.llm)
            .context("Failed to create generation client")?,
    );
    let planner = Arc::new(LlmPlanner::new(
        Arc::clone(&client),
        settings.llm.planner_model.clone(),
    ));
    let executor = Arc::new(LlmExecutor::new(client, settings.llm.executor_model.clone()));
    let store = Arc::new(InMemorySessionStore::new(config.history_limit));

    let server = ParleyServer::new(
        config,
        planner,
        executor,
        store,
        Arc::new(TemplateStore::default()),
    );
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("parley listening on ws://{addr}/ws");

    wait_for_signal().await;

    tracing::info!("Shutting down...");
    let _ = server.notify_shutdown();
    server
        .shutdown()
        .graceful_shutdown(vec![handle], Some(SHUTDOWN_TIMEOUT))
        .await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn connect(settings: ParleySettings, args: ConnectArgs) -> Result<()> {
    let url = args.url.unwrap_or_else(|| settings.client.url.clone());
    let connector = Arc::new(WsConnector::new(url.clone()));
    let (supervisor, handle, mut inbound) =
        ConnectionSupervisor::new(connector, SupervisorConfig::from_settings(&settings.client));
    let supervisor = supervisor.with_greeting(ClientFrame::Initialize {
        subject_id: args.subject.clone(),
        profile: None,
    });
    let supervisor = tokio::spawn(supervisor.run());
    tracing::info!(%url, "connecting");

    let printer = tokio::spawn(async move {
        while let Some(frame) = inbound.recv().await {
            match frame {
                ServerFrame::StreamChunk { content, .. } => {
                    print!("{content}");
                    let _ = std::io::stdout().flush();
                }
                ServerFrame::FinalResponse { .. } => println!(),
                other => match serde_json::to_string(&other) {
                    Ok(line) => eprintln!("{line}"),
                    Err(e) => tracing::warn!(error = %e, "unprintable frame"),
                },
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        let frame = ClientFrame::UserInput {
            subject_id: args.subject.clone(),
            text: text.to_string(),
        };
        if handle.send(frame).await.is_err() {
            break;
        }
    }

    handle.shutdown();
    let result = supervisor.await.context("Supervisor task panicked")?;
    printer.abort();
    result.context("Connection supervisor failed")
}
