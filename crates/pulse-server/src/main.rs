use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use tokio::net::TcpListener;

use pulse_server::agent::{ChatAgent, ChatService, EchoAgent};
use pulse_server::app::{AppState, create_router};
use pulse_server::config::ServerConfig;

#[derive(Debug, Parser)]
#[command(author, version, about = "Pulse - real-time chat and telemetry channel server.")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, env = "PULSE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, e.g. 127.0.0.1:8080. Overrides the config file.
    #[arg(long)]
    listen: Option<String>,

    /// Log filter, e.g. info or pulse_server=debug. Overrides the config file.
    #[arg(long)]
    log_level: Option<String>,
}

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(log_level) = cli.log_level {
        config.log_level = log_level;
    }

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.clone()),
    )
    .init();

    serve(config)
}

#[tokio::main]
async fn serve(config: ServerConfig) -> Result<()> {
    let addr = config.listen_addr()?;

    // The echo agent stands in for the LLM/FHIR orchestration path, which
    // plugs in through the same ChatAgent seam.
    let state = AppState::new(|emitter| {
        Arc::new(ChatService::new(Arc::new(EchoAgent::new(emitter)))) as Arc<dyn ChatAgent>
    });
    let registry = state.registry.clone();
    let router = create_router(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("pulse-server listening on {addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            // Best-effort notice to connected clients; their channel
            // managers will reconnect against the next instance.
            registry.broadcast(|session_id| pulse_protocol::Envelope::ChannelStatus {
                session_id: session_id.to_string(),
                state: pulse_protocol::ChannelState::Disconnected,
            });
        })
        .await
        .context("serving")
}
