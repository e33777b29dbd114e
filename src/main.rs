use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wa_relay::gateway::{self, AppState};
use wa_relay::health;
use wa_relay::lifecycle::{LifecycleManager, StartOutcome};
use wa_relay::transport::SidecarFactory;
use wa_relay::Config;

// ── CLI definition ─────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "wa-relay", about = "REST relay for a single WhatsApp Web session", version)]
struct Cli {
    /// Path to TOML config file (defaults + environment if omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP gateway and the session supervisor (default)
    Serve,
    /// Print the effective configuration with secrets masked
    Config,
}

// ── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging - respects RUST_LOG env var, defaults to INFO for this crate
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wa_relay=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Config => {
            print!("{}", config.to_masked_toml()?);
            Ok(())
        }
    }
}

// ── Serve ──────────────────────────────────────────────────────────────────

async fn serve(config: Config) -> Result<()> {
    health::mark_component_starting(gateway::COMPONENT);
    if config.uses_default_api_key() {
        warn!("API key is the built-in default; set API_KEY before exposing this service");
    }

    let factory = SidecarFactory::new(
        config.transport.command.clone(),
        config.transport.args.clone(),
    );
    let manager = LifecycleManager::new(config.lifecycle_config(), Arc::new(factory));

    let mut state = AppState::new(manager.clone(), config.gateway.api_key.as_str());
    state.debug_event_limit = config.session.debug_event_limit;
    state.body_limit_bytes = config.gateway.body_limit_bytes;

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(gateway::serve(listener, state, async move {
        let _ = shutdown_rx.changed().await;
    }));

    let first = tokio::select! {
        outcome = manager.start() => Some(outcome),
        () = shutdown_signal() => None,
    };

    let result = match first {
        Some(StartOutcome::Failed(failure)) if failure.is_setup() => {
            Err(anyhow::Error::new(failure).context("session could not be set up"))
        }
        Some(outcome) => {
            info!(?outcome, "Initial session start finished");
            shutdown_signal().await;
            Ok(())
        }
        None => Ok(()),
    };

    info!("Shutting down");
    manager.stop().await;
    let _ = shutdown_tx.send(true);
    match server.await {
        Ok(Err(e)) => warn!("HTTP gateway exited with error: {e:#}"),
        Err(e) => warn!("HTTP gateway task failed: {e}"),
        Ok(Ok(())) => {}
    }

    info!("Server stopped.");
    result
}

// ── Graceful shutdown ──────────────────────────────────────────────────────

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping..."),
        Err(e) => {
            warn!("Failed to install CTRL+C handler: {e}");
            std::future::pending::<()>().await;
        }
    }
}
