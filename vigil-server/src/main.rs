//! # Vigil Server
//!
//! Runs the orchestration loop that schedules discovery and scan policies,
//! dispatches jobs to external workers and reconciles their results, and
//! serves the HTTP API around it.

use std::{net::SocketAddr, path::PathBuf};

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil_config::{Config, ConfigLoad, ConfigLoader, ConfigLoaderOptions};
use vigil_server::{
    AppState, create_app,
    infra::orchestration::{build_runtime, connect_pool},
};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "vigil-server")]
#[command(about = "Security posture discovery and scan orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ServeArgs {
    /// Path to the TOML configuration file
    #[arg(long, env = "VIGIL_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Path to a .env file (defaults to ./.env)
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Server port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long)]
    host: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP server and the orchestration loop (default)
    Serve,
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Db(DbCommand::Migrate)) => run_db_migrate(&cli.serve).await,
        Some(Command::Serve) | None => run_server(&cli.serve).await,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Dispatch decisions stay visible at the default level. Override via RUST_LOG.
                "info,vigil::dispatch=info,tower_http=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_runtime_config(args: &ServeArgs) -> anyhow::Result<Config> {
    let ConfigLoad {
        mut config,
        warnings,
    } = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: args.config.clone(),
        env_file: args.env_file.clone(),
    })
    .load()
    .context("failed to load configuration")?;

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host.clone() {
        config.server.host = host;
    }

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file loaded");
    }
    for warning in warnings.iter() {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    let orchestrator = &config.orchestrator;
    info!(
        orchestrator.tick_interval_ms = orchestrator.tick_interval_ms,
        orchestrator.dispatch_batch_size = orchestrator.dispatch_batch_size,
        orchestrator.dispatch_timeout_secs = orchestrator.timeouts.dispatch_timeout_secs,
        orchestrator.discovery_execution_secs =
            orchestrator.timeouts.discovery_execution_secs,
        orchestrator.scan_execution_secs = orchestrator.timeouts.scan_execution_secs,
        orchestrator.lease_ttl_secs = orchestrator.lease.lease_ttl_secs,
        "orchestrator configuration in effect"
    );

    Ok(config)
}

async fn run_db_migrate(args: &ServeArgs) -> anyhow::Result<()> {
    init_tracing();
    let config = load_runtime_config(args)?;
    let url = config
        .database
        .url
        .as_deref()
        .context("DATABASE_URL must be set to run migrations")?;
    let pool = connect_pool(url, config.database.max_connections).await?;
    vigil_core::MIGRATOR
        .run(&pool)
        .await
        .context("database migration failed")?;
    info!("Database migrations applied successfully");
    Ok(())
}

async fn run_server(args: &ServeArgs) -> anyhow::Result<()> {
    init_tracing();
    let config = load_runtime_config(args)?;

    let runtime = build_runtime(&config).await?;
    runtime.start().await;

    let app = create_app(AppState::new(runtime.clone()));
    let addr: SocketAddr = config
        .server
        .bind_address()
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind_address()))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("Starting Vigil server on {}", addr);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    runtime.shutdown().await;
    served.context("HTTP server failed")?;
    info!("Vigil server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
