use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nexus_server::api::{self, health::HealthCache, AppState};
use nexus_server::auth;
use nexus_server::config::NexusConfig;
use nexus_server::db;
use nexus_server::gpu::GpuProbe;
use nexus_server::notifications::Notifier;
use nexus_server::scheduler::Scheduler;
use nexus_server::session::ScreenSession;

#[derive(Debug, Parser)]
#[command(name = "nexus-server", about = "Single-node GPU job scheduler")]
struct Args {
    /// Server home directory (defaults to NEXUS_HOME or ~/.nexus_server)
    #[arg(long)]
    home: Option<PathBuf>,

    /// Bind host
    #[arg(long)]
    host: Option<String>,

    /// Bind port
    #[arg(long)]
    port: Option<u16>,

    /// Node identity stamped onto jobs
    #[arg(long)]
    node_name: Option<String>,

    /// Scheduler tick interval in seconds
    #[arg(long)]
    refresh_rate: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let home = match args.home {
        Some(home) => home,
        None => NexusConfig::default_home()?,
    };

    let mut config = NexusConfig::load(home).context("Failed to load configuration")?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(node_name) = args.node_name {
        config.node_name = node_name;
    }
    if let Some(refresh_rate) = args.refresh_rate {
        config.refresh_rate = refresh_rate;
    }
    config.validate().context("Invalid configuration")?;
    config
        .materialize_home()
        .context("Failed to create server home")?;

    let file_appender = tracing_appender::rolling::never(config.logs_dir(), "server.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    info!("Starting Nexus server (home: {})", config.home.display());
    if let Some(n) = config.mock_gpus {
        info!("MOCK_GPUS={n}: using the synthetic GPU probe");
    }

    let token = auth::ensure_token(&config.token_file()).context("Failed to set up API token")?;

    let pool = db::create_pool(&config.db_file())
        .await
        .context("Failed to open job database")?;
    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let config = Arc::new(config);
    let probe = Arc::new(GpuProbe::new(config.mock_gpus));
    let session = Arc::new(ScreenSession::new());
    let notifier = Arc::new(Notifier::new());

    let shutdown = install_shutdown_handler();

    let scheduler = Scheduler::new(
        pool.clone(),
        Arc::clone(&config),
        session,
        Arc::clone(&probe),
        notifier,
    );
    let scheduler_shutdown = shutdown.clone();
    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(scheduler_shutdown).await;
    });

    let state = AppState {
        pool,
        config: Arc::clone(&config),
        probe,
        token: Arc::new(token),
        health_cache: Arc::new(HealthCache::default()),
    };
    let app = api::create_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Listening on {addr}");

    let server_shutdown = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
    .await
    .context("HTTP server error")?;

    if let Err(e) = scheduler_handle.await {
        error!("Scheduler task panicked: {e}");
    }

    info!("Server shut down cleanly");
    Ok(())
}

/// Cancelled when SIGTERM or SIGINT arrives; every subsystem drains on it.
fn install_shutdown_handler() -> CancellationToken {
    use tokio::signal::unix::{signal, SignalKind};

    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to install SIGINT handler: {e}");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        }

        token_clone.cancel();
    });

    token
}
