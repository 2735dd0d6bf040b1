use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use threadconf::ThreadConfig;
use tilestore::{FileTileStore, TileStore};
use tokio_util::sync::CancellationToken;

use threadtiles::frames::MemoryFrameStore;
use threadtiles::session::{self, LoggingAnalysisHook, ManagerConfig, SessionManager};
use threadtiles::telemetry;
use threadtiles::tiles::TileServer;
use threadtiles::web;

/// Stitch chat screenshots into zoomable tile pyramids
#[derive(Parser, Debug)]
#[command(name = "threadtiles")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the capture and tile HTTP server
    Serve {
        /// Config file, replacing ./threadtiles.toml
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides bind.http_port)
        #[arg(short, long)]
        port: Option<u16>,

        /// OTLP gRPC endpoint for OpenTelemetry (e.g., "127.0.0.1:4317")
        #[arg(long)]
        otlp_endpoint: Option<String>,
    },

    /// Print the effective configuration and where it came from
    Config {
        /// Config file, replacing ./threadtiles.toml
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            port,
            otlp_endpoint,
        } => {
            let mut config =
                ThreadConfig::load_from(config.as_deref()).context("Failed to load config")?;
            if let Some(port) = port {
                config.bind.http_port = port;
            }
            if let Some(endpoint) = otlp_endpoint {
                config.telemetry.otlp_endpoint = endpoint;
            }
            serve(config).await
        }
        Commands::Config { config } => {
            let (config, sources) = ThreadConfig::load_with_sources_from(config.as_deref())
                .context("Failed to load config")?;
            for file in &sources.files {
                println!("# loaded: {}", file.display());
            }
            for var in &sources.env_overrides {
                println!("# env: {var}");
            }
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn serve(config: ThreadConfig) -> Result<()> {
    let telemetry =
        telemetry::init(&config.telemetry).context("Failed to initialize telemetry")?;

    // --- Tile Store ---
    tracing::info!("📦 Initializing tile store...");
    let tile_dir = config.paths.tile_dir();
    let tile_store: Arc<dyn TileStore> =
        Arc::new(FileTileStore::at_path(&tile_dir).context("Failed to open tile store")?);
    tracing::info!("   Tile store ready at: {}", tile_dir.display());

    // --- Sessions ---
    tracing::info!("🧵 Initializing session manager...");
    let manager_config = ManagerConfig::from_config(&config);
    let sessions = SessionManager::new(
        manager_config,
        Arc::new(MemoryFrameStore::new()),
        Arc::clone(&tile_store),
        Arc::new(LoggingAnalysisHook),
    )
    .context("Failed to create session manager")?;
    tracing::info!(
        "   Tiles: {}px + {}px overlap, {}",
        config.pyramid.tile_size,
        config.pyramid.overlap,
        config.pyramid.format
    );

    let tiles = Arc::new(TileServer::new(sessions.clone(), tile_store));

    let shutdown_token = CancellationToken::new();

    let app_router = web::router(web::WebState {
        sessions: sessions.clone(),
        tiles,
        max_request_bytes: config.sessions.max_request_bytes,
        started_at: Instant::now(),
    });

    let addr = config.bind.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("🌐 Listening on http://{}", addr);

    let shutdown_token_srv = shutdown_token.clone();
    let server = axum::serve(listener, app_router).with_graceful_shutdown(async move {
        shutdown_token_srv.cancelled().await;
        tracing::info!("Server shutdown signal received");
    });

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.await {
            tracing::error!("Server shutdown with error: {:?}", e);
        }
    });

    tracing::info!("🖼️  Server ready.");

    // Spawn background task for periodic statistics logging
    let stats_sessions = sessions.clone();
    let stats_ct = shutdown_token.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let session_stats = stats_sessions.stats();
                    let job_stats = stats_sessions.jobs().stats();
                    let frame_stats = stats_sessions.frame_stats();
                    tracing::info!(
                        sessions.total = session_stats.total,
                        sessions.collecting = session_stats.collecting,
                        sessions.completing = session_stats.completing,
                        sessions.ready = session_stats.ready,
                        sessions.failed = session_stats.failed,
                        jobs.total = job_stats.total,
                        jobs.running = job_stats.running,
                        jobs.failed = job_stats.failed,
                        jobs.timed_out = job_stats.timed_out,
                        frames.buffered = frame_stats.frames,
                        frames.bytes = frame_stats.bytes,
                        "Server statistics"
                    );
                }
                _ = stats_ct.cancelled() => {
                    break;
                }
            }
        }
    });

    session::spawn_cleanup_task(
        sessions.clone(),
        config.sessions.cleanup_interval(),
        shutdown_token.clone(),
    );

    wait_for_signal().await;
    shutdown_token.cancel();

    if let Err(e) = server_handle.await {
        tracing::error!("Server task failed: {:?}", e);
    }

    tracing::info!("👋 threadtiles stopped");
    telemetry::shutdown(telemetry);
    Ok(())
}

/// Resolve on SIGINT (Ctrl+C) or SIGTERM (systemd, containers).
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down gracefully...");
        }
    }
}
