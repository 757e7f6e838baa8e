//! # Sensor Telemetry Server
//!
//! Generates synthetic sensor readings once per tick, keeps a short persisted
//! history, and streams every new reading to connected WebSocket clients, who can
//! steer the simulated speed with `speedDelta` messages.
//!
//! ## Endpoints:
//! - `GET /api/sensors/latest` and `GET /api/sensors/history` for queries.
//! - `GET /ws` for the realtime stream.
//! - `GET /health` for liveness checks.
//!
//! Settings come from built-in defaults, `server_telemetry.conf`, environment
//! variables (`TELEMETRY_*`) and command-line arguments, in increasing priority.

use anyhow::{Context, Result};
use lib_common::telemetry::{router, AppContext, Engine, MemoryStore, ReadingStore, SqliteStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

mod telemetry_logic;
use telemetry_logic::config::{self, Settings, StorageBackend};
use telemetry_logic::logger;

#[tokio::main]
async fn main() -> Result<()> {
    let (settings, notices) = config::load_config();
    logger::setup_logging(&settings.log_dir, &settings.log_level)
        .with_context(|| format!("Failed to set up logging in {}", settings.log_dir.display()))?;
    for (level, message) in notices {
        log::log!(level, "{}", message);
    }
    settings.engine.validate().context("Invalid engine configuration")?;

    match settings.storage {
        StorageBackend::Sqlite => {
            let store = SqliteStore::open(&settings.db_path)
                .await
                .with_context(|| format!("Failed to open database {}", settings.db_path.display()))?;
            serve(settings, store).await
        }
        StorageBackend::Memory => {
            log::warn!("Using in-memory storage; history will not survive a restart.");
            serve(settings, MemoryStore::new()).await
        }
    }
}

async fn serve<S: ReadingStore>(settings: Settings, backend: S) -> Result<()> {
    let ctx = Arc::new(AppContext::new(settings.engine.clone(), backend));

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let engine = Engine::start(Arc::clone(&ctx)).await?;
    tokio::spawn(watch_signals(ctx.shutdown.clone()));

    log::info!("Server running at http://{}", addr);
    let shutdown = ctx.shutdown.clone();
    let served = axum::serve(listener, router(Arc::clone(&ctx)))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;

    // Drain the hand-off buffer even if the listener failed.
    ctx.shutdown.cancel();
    engine.shutdown().await;
    served.context("HTTP server failed")?;

    log::info!("Shutdown complete.");
    Ok(())
}

async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl-C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("Ctrl-C received, initiating shutdown."),
        _ = terminate => log::info!("SIGTERM received, initiating shutdown."),
    }
    shutdown.cancel();
}
