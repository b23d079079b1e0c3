//! # FieldSync Agent Daemon
//!
//! Headless entry point. Runs the agent until Ctrl-C or SIGTERM.
//!
//! ## Startup Sequence
//! 1. Load configuration (file path from the first argument, or the default)
//! 2. Initialize tracing
//! 3. Open the database under the data directory & run migrations
//! 4. Build and start the agent
//! 5. Wait for a shutdown signal, then stop the agent

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fieldsync_db::{Database, DbConfig};
use fieldsync_sync::config::LoggingSettings;
use fieldsync_sync::{FieldAgent, LogEmitter, SyncConfig};

const DATABASE_FILE: &str = "fieldsync.db";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = SyncConfig::load(config_path).context("loading configuration")?;

    init_tracing(&config.logging);
    info!(
        environment = ?config.app.environment,
        data_dir = %config.app.data_dir.display(),
        "Starting FieldSync agent"
    );

    std::fs::create_dir_all(&config.app.data_dir)
        .with_context(|| format!("creating {}", config.app.data_dir.display()))?;
    let db = Database::new(DbConfig::new(config.app.data_dir.join(DATABASE_FILE)))
        .await
        .context("opening database")?;

    let mut agent = FieldAgent::builder(config)
        .with_database(db)
        .with_emitter(Arc::new(LogEmitter))
        .build()
        .context("building agent")?;

    agent.start().await.context("starting agent")?;

    shutdown_signal().await;

    agent.shutdown().await.context("stopping agent")?;
    info!("Agent shutdown complete");
    Ok(())
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(settings: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},sqlx=warn,hyper=warn,reqwest=warn", settings.level))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(settings.ansi)
        .with_target(true)
        .init();
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping agent");
}
