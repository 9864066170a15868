//! raftguard -- Raft consensus and automatic-failover controller.
//!
//! Crash-only design: every startup is a recovery. The log store replays
//! its hard state and log on open, and the node rejoins as a follower.
//! A store that cannot be opened or recovered leaves the worker in `ERROR`
//! while the control surface keeps serving, so operators can see why.
//! SIGTERM/SIGINT only stop accepting connections and stop the background
//! tasks.

use std::sync::Arc;

use axum::Router;
use clap::Parser;
use tracing::{error, info};

use raftguard::cluster::control::ClusterController;
use raftguard::config::StorageConfig;
use raftguard::errors::ClusterError;
use raftguard::raft::log::NodeInfo;
use raftguard::storage::memory::MemoryLogStore;
use raftguard::storage::sqlite::SqliteLogStore;
use raftguard::storage::store::{LogStore, StorageError};
use raftguard::transport::http::HttpTransport;

/// Command-line arguments for the raftguard server.
#[derive(Parser, Debug)]
#[command(
    name = "raftguard",
    version,
    about = "Raft consensus and automatic-failover controller"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "raftguard.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = raftguard::config::load_config(&cli.config)?;
    let debug = raftguard::logging::init_tracing(&config.logging)?;
    info!("Loaded configuration from {}", cli.config);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        raftguard::metrics::init_metrics();
        raftguard::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    // Crash-only startup: opening the store IS recovery.
    let (store, store_failure): (Arc<dyn LogStore>, Option<ClusterError>) =
        match open_store(&config.storage) {
            Ok(store) => (store, None),
            Err(e) => {
                error!(path = %config.storage.path, error = %e, "failed to open the log store");
                let unavailable: Arc<dyn LogStore> = Arc::new(SqliteLogStore::unavailable());
                (unavailable, Some(ClusterError::from(e)))
            }
        };

    let transport = Arc::new(HttpTransport::new(config.raft.rpc_timeout()));
    let controller = Arc::new(ClusterController::new(
        config.clone(),
        store,
        transport,
        debug,
    ));

    if let Some(failure) = &store_failure {
        controller.record_storage_failure(failure);
    } else if let Some(node) = &config.node {
        match controller.init(NodeInfo::from(node)).await {
            Ok(_) => {}
            // Already reported through the worker state.
            Err(ClusterError::Storage(_)) => {}
            Err(e) => {
                controller.shutdown().await;
                return Err(e.into());
            }
        }
    } else {
        info!("No node identity configured; waiting for POST /control/init");
    }

    let state = Arc::new(raftguard::AppState {
        config: config.clone(),
        controller: Arc::clone(&controller),
    });
    let app = raftguard::server::app(state);

    let served = serve(&bind_addr, app).await;
    controller.shutdown().await;
    info!("raftguard shut down");

    served
}

fn open_store(config: &StorageConfig) -> Result<Arc<dyn LogStore>, StorageError> {
    if config.engine == "memory" {
        info!("In-memory log store initialized (state is lost on exit)");
        return Ok(Arc::new(MemoryLogStore::new()));
    }
    let path = &config.path;
    if let Some(parent) = std::path::Path::new(path).parent() {
        std::fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
    }
    let store = SqliteLogStore::open(path)?;
    info!("SQLite log store opened at {}", path);
    Ok(Arc::new(store))
}

/// Bind and serve until a shutdown signal arrives.
async fn serve(bind_addr: &str, app: Router) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("raftguard listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
