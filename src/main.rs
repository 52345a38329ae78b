//! depositstore -- chunked upload server for deposit submissions.
//!
//! Crash-only design: every startup is a recovery. Fragments left by an
//! interrupted upload stay staged and complete when the client resends the
//! missing chunks. SIGTERM/SIGINT handlers only stop accepting connections
//! and wait with a timeout before exiting -- no cleanup.

use std::future::IntoFuture;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use depositstore::config::{Config, LoggingConfig};
use depositstore::session::SubmissionUploadSession;

/// Command-line arguments for the depositstore server.
#[derive(Parser, Debug)]
#[command(
    name = "depositstore",
    version,
    about = "Chunked upload server for deposit submissions"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "depositstore.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,

    /// Override the upload root directory.
    #[arg(long)]
    upload_root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (mut config, config_found) = if Path::new(&cli.config).exists() {
        (depositstore::config::load_config(&cli.config)?, true)
    } else {
        (Config::default(), false)
    };
    if let Some(root) = cli.upload_root {
        config.storage.upload_root = root;
    }

    init_tracing(&config.logging);

    if config_found {
        info!("Loaded configuration from {}", cli.config);
    } else {
        warn!(
            "Configuration file {} not found, using defaults",
            cli.config
        );
    }

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    // Crash-only startup: every startup IS recovery.
    info!("Crash-only startup: staged fragments are kept for resumption");

    if config.observability.metrics {
        depositstore::metrics::init_metrics()?;
        depositstore::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let session = SubmissionUploadSession::from_config(&config)?;
    info!(
        "Upload root initialized at {}",
        session.store().root().display()
    );

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    let state = Arc::new(depositstore::AppState {
        config,
        session: Arc::new(session),
    });

    let app = depositstore::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("depositstore listening on {}", bind_addr);

    // Graceful shutdown: on SIGTERM/SIGINT, stop accepting new connections
    // and wait for in-flight requests, bounded by the shutdown timeout.
    let stopping = Arc::new(Notify::new());
    let signal_stopping = stopping.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signal_stopping.notify_one();
        })
        .into_future();

    tokio::select! {
        result = server => result?,
        _ = async {
            stopping.notified().await;
            tokio::time::sleep(shutdown_timeout).await;
        } => {
            warn!(
                "In-flight requests still running after {}s, exiting",
                shutdown_timeout.as_secs()
            );
        }
    }

    info!("depositstore shut down");

    Ok(())
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` takes precedence over `logging.level`; `logging.format: json`
/// switches to structured JSON lines.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
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
