mod access_log;
mod exposition;
mod handlers;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use clap::Parser;
use thiserror::Error;
use tower_http::compression::CompressionLayer;
use tracing::{error, info};

use expexp_core::config::{Config, ConfigError};
use expexp_core::metrics::ProxyMetrics;

use access_log::AccessLogLayer;
use state::{AppInner, SharedState};

// ============================================================
// CLI
// ============================================================

#[derive(Parser)]
#[command(name = "expexp", about = "Prometheus exposition proxy for local files", version = expexp_core::VERSION)]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:9999", env = "EXPEXP_LISTEN")]
    listen: String,

    /// Path to the YAML module configuration.
    #[arg(long, env = "EXPEXP_CONFIG")]
    config: PathBuf,

    /// Route serving proxied modules.
    #[arg(long, default_value = "/proxy")]
    proxy_path: String,

    /// Route serving the proxy's own counters.
    #[arg(long, default_value = "/metrics")]
    telemetry_path: String,
}

#[derive(Debug, Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot register proxy metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("invalid listen address {addr:?}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("route paths must be distinct and start with '/': {proxy:?}, {telemetry:?}")]
    Routes { proxy: String, telemetry: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

// ============================================================
// Main
// ============================================================

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("expexp=info,expexp_core=info")),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(async_main(args)) {
        error!(error = %e, "expexp stopped");
        process::exit(1);
    }
}

async fn async_main(args: Args) -> Result<(), StartupError> {
    info!(version = expexp_core::VERSION, config = %args.config.display(), "starting");

    let config = Config::from_path(&args.config)?;
    for module in config.modules() {
        info!(
            module = module.name(),
            path = module.base_path(),
            use_mtime = module.use_mtime(),
            sub_paths = module.allow_pattern().is_some(),
            "file module configured"
        );
    }
    if config.is_empty() {
        info!("no modules configured; only telemetry will be served");
    }

    let valid_route = |p: &str| p.starts_with('/');
    if !valid_route(&args.proxy_path)
        || !valid_route(&args.telemetry_path)
        || args.proxy_path == args.telemetry_path
        || args.proxy_path == "/health"
        || args.telemetry_path == "/health"
    {
        return Err(StartupError::Routes {
            proxy: args.proxy_path,
            telemetry: args.telemetry_path,
        });
    }

    let state: SharedState = Arc::new(AppInner {
        config,
        metrics: Arc::new(ProxyMetrics::new()?),
    });

    let app = build_router(state, &args.proxy_path, &args.telemetry_path)
        .into_make_service_with_connect_info::<SocketAddr>();

    let addr: SocketAddr = args.listen.parse().map_err(|source| StartupError::Listen {
        addr: args.listen.clone(),
        source,
    })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind { addr, source })?;
    info!(%addr, proxy = %args.proxy_path, telemetry = %args.telemetry_path, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(StartupError::Serve)?;

    info!("shut down");
    Ok(())
}

pub(crate) fn build_router(state: SharedState, proxy_path: &str, telemetry_path: &str) -> Router {
    Router::new()
        .route(proxy_path, get(handlers::handle_proxy))
        .route(telemetry_path, get(handlers::handle_metrics))
        .route("/health", get(handlers::handle_health))
        .with_state(state)
        .layer(AccessLogLayer)
        .layer(CompressionLayer::new())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
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
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
