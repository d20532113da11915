use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use tokio::signal;
use tracing::info;

mod api;
mod config;
mod error;
mod log;
mod probe;
mod proxy;
mod registry;
mod selector;
mod splitter;
mod state;
mod status;

pub use config::Config;
pub use error::AppError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit /healthz and exit immediately.
    // This avoids needing any external tool (curl/wget) in the container image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "playbook_dispatch=info,tower_http=warn".into()),
        )
        .init();

    // Load the backend pool. The loader never fails — a missing or broken
    // config yields the single-localhost default pool.
    let config_path = std::env::var("PBD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("backends.json"));
    let config = Config::load_or_default(&config_path);

    info!(
        config = %config_path.display(),
        backends = config.backends.len(),
        "playbook-dispatch starting"
    );

    let html_dir = std::env::var("PBD_HTML_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("html"));

    let state = Arc::new(state::DispatchState::new(config));

    let port = std::env::var("PBD_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(5000);
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "dispatcher listening");

    let trace_layer = tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));

    let app = api::router(Arc::clone(&state), &html_dir)
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(trace_layer);

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /healthz and exit 0 on 200, 1 otherwise.
/// Invoked via `playbook-dispatch --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("PBD_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(5000);

    let url = format!("http://127.0.0.1:{port}/healthz");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}
