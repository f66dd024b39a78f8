use anyhow::{Context, Result};
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    extract::State,
    http::{HeaderValue, Method},
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use super::download_routes::download_routes;
use super::history_routes::history_routes;
use super::metadata_routes::metadata_routes;
use super::metrics::metrics_handler;
use super::settings_routes::settings_routes;
use super::websocket::ws_handler;
use super::{log_requests, state::ServerState, ServerConfig};

#[derive(Serialize)]
struct HealthResponse {
    pub status: &'static str,
    pub time: u64,
    pub uptime: String,
    pub version: &'static str,
    pub hash: String,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

async fn health(State(state): State<ServerState>) -> impl IntoResponse {
    let time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    Json(HealthResponse {
        status: "healthy",
        time,
        uptime: format_uptime(state.start_time.elapsed()),
        version: env!("CARGO_PKG_VERSION"),
        hash: state.hash.clone(),
    })
}

fn make_cors_layer(config: &ServerConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    if config.cors_origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(origins)
}

pub fn make_app(state: ServerState) -> Router {
    let cors = make_cors_layer(&state.config);

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .nest("/api/download", download_routes())
        .nest("/api/history", history_routes())
        .nest("/api/spotify", metadata_routes())
        .merge(settings_routes())
        .layer(middleware::from_fn_with_state(state.clone(), log_requests))
        .layer(cors)
        .with_state(state)
}

fn make_metrics_app() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serves the API until `shutdown` resolves, plus the metrics endpoint on
/// its own port.
pub async fn run_server(
    state: ServerState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let address = format!("{}:{}", state.config.host, state.config.port);
    let metrics_address = format!("{}:{}", state.config.host, state.config.metrics_port);

    let metrics_listener = tokio::net::TcpListener::bind(&metrics_address)
        .await
        .with_context(|| format!("Failed to bind metrics server to {}", metrics_address))?;
    let metrics_server = tokio::spawn(async move {
        if let Err(e) = axum::serve(metrics_listener, make_metrics_app()).await {
            warn!("Metrics server stopped: {}", e);
        }
    });

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind server to {}", address))?;
    info!("Ready to serve at {}", address);
    info!("Metrics available at {}/metrics", metrics_address);

    let result = axum::serve(listener, make_app(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error");

    metrics_server.abort();
    result
}
