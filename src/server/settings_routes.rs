//! Runtime settings HTTP routes.

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

use super::download_routes::ErrorResponse;
use crate::config::{
    default_download_path, FileConfig, RuntimeSettings, SettingsUpdate, SettingsView,
};
use crate::server::state::ServerState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultsResponse {
    pub download_path: String,
}

/// Writes the runtime-editable values back into the config file.
fn persist_settings(path: &Path, settings: &RuntimeSettings) -> Result<()> {
    let mut file = if path.exists() {
        FileConfig::load(path)?
    } else {
        FileConfig::default()
    };
    settings.write_into(&mut file);
    file.save(path)
}

/// GET /settings
async fn get_settings(State(state): State<ServerState>) -> impl IntoResponse {
    Json(SettingsView::from(&state.download_manager.settings()))
}

/// POST /settings - Partial update, validated as a whole
async fn update_settings(
    State(state): State<ServerState>,
    Json(update): Json<SettingsUpdate>,
) -> Response {
    let settings = match state.download_manager.update_settings(&update) {
        Ok(s) => s,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new("invalid_settings", e.to_string())),
            )
                .into_response()
        }
    };

    if let Some(path) = &state.config_path {
        match persist_settings(path, &settings) {
            Ok(()) => info!("Saved settings to {:?}", path),
            Err(e) => warn!("Failed to save settings to {:?}: {:#}", path, e),
        }
    }

    Json(SettingsView::from(&settings)).into_response()
}

/// GET /defaults
async fn get_defaults() -> impl IntoResponse {
    Json(DefaultsResponse {
        download_path: default_download_path().to_string_lossy().to_string(),
    })
}

/// Build the settings routes:
/// - GET /api/settings
/// - POST /api/settings
/// - GET /api/defaults
pub fn settings_routes() -> Router<ServerState> {
    Router::new()
        .route("/api/settings", get(get_settings).post(update_settings))
        .route("/api/defaults", get(get_defaults))
}
