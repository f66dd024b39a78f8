//! Download history HTTP routes.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::download_routes::ErrorResponse;
use crate::history::{HistoryEntry, SqliteHistoryStore, DEFAULT_HISTORY_LIMIT};
use crate::server::state::{OptionalHistoryStore, ServerState};

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub entries: Vec<HistoryEntry>,
}

#[derive(Debug, Serialize)]
pub struct HistoryMutationResponse {
    pub success: bool,
    pub count: usize,
}

fn get_history_store(
    store: &OptionalHistoryStore,
) -> Result<&Arc<SqliteHistoryStore>, Response> {
    store.as_ref().ok_or_else(|| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::new(
                "history_disabled",
                "Download history is not enabled",
            )),
        )
            .into_response()
    })
}

fn internal_error(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new("internal", message)),
    )
        .into_response()
}

/// GET /downloads - Most recent history entries
async fn list_downloads(
    State(store): State<OptionalHistoryStore>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let store = match get_history_store(&store) {
        Ok(s) => s,
        Err(e) => return e,
    };

    match store.list(query.limit) {
        Ok(entries) => Json(HistoryResponse { entries }).into_response(),
        Err(e) => {
            warn!("Failed to list history: {}", e);
            internal_error("Failed to list history")
        }
    }
}

/// POST /downloads/clear - Remove every history entry
async fn clear_downloads(State(store): State<OptionalHistoryStore>) -> Response {
    let store = match get_history_store(&store) {
        Ok(s) => s,
        Err(e) => return e,
    };

    match store.clear() {
        Ok(count) => Json(HistoryMutationResponse {
            success: true,
            count,
        })
        .into_response(),
        Err(e) => {
            warn!("Failed to clear history: {}", e);
            internal_error("Failed to clear history")
        }
    }
}

/// DELETE /downloads/{id} - Remove one history entry
async fn delete_download(
    State(store): State<OptionalHistoryStore>,
    Path(id): Path<i64>,
) -> Response {
    let store = match get_history_store(&store) {
        Ok(s) => s,
        Err(e) => return e,
    };

    match store.delete(id) {
        Ok(true) => {
            info!("Deleted history entry {}", id);
            Json(HistoryMutationResponse {
                success: true,
                count: 1,
            })
            .into_response()
        }
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "not_found",
                format!("History entry not found: {}", id),
            )),
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to delete history entry {}: {}", id, e);
            internal_error("Failed to delete history entry")
        }
    }
}

/// Build the history routes, mounted under `/api/history`.
pub fn history_routes() -> Router<ServerState> {
    Router::new()
        .route("/downloads", get(list_downloads))
        .route("/downloads/clear", post(clear_downloads))
        .route("/downloads/{id}", delete(delete_download))
}
