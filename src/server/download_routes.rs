//! Download queue HTTP routes.
//!
//! Provides endpoints for:
//! - Enqueueing tracks and collections
//! - Queue snapshots, progress and engine status
//! - Cancelling and clearing queue items

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::download_manager::{EnqueueError, QueueError, ResolveError};
use crate::server::metrics::record_error;
use crate::server::state::{GuardedDownloadManager, ServerState};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct DownloadRequestBody {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct ProgressQuery {
    pub item_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TrackDownloadResponse {
    pub success: bool,
    pub message: String,
    pub item_id: String,
    pub already_queued: bool,
}

#[derive(Debug, Serialize)]
pub struct CollectionDownloadResponse {
    pub success: bool,
    pub source_reference: String,
    pub item_ids: Vec<String>,
    pub created: usize,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub success: bool,
    /// "cancelled", "requested" or "already_terminal".
    pub outcome: String,
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub success: bool,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}

// =============================================================================
// Error mapping
// =============================================================================

pub(super) fn queue_error_response(e: &QueueError) -> Response {
    let status = match e {
        QueueError::NotFound(_) => StatusCode::NOT_FOUND,
        QueueError::Busy { .. } => StatusCode::CONFLICT,
        QueueError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        QueueError::StaleClaim(_) | QueueError::InvalidTransition { .. } => StatusCode::CONFLICT,
    };
    (status, Json(ErrorResponse::new(e.code(), e.to_string()))).into_response()
}

pub(super) fn enqueue_error_response(e: &EnqueueError, endpoint: &str) -> Response {
    record_error(enqueue_error_code(e), endpoint);
    match e {
        EnqueueError::Queue(queue_error) => queue_error_response(queue_error),
        EnqueueError::InvalidReference(_) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("invalid_reference", e.to_string())),
        )
            .into_response(),
        EnqueueError::Resolve(ResolveError::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("not_found", e.to_string())),
        )
            .into_response(),
        EnqueueError::Resolve(ResolveError::RateLimited) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ErrorResponse::new("rate_limited", e.to_string())),
        )
            .into_response(),
        EnqueueError::Resolve(ResolveError::Other(_)) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("resolve_failed", e.to_string())),
        )
            .into_response(),
        EnqueueError::Timeout => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(ErrorResponse::new("timeout", e.to_string())),
        )
            .into_response(),
    }
}

fn enqueue_error_code(e: &EnqueueError) -> &'static str {
    match e {
        EnqueueError::InvalidReference(_) => "invalid_reference",
        EnqueueError::Queue(q) => q.code(),
        EnqueueError::Resolve(_) => "resolve_failed",
        EnqueueError::Timeout => "timeout",
    }
}

// =============================================================================
// Admission
// =============================================================================

/// POST /track - Enqueue a single track
async fn download_track(
    State(manager): State<GuardedDownloadManager>,
    Json(body): Json<DownloadRequestBody>,
) -> Response {
    debug!("Track download requested: {}", body.url);

    match manager.enqueue(&body.url) {
        Ok(outcome) => {
            let message = if outcome.created {
                "Track queued for download"
            } else {
                "Track already queued"
            };
            Json(TrackDownloadResponse {
                success: true,
                message: message.to_string(),
                item_id: outcome.item_id,
                already_queued: !outcome.created,
            })
            .into_response()
        }
        Err(e) => {
            debug!("Track request rejected: {}", e);
            enqueue_error_response(&e, "/api/download/track")
        }
    }
}

/// POST /collection - Enqueue every track of an album or playlist
async fn download_collection(
    State(manager): State<GuardedDownloadManager>,
    Json(body): Json<DownloadRequestBody>,
) -> Response {
    debug!("Collection download requested: {}", body.url);

    match manager.enqueue_collection(&body.url).await {
        Ok(outcome) => Json(CollectionDownloadResponse {
            success: true,
            created: outcome.items.iter().filter(|i| i.created).count(),
            item_ids: outcome.items.into_iter().map(|i| i.item_id).collect(),
            source_reference: outcome.source_reference,
        })
        .into_response(),
        Err(e) => {
            warn!("Collection request failed: {}", e);
            enqueue_error_response(&e, "/api/download/collection")
        }
    }
}

// =============================================================================
// Queries
// =============================================================================

/// GET /queue - Snapshot of every item in the queue
async fn get_queue(State(manager): State<GuardedDownloadManager>) -> impl IntoResponse {
    Json(manager.get_queue())
}

/// GET /progress - Progress of one item, or of the item currently downloading
async fn get_progress(
    State(manager): State<GuardedDownloadManager>,
    Query(query): Query<ProgressQuery>,
) -> Response {
    match manager.get_progress(query.item_id.as_deref()) {
        Ok(view) => Json(view).into_response(),
        Err(e) => queue_error_response(&e),
    }
}

/// GET /status - Engine diagnostics
async fn get_status(State(manager): State<GuardedDownloadManager>) -> impl IntoResponse {
    Json(manager.status())
}

// =============================================================================
// Cancellation and clearing
// =============================================================================

/// POST /queue/{id}/cancel
async fn cancel_item(
    State(manager): State<GuardedDownloadManager>,
    Path(id): Path<String>,
) -> Response {
    match manager.cancel_item(&id) {
        Ok(outcome) => Json(CancelResponse {
            success: true,
            outcome: outcome.label().to_string(),
        })
        .into_response(),
        Err(e) => queue_error_response(&e),
    }
}

/// POST /queue/cancel-all - Cancel every pending item
async fn cancel_all_pending(State(manager): State<GuardedDownloadManager>) -> impl IntoResponse {
    let count = manager.cancel_all_pending();
    info!("Cancelled {} pending item(s)", count);
    Json(CountResponse {
        success: true,
        count,
    })
}

/// POST /queue/clear - Remove finished items
async fn clear_completed(State(manager): State<GuardedDownloadManager>) -> impl IntoResponse {
    Json(CountResponse {
        success: true,
        count: manager.clear_completed(),
    })
}

/// POST /queue/clear-all - Empty the queue, refused while work is active
async fn clear_all(State(manager): State<GuardedDownloadManager>) -> Response {
    match manager.clear_all() {
        Ok(count) => Json(CountResponse {
            success: true,
            count,
        })
        .into_response(),
        Err(e) => queue_error_response(&e),
    }
}

// =============================================================================
// Router Construction
// =============================================================================

/// Build the download routes, mounted under `/api/download`.
///
/// - POST /track
/// - POST /collection
/// - GET /queue
/// - GET /progress
/// - GET /status
/// - POST /queue/{id}/cancel
/// - POST /queue/cancel-all
/// - POST /queue/clear
/// - POST /queue/clear-all
pub fn download_routes() -> Router<ServerState> {
    Router::new()
        .route("/track", post(download_track))
        .route("/collection", post(download_collection))
        .route("/queue", get(get_queue))
        .route("/progress", get(get_progress))
        .route("/status", get(get_status))
        .route("/queue/cancel-all", post(cancel_all_pending))
        .route("/queue/clear", post(clear_completed))
        .route("/queue/clear-all", post(clear_all))
        .route("/queue/{id}/cancel", post(cancel_item))
}
