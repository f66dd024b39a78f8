//! Catalog metadata preview routes.

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use tracing::debug;

use super::download_routes::enqueue_error_response;
use crate::server::state::{GuardedDownloadManager, ServerState};

#[derive(Debug, Deserialize)]
pub struct MetadataRequestBody {
    pub url: String,
}

/// POST /metadata - Resolve a track, album or playlist without queueing it
async fn get_metadata(
    State(manager): State<GuardedDownloadManager>,
    Json(body): Json<MetadataRequestBody>,
) -> Response {
    debug!("Metadata preview requested: {}", body.url);

    match manager.preview(&body.url).await {
        Ok(preview) => Json(preview).into_response(),
        Err(e) => enqueue_error_response(&e, "/api/spotify/metadata"),
    }
}

pub fn metadata_routes() -> Router<ServerState> {
    Router::new().route("/metadata", post(get_metadata))
}
