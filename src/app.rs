//! Wiring of the engine with its production collaborators.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::backends::http_fetchers;
use crate::config::{AppConfig, SharedSettings};
use crate::download_manager::{DownloadManager, DownloadManagerParts, HistoryRecorder};
use crate::history::SqliteHistoryStore;
use crate::media_files::FsMediaWriter;
use crate::metadata::HttpMetadataResolver;

/// Builds a download manager backed by the HTTP metadata resolver, the HTTP
/// backend fetchers and the filesystem writer. The pool is not started.
pub fn build_download_manager(
    config: &AppConfig,
    settings: SharedSettings,
    history: Arc<dyn HistoryRecorder>,
) -> Result<DownloadManager> {
    let metadata_api_url = config
        .metadata_api_url
        .as_deref()
        .context("services.metadata_api_url is not configured")?;
    let resolver = HttpMetadataResolver::new(metadata_api_url, config.runtime.resolve_timeout)
        .context("Failed to create metadata client")?;
    info!("Metadata service at {}", resolver.base_url());

    Ok(DownloadManager::new(DownloadManagerParts {
        resolver: Arc::new(resolver),
        fetchers: http_fetchers().context("Failed to create backend clients")?,
        writer: Arc::new(FsMediaWriter::new(settings.clone())),
        history,
        settings,
        worker_count: config.worker_count,
        event_buffer_capacity: config.event_buffer_capacity,
        unavailable_cooldown: config.unavailable_cooldown,
    }))
}

/// Opens the history database named by the config.
pub fn open_history(config: &AppConfig) -> Result<Arc<SqliteHistoryStore>> {
    info!("Opening history database at {:?}", config.history_db_path);
    let store = SqliteHistoryStore::open(&config.history_db_path)
        .with_context(|| format!("Failed to open history at {:?}", config.history_db_path))?;
    Ok(Arc::new(store))
}
