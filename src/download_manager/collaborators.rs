//! Interfaces of the components the engine drives but does not implement:
//! metadata resolution, backend fetching, media file writing and history.

use super::models::{ServiceAttempt, ServiceName, TrackDescriptor};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors a metadata resolver can report.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Track not found")]
    NotFound,

    #[error("Rate limited by metadata service")]
    RateLimited,

    #[error("Metadata resolution failed: {0}")]
    Other(String),
}

/// Errors a backend fetcher can report for one attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The service itself is down, throttling or unconfigured. Feeds service health.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// The service is up but does not carry this track.
    #[error("Track not carried: {0}")]
    NotCarried(String),

    #[error("{0}")]
    Other(String),
}

/// Resolves catalog references into track descriptors.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    /// Resolves a single track reference.
    async fn resolve(&self, source_reference: &str) -> Result<TrackDescriptor, ResolveError>;

    /// Lists the track references of an album or playlist.
    async fn expand(&self, source_reference: &str) -> Result<Vec<String>, ResolveError>;
}

/// Per-service access data handed to a fetcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceCredentials {
    pub api_url: Option<String>,
    pub token: Option<String>,
    /// Requested audio quality, e.g. "LOSSLESS" or a numeric tier.
    pub audio_format: String,
}

/// Called by fetchers with the fraction of the audio delivered so far.
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Audio bytes as they arrive from a backend.
pub type AudioStream = BoxStream<'static, std::io::Result<Vec<u8>>>;

/// Fetches audio from one backend service.
#[async_trait]
pub trait BackendFetcher: Send + Sync {
    fn service(&self) -> ServiceName;

    /// Opens the audio for `descriptor`. The returned stream reports its
    /// progress through `progress` as it is consumed.
    async fn fetch(
        &self,
        descriptor: &TrackDescriptor,
        credentials: &ServiceCredentials,
        progress: ProgressCallback,
    ) -> Result<AudioStream, FetchError>;
}

/// Places fetched audio on disk.
#[async_trait]
pub trait MediaWriter: Send + Sync {
    /// Final location for a track.
    fn final_path(&self, descriptor: &TrackDescriptor) -> PathBuf;

    /// Per-item scratch location the audio is streamed into.
    fn temp_path(&self, item_id: &str, descriptor: &TrackDescriptor) -> PathBuf;

    /// Drains `stream` into `path`, returning the number of bytes written.
    async fn write(&self, stream: AudioStream, path: &Path) -> Result<u64>;

    /// Moves a fully written temp file to its final location.
    async fn finalize(&self, temp: &Path, destination: &Path) -> Result<()>;

    /// Best-effort removal of a partial file.
    async fn discard(&self, path: &Path);
}

/// Final status stored in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Completed,
    Failed,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Completed => "completed",
            HistoryStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(HistoryStatus::Completed),
            "failed" => Some(HistoryStatus::Failed),
            _ => None,
        }
    }
}

/// What gets persisted for a finished item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub item_id: String,
    pub source_reference: String,
    pub descriptor: Option<TrackDescriptor>,
    pub status: HistoryStatus,
    pub service_used: Option<ServiceName>,
    pub result_path: Option<PathBuf>,
    pub error_message: Option<String>,
    pub attempts: Vec<ServiceAttempt>,
    pub finished_at: DateTime<Utc>,
}

/// Durable log of finished downloads. Called off the worker's hot path.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait HistoryRecorder: Send + Sync {
    fn record(&self, record: &HistoryRecord) -> Result<()>;
}

/// Recorder used when history is disabled.
pub struct NoOpHistoryRecorder;

impl HistoryRecorder for NoOpHistoryRecorder {
    fn record(&self, _record: &HistoryRecord) -> Result<()> {
        Ok(())
    }
}
