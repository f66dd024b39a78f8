//! Download manager facade.
//!
//! Owns the queue, the broadcaster and the worker pool, and exposes the
//! operations the transport layers call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{RuntimeSettings, SettingsUpdate, SharedSettings};
use crate::metadata::{ReferenceKind, SourceReference};

use super::broadcaster::{ProgressBroadcaster, Subscription};
use super::collaborators::{
    BackendFetcher, HistoryRecorder, MediaWriter, MetadataResolver, ResolveError,
};
use super::models::*;
use super::queue_store::{CancelOutcome, QueueError, QueueStore};
use super::service_selector::ServiceHealth;
use super::worker_pool::{WorkerDeps, WorkerPool};

/// Collaborators and sizing used to build a `DownloadManager`.
pub struct DownloadManagerParts {
    pub resolver: Arc<dyn MetadataResolver>,
    pub fetchers: HashMap<ServiceName, Arc<dyn BackendFetcher>>,
    pub writer: Arc<dyn MediaWriter>,
    pub history: Arc<dyn HistoryRecorder>,
    pub settings: SharedSettings,
    pub worker_count: usize,
    pub event_buffer_capacity: usize,
    pub unavailable_cooldown: std::time::Duration,
}

/// Engine diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadManagerStatus {
    pub running: bool,
    pub accepting: bool,
    pub worker_count: usize,
    pub counts: QueueCounts,
    pub subscribers: usize,
    pub subscriber_capacity: usize,
    pub events_published: u64,
    pub events_dropped: u64,
    pub unavailable_services: Vec<ServiceName>,
}

/// Result of enqueueing every track of a collection.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionOutcome {
    pub source_reference: String,
    pub items: Vec<EnqueueOutcome>,
}

/// Resolved metadata for a reference, without queueing anything.
#[derive(Debug, Clone, Serialize)]
pub struct MetadataPreview {
    pub source_reference: String,
    pub kind: ReferenceKind,
    pub tracks: Vec<TrackDescriptor>,
}

/// Errors of the admission operations.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error(transparent)]
    InvalidReference(#[from] crate::metadata::SourceReferenceError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("Metadata resolution timed out")]
    Timeout,
}

pub struct DownloadManager {
    store: Arc<QueueStore>,
    broadcaster: Arc<ProgressBroadcaster>,
    health: Arc<ServiceHealth>,
    settings: SharedSettings,
    worker_count: usize,
    deps: WorkerDeps,
    pool: Mutex<Option<WorkerPool>>,
}

impl DownloadManager {
    pub fn new(parts: DownloadManagerParts) -> Self {
        let broadcaster = Arc::new(ProgressBroadcaster::new(parts.event_buffer_capacity));
        let store = Arc::new(QueueStore::new(broadcaster.clone()));
        let health = Arc::new(ServiceHealth::new(parts.unavailable_cooldown));
        let deps = WorkerDeps {
            store: store.clone(),
            resolver: parts.resolver,
            fetchers: parts.fetchers,
            writer: parts.writer,
            history: parts.history,
            health: health.clone(),
            settings: parts.settings.clone(),
        };

        Self {
            store,
            broadcaster,
            health,
            settings: parts.settings,
            worker_count: parts.worker_count.max(1),
            deps,
            pool: Mutex::new(None),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawns the worker pool. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut pool = self.pool.lock().unwrap();
        if pool.is_none() {
            *pool = Some(WorkerPool::spawn(self.worker_count, self.deps.clone()));
        }
    }

    pub fn is_running(&self) -> bool {
        self.pool.lock().unwrap().is_some()
    }

    /// Stops admissions and the worker pool.
    pub async fn shutdown(&self) {
        self.store.close();
        let pool = self.pool.lock().unwrap().take();
        if let Some(pool) = pool {
            pool.shutdown().await;
        }
        info!("Download manager stopped");
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Enqueues a single track reference in any accepted spelling.
    pub fn enqueue(&self, reference: &str) -> Result<EnqueueOutcome, EnqueueError> {
        let reference = SourceReference::parse(reference)?;
        if reference.is_collection() {
            return Err(ResolveError::Other(format!(
                "{} is a {}, not a track",
                reference.canonical(),
                reference.kind()
            ))
            .into());
        }
        Ok(self.store.enqueue(&reference.canonical())?)
    }

    /// Expands an album or playlist and enqueues each of its tracks.
    pub async fn enqueue_collection(
        &self,
        reference: &str,
    ) -> Result<CollectionOutcome, EnqueueError> {
        let reference = SourceReference::parse(reference)?;
        let canonical = reference.canonical();
        if self.store.is_closed() {
            return Err(QueueError::Closed.into());
        }

        let track_refs = if reference.is_collection() {
            let timeout = self.settings.read().unwrap().resolve_timeout;
            tokio::time::timeout(timeout, self.deps.resolver.expand(&canonical))
                .await
                .map_err(|_| EnqueueError::Timeout)??
        } else {
            vec![canonical.clone()]
        };

        let mut items = Vec::with_capacity(track_refs.len());
        for track_ref in track_refs {
            items.push(self.store.enqueue(&track_ref)?);
        }
        info!(
            "Enqueued {} track(s) from {}",
            items.iter().filter(|i| i.created).count(),
            canonical
        );
        Ok(CollectionOutcome {
            source_reference: canonical,
            items,
        })
    }

    /// Resolves a track, album or playlist for display. Collections are
    /// expanded and each track resolved in order.
    pub async fn preview(&self, reference: &str) -> Result<MetadataPreview, EnqueueError> {
        let reference = SourceReference::parse(reference)?;
        let canonical = reference.canonical();
        let timeout = self.settings.read().unwrap().resolve_timeout;
        let resolver = &self.deps.resolver;

        let track_refs = if reference.is_collection() {
            tokio::time::timeout(timeout, resolver.expand(&canonical))
                .await
                .map_err(|_| EnqueueError::Timeout)??
        } else {
            vec![canonical.clone()]
        };

        let mut tracks = Vec::with_capacity(track_refs.len());
        for track_ref in &track_refs {
            let descriptor = tokio::time::timeout(timeout, resolver.resolve(track_ref))
                .await
                .map_err(|_| EnqueueError::Timeout)??;
            tracks.push(descriptor);
        }

        Ok(MetadataPreview {
            source_reference: canonical,
            kind: reference.kind(),
            tracks,
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_queue(&self) -> QueueSnapshot {
        self.store.snapshot()
    }

    pub fn get_item(&self, item_id: &str) -> Option<QueueItem> {
        self.store.get(item_id)
    }

    pub fn get_progress(&self, item_id: Option<&str>) -> Result<ProgressView, QueueError> {
        self.store.progress(item_id)
    }

    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    pub fn status(&self) -> DownloadManagerStatus {
        let mut unavailable_services: Vec<ServiceName> =
            self.health.unavailable().into_iter().collect();
        unavailable_services.sort();
        DownloadManagerStatus {
            running: self.is_running(),
            accepting: !self.store.is_closed(),
            worker_count: self.worker_count,
            counts: self.store.counts(),
            subscribers: self.broadcaster.subscriber_count(),
            subscriber_capacity: self.broadcaster.capacity(),
            events_published: self.broadcaster.published_count(),
            events_dropped: self.broadcaster.dropped_count(),
            unavailable_services,
        }
    }

    // =========================================================================
    // Cancellation and clearing
    // =========================================================================

    pub fn cancel_item(&self, item_id: &str) -> Result<CancelOutcome, QueueError> {
        self.store.cancel(item_id)
    }

    pub fn cancel_all_pending(&self) -> usize {
        self.store.cancel_all_pending()
    }

    pub fn clear_completed(&self) -> usize {
        self.store.clear_completed()
    }

    pub fn clear_all(&self) -> Result<usize, QueueError> {
        self.store.clear_all()
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub fn settings(&self) -> RuntimeSettings {
        self.settings.read().unwrap().clone()
    }

    /// Validates and applies a partial update. Items already claimed keep
    /// the settings they started with.
    pub fn update_settings(&self, update: &SettingsUpdate) -> Result<RuntimeSettings> {
        let mut settings = self.settings.write().unwrap();
        if let Err(e) = settings.apply(update) {
            warn!("Rejected settings update: {}", e);
            bail!(e);
        }
        info!(
            "Settings updated: default_service={}, allow_fallback={}",
            settings.default_service, settings.allow_fallback
        );
        Ok(settings.clone())
    }
}
