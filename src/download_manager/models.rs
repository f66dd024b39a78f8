//! Data models for the download engine.
//!
//! Defines queue items, states, service attempts, snapshots and the events
//! pushed to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Lifecycle state of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    Resolving,
    Fetching,
    Completed, // terminal
    Failed,    // terminal
    Cancelled, // terminal
}

impl ItemState {
    /// Returns true if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemState::Completed | ItemState::Failed | ItemState::Cancelled
        )
    }

    /// Returns true while a worker owns the item.
    pub fn is_active(&self) -> bool {
        matches!(self, ItemState::Resolving | ItemState::Fetching)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Pending => "pending",
            ItemState::Resolving => "resolving",
            ItemState::Fetching => "fetching",
            ItemState::Completed => "completed",
            ItemState::Failed => "failed",
            ItemState::Cancelled => "cancelled",
        }
    }

    pub const ALL: [ItemState; 6] = [
        ItemState::Pending,
        ItemState::Resolving,
        ItemState::Fetching,
        ItemState::Completed,
        ItemState::Failed,
        ItemState::Cancelled,
    ];
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend streaming services audio can be fetched from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ServiceName {
    Tidal,
    Qobuz,
    Amazon,
}

impl ServiceName {
    /// Static priority order used when no explicit fallback order is configured.
    pub const ALL: [ServiceName; 3] = [ServiceName::Tidal, ServiceName::Qobuz, ServiceName::Amazon];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceName::Tidal => "tidal",
            ServiceName::Qobuz => "qobuz",
            ServiceName::Amazon => "amazon",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tidal" => Some(ServiceName::Tidal),
            "qobuz" => Some(ServiceName::Qobuz),
            "amazon" => Some(ServiceName::Amazon),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of trying one backend service for an item.
///
/// Serialized as `"success"`, `"unavailable"` or `"error:<reason>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Unavailable,
    Error(String),
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success)
    }

    /// Short label without the error reason, used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Unavailable => "unavailable",
            AttemptOutcome::Error(_) => "error",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Success => f.write_str("success"),
            AttemptOutcome::Unavailable => f.write_str("unavailable"),
            AttemptOutcome::Error(reason) => write!(f, "error:{}", reason),
        }
    }
}

impl Serialize for AttemptOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AttemptOutcome {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.as_str() {
            "success" => Ok(AttemptOutcome::Success),
            "unavailable" => Ok(AttemptOutcome::Unavailable),
            other => match other.strip_prefix("error:") {
                Some(reason) => Ok(AttemptOutcome::Error(reason.to_string())),
                None => Err(serde::de::Error::custom(format!(
                    "unknown attempt outcome: {}",
                    other
                ))),
            },
        }
    }
}

/// One entry of an item's fallback audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceAttempt {
    pub service: ServiceName,
    pub started_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
}

/// Canonical track metadata produced by the metadata resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    /// Catalog-side track id.
    pub catalog_id: String,
    pub title: String,
    pub artists: Vec<String>,
    pub album: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub track_number: Option<u32>,
    #[serde(default)]
    pub isrc: Option<String>,
    /// Canonical ids on the backend services that are known to carry the track.
    #[serde(default)]
    pub service_ids: HashMap<ServiceName, String>,
}

impl TrackDescriptor {
    /// Artists joined for display, e.g. "A, B".
    pub fn artists_display(&self) -> String {
        self.artists.join(", ")
    }
}

/// One requested download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Opaque id assigned at admission.
    pub id: String,
    /// What the caller asked for, in canonical form.
    pub source_reference: String,
    /// Set once resolution succeeds, never changed afterwards.
    pub descriptor: Option<TrackDescriptor>,
    pub state: ItemState,
    pub attempted_services: Vec<ServiceAttempt>,
    pub progress_fraction: f64,
    pub result_path: Option<PathBuf>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn new(id: String, source_reference: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            source_reference,
            descriptor: None,
            state: ItemState::Pending,
            attempted_services: Vec::new(),
            progress_fraction: 0.0,
            result_path: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The service whose attempt succeeded, if any.
    pub fn service_used(&self) -> Option<ServiceName> {
        self.attempted_services
            .iter()
            .find(|a| a.outcome.is_success())
            .map(|a| a.service)
    }
}

/// Number of items per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub total: usize,
    pub pending: usize,
    pub resolving: usize,
    pub fetching: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueCounts {
    pub fn add(&mut self, state: ItemState) {
        self.total += 1;
        match state {
            ItemState::Pending => self.pending += 1,
            ItemState::Resolving => self.resolving += 1,
            ItemState::Fetching => self.fetching += 1,
            ItemState::Completed => self.completed += 1,
            ItemState::Failed => self.failed += 1,
            ItemState::Cancelled => self.cancelled += 1,
        }
    }

    pub fn get(&self, state: ItemState) -> usize {
        match state {
            ItemState::Pending => self.pending,
            ItemState::Resolving => self.resolving,
            ItemState::Fetching => self.fetching,
            ItemState::Completed => self.completed,
            ItemState::Failed => self.failed,
            ItemState::Cancelled => self.cancelled,
        }
    }

    /// Items currently owned by a worker.
    pub fn active(&self) -> usize {
        self.resolving + self.fetching
    }
}

/// Point-in-time copy of the queue. Pending items keep admission order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub items: Vec<QueueItem>,
    pub counts: QueueCounts,
}

impl QueueSnapshot {
    pub fn get(&self, item_id: &str) -> Option<&QueueItem> {
        self.items.iter().find(|i| i.id == item_id)
    }
}

/// Event pushed to subscribers on every queue mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// An item changed state or progress.
    Item {
        item_id: String,
        state: ItemState,
        progress_fraction: f64,
        timestamp: DateTime<Utc>,
    },
    /// Items were admitted or removed.
    QueueChanged {
        summary: QueueCounts,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    pub fn item_id(&self) -> Option<&str> {
        match self {
            ProgressEvent::Item { item_id, .. } => Some(item_id),
            ProgressEvent::QueueChanged { .. } => None,
        }
    }
}

/// Progress of a single item as exposed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemProgress {
    pub item_id: String,
    pub state: ItemState,
    pub progress_fraction: f64,
    pub title: Option<String>,
    pub artists: Option<String>,
}

impl From<&QueueItem> for ItemProgress {
    fn from(item: &QueueItem) -> Self {
        Self {
            item_id: item.id.clone(),
            state: item.state,
            progress_fraction: item.progress_fraction,
            title: item.descriptor.as_ref().map(|d| d.title.clone()),
            artists: item.descriptor.as_ref().map(|d| d.artists_display()),
        }
    }
}

/// Answer to a progress query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressView {
    pub is_downloading: bool,
    pub item: Option<ItemProgress>,
}

/// Result of an admission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    pub item_id: String,
    /// False when an identical non-terminal request was already queued.
    pub created: bool,
}
