//! Download Manager module
//!
//! Provides the in-process download queue: a FIFO of requested tracks,
//! a pool of workers that resolve and fetch them with service fallback,
//! and a broadcaster that streams progress to any number of observers.

mod broadcaster;
mod collaborators;
mod manager;
mod models;
mod queue_store;
mod service_selector;
mod worker_pool;

pub use broadcaster::{ProgressBroadcaster, Subscription, DEFAULT_SUBSCRIBER_CAPACITY};
pub use collaborators::{
    AudioStream, BackendFetcher, FetchError, HistoryRecord, HistoryRecorder, HistoryStatus,
    MediaWriter, MetadataResolver, NoOpHistoryRecorder, ProgressCallback, ResolveError,
    ServiceCredentials,
};
#[cfg(any(test, feature = "mock"))]
pub use collaborators::{MockHistoryRecorder, MockMetadataResolver};
pub use manager::{
    CollectionOutcome, DownloadManager, DownloadManagerParts, DownloadManagerStatus, EnqueueError,
    MetadataPreview,
};
pub use models::*;
pub use queue_store::{CancelOutcome, Claim, ClaimToken, QueueError, QueueStore};
pub use service_selector::{select_order, SelectorConfig, ServiceHealth};
pub use worker_pool::{WorkerDeps, WorkerPool};
