//! Fixed-size pool of download workers.
//!
//! Each worker blocks on the queue until an item can be claimed, then drives
//! it through resolution, service selection and fetch attempts. Cancellation
//! is cooperative: the claim token is checked before resolution, before each
//! service attempt and after each network step.

use super::collaborators::{
    BackendFetcher, FetchError, HistoryRecord, HistoryRecorder, HistoryStatus, MediaWriter,
    MetadataResolver, ProgressCallback, ResolveError,
};
use super::models::{AttemptOutcome, ItemState, QueueItem, ServiceAttempt, ServiceName, TrackDescriptor};
use super::queue_store::{Claim, ClaimToken, QueueError, QueueStore};
use super::service_selector::{select_order, ServiceHealth};
use crate::config::{RuntimeSettings, SharedSettings};
use crate::server::metrics;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything a worker needs to process items.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<QueueStore>,
    pub resolver: Arc<dyn MetadataResolver>,
    pub fetchers: HashMap<ServiceName, Arc<dyn BackendFetcher>>,
    pub writer: Arc<dyn MediaWriter>,
    pub history: Arc<dyn HistoryRecorder>,
    pub health: Arc<ServiceHealth>,
    pub settings: SharedSettings,
}

pub struct WorkerPool {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `size` workers. A size of zero is raised to one.
    pub fn spawn(size: usize, deps: WorkerDeps) -> Self {
        let size = size.max(1);
        let shutdown = CancellationToken::new();
        let handles = (0..size)
            .map(|index| {
                let worker = Worker {
                    index,
                    deps: deps.clone(),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        info!("Started {} download worker(s)", size);
        Self { shutdown, handles }
    }

    /// Token observed by every worker; cancelling it stops the pool.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops all workers. Items in flight are cancelled at their next checkpoint.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Download worker panicked: {}", e);
            }
        }
        info!("Download workers stopped");
    }
}

enum ItemOutcome {
    Completed(PathBuf),
    Failed(String),
    Cancelled,
    /// The claim was invalidated underneath the worker.
    Abandoned(QueueError),
}

struct Worker {
    index: usize,
    deps: WorkerDeps,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!("[worker {}] started", self.index);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                claim = self.deps.store.wait_for_claim() => self.process(claim).await,
            }
        }
        debug!("[worker {}] stopped", self.index);
    }

    fn should_stop(&self, token: &ClaimToken) -> bool {
        self.shutdown.is_cancelled() || self.deps.store.is_cancel_requested(token)
    }

    async fn process(&self, claim: Claim) {
        let Claim { item, token } = claim;
        info!(
            "[worker {}] Processing {} ({})",
            self.index, item.id, item.source_reference
        );

        let outcome = self.drive(&item, &token).await;
        let store = &self.deps.store;
        match outcome {
            ItemOutcome::Completed(path) => match store.complete(&token, path.clone()) {
                Ok(finished) if finished.state == ItemState::Completed => {
                    info!("[worker {}] Completed {} -> {:?}", self.index, item.id, path);
                    metrics::record_download_finished(ItemState::Completed.as_str());
                    self.record_history(finished, HistoryStatus::Completed).await;
                }
                Ok(finished) if finished.state == ItemState::Cancelled => {
                    info!("[worker {}] Cancelled {} after fetch", self.index, item.id);
                    self.deps.writer.discard(&path).await;
                    metrics::record_download_finished(ItemState::Cancelled.as_str());
                }
                Ok(finished) => debug!("Item {} already {}", item.id, finished.state),
                Err(e) => warn!("Failed to complete {}: {}", item.id, e),
            },
            ItemOutcome::Failed(message) => match store.fail(&token, &message) {
                Ok(finished) if finished.state == ItemState::Failed => {
                    warn!("[worker {}] Failed {}: {}", self.index, item.id, message);
                    metrics::record_download_finished(ItemState::Failed.as_str());
                    self.record_history(finished, HistoryStatus::Failed).await;
                }
                Ok(finished) if finished.state == ItemState::Cancelled => {
                    metrics::record_download_finished(ItemState::Cancelled.as_str());
                }
                Ok(finished) => debug!("Item {} already {}", item.id, finished.state),
                Err(e) => warn!("Failed to mark {} as failed: {}", item.id, e),
            },
            ItemOutcome::Cancelled => match store.acknowledge_cancel(&token) {
                Ok(finished) => {
                    info!("[worker {}] Item {} {}", self.index, item.id, finished.state);
                    metrics::record_download_finished(finished.state.as_str());
                }
                Err(e) => warn!("Failed to acknowledge cancel of {}: {}", item.id, e),
            },
            ItemOutcome::Abandoned(e) => {
                warn!("[worker {}] Abandoned {}: {}", self.index, item.id, e);
            }
        }
    }

    async fn drive(&self, item: &QueueItem, token: &ClaimToken) -> ItemOutcome {
        if self.should_stop(token) {
            return ItemOutcome::Cancelled;
        }

        // Settings are read once per item so a concurrent update cannot change
        // the plan halfway through.
        let settings = self.deps.settings.read().unwrap().clone();

        let resolved = tokio::time::timeout(
            settings.resolve_timeout,
            self.deps.resolver.resolve(&item.source_reference),
        )
        .await;
        let descriptor = match resolved {
            Ok(Ok(descriptor)) => descriptor,
            Ok(Err(ResolveError::NotFound)) => {
                return ItemOutcome::Failed(format!("Track not found: {}", item.source_reference))
            }
            Ok(Err(e)) => return ItemOutcome::Failed(e.to_string()),
            Err(_) => {
                return ItemOutcome::Failed(format!(
                    "Metadata resolution timed out after {}s",
                    settings.resolve_timeout.as_secs()
                ))
            }
        };

        if self.should_stop(token) {
            return ItemOutcome::Cancelled;
        }
        if let Err(e) = self.deps.store.begin_fetching(token, descriptor.clone()) {
            return ItemOutcome::Abandoned(e);
        }

        let order = select_order(
            &settings.selector_config(),
            &descriptor,
            &self.deps.health.unavailable(),
        );
        debug!(
            "[worker {}] Service order for {}: {:?}",
            self.index, item.id, order
        );

        let mut last_error: Option<String> = None;
        for service in order {
            if self.should_stop(token) {
                return ItemOutcome::Cancelled;
            }

            let started_at = Utc::now();
            let result = self
                .attempt(service, &item.id, token, &descriptor, &settings)
                .await;

            let (outcome, finished) = match result {
                Ok(temp) => {
                    if self.should_stop(token) {
                        self.deps.writer.discard(&temp).await;
                        (AttemptOutcome::Success, Some(ItemOutcome::Cancelled))
                    } else {
                        let destination = self.deps.writer.final_path(&descriptor);
                        match self.deps.writer.finalize(&temp, &destination).await {
                            Ok(()) => (
                                AttemptOutcome::Success,
                                Some(ItemOutcome::Completed(destination)),
                            ),
                            Err(e) => {
                                self.deps.writer.discard(&temp).await;
                                let reason = format!("failed to move file into place: {}", e);
                                last_error = Some(reason.clone());
                                (AttemptOutcome::Error(reason), None)
                            }
                        }
                    }
                }
                Err(FetchError::Unavailable(reason)) => {
                    self.deps.health.mark_unavailable(service);
                    last_error = Some(format!("{}: {}", service, reason));
                    (AttemptOutcome::Unavailable, None)
                }
                Err(FetchError::NotCarried(reason)) => {
                    last_error = Some(format!("{}: {}", service, reason));
                    (AttemptOutcome::Unavailable, None)
                }
                Err(FetchError::Other(reason)) => {
                    last_error = Some(format!("{}: {}", service, reason));
                    (AttemptOutcome::Error(reason), None)
                }
            };

            if outcome.is_success() {
                self.deps.health.mark_available(service);
            }
            metrics::record_service_attempt(service.as_str(), outcome.label());
            debug!(
                "[worker {}] {} attempt on {}: {}",
                self.index, item.id, service, outcome
            );
            let attempt = ServiceAttempt {
                service,
                started_at,
                outcome,
            };
            if let Err(e) = self.deps.store.record_attempt(token, attempt) {
                return ItemOutcome::Abandoned(e);
            }

            if let Some(finished) = finished {
                return finished;
            }
        }

        ItemOutcome::Failed(format!(
            "All services failed, last error: {}",
            last_error.unwrap_or_else(|| "no service attempted".to_string())
        ))
    }

    /// One fetch-and-write attempt against a single service, bounded by the
    /// service's attempt timeout. Returns the temp file holding the audio.
    async fn attempt(
        &self,
        service: ServiceName,
        item_id: &str,
        token: &ClaimToken,
        descriptor: &TrackDescriptor,
        settings: &RuntimeSettings,
    ) -> Result<PathBuf, FetchError> {
        let fetcher = self
            .deps
            .fetchers
            .get(&service)
            .ok_or_else(|| FetchError::Unavailable("no fetcher configured".to_string()))?;
        let credentials = settings.credentials(service);
        let attempt_timeout = settings.attempt_timeout(service);
        let writer = &self.deps.writer;
        let temp = writer.temp_path(item_id, descriptor);

        let store = self.deps.store.clone();
        let progress_token = token.clone();
        let progress: ProgressCallback = Arc::new(move |fraction| {
            store.update_progress(&progress_token, fraction);
        });

        let transfer = async {
            let stream = fetcher.fetch(descriptor, &credentials, progress).await?;
            writer
                .write(stream, &temp)
                .await
                .map_err(|e| FetchError::Other(format!("write failed: {}", e)))
        };

        match tokio::time::timeout(attempt_timeout, transfer).await {
            Ok(Ok(bytes)) => {
                debug!("Fetched {} bytes for {} from {}", bytes, item_id, service);
                Ok(temp)
            }
            Ok(Err(e)) => {
                writer.discard(&temp).await;
                Err(e)
            }
            Err(_) => {
                writer.discard(&temp).await;
                Err(FetchError::Other(format!(
                    "timed out after {:?}",
                    attempt_timeout
                )))
            }
        }
    }

    /// Persists a finished item from the snapshot its terminal transition returned.
    async fn record_history(&self, item: QueueItem, status: HistoryStatus) {
        let item_id = item.id.clone();
        let record = HistoryRecord {
            service_used: item.service_used(),
            item_id: item.id,
            source_reference: item.source_reference,
            descriptor: item.descriptor,
            status,
            result_path: item.result_path,
            error_message: item.error_message,
            attempts: item.attempted_services,
            finished_at: Utc::now(),
        };

        let history = self.deps.history.clone();
        match tokio::task::spawn_blocking(move || history.record(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to record history for {}: {}", item_id, e),
            Err(e) => warn!("History task for {} panicked: {}", item_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download_manager::broadcaster::ProgressBroadcaster;
    use crate::download_manager::collaborators::{AudioStream, MockHistoryRecorder};
    use crate::download_manager::models::ProgressEvent;
    use crate::download_manager::queue_store::CancelOutcome;
    use anyhow::Result;
    use async_trait::async_trait;
    use futures::{stream, StreamExt};
    use std::path::Path;
    use std::sync::{Mutex, RwLock};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// References with this prefix wait for `gate` before resolving.
    const GATED_PREFIX: &str = "spotify:track:gated";

    struct FakeResolver {
        not_found: Vec<String>,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl MetadataResolver for FakeResolver {
        async fn resolve(&self, source_reference: &str) -> Result<TrackDescriptor, ResolveError> {
            if source_reference.starts_with(GATED_PREFIX) {
                self.gate.notified().await;
            }
            if self.not_found.iter().any(|r| r == source_reference) {
                return Err(ResolveError::NotFound);
            }
            Ok(TrackDescriptor {
                catalog_id: source_reference.to_string(),
                title: format!("Title {}", source_reference),
                artists: vec!["Artist".to_string()],
                album: "Album".to_string(),
                duration_ms: 1000,
                track_number: None,
                isrc: None,
                service_ids: HashMap::new(),
            })
        }

        async fn expand(&self, source_reference: &str) -> Result<Vec<String>, ResolveError> {
            Ok(vec![source_reference.to_string()])
        }
    }

    #[derive(Clone)]
    enum Behavior {
        Succeed,
        Unavailable,
        Error,
        /// Succeeds except for the listed references, which the service lacks.
        Lacks(Vec<String>),
        /// Sends half the audio, then never finishes.
        Stall,
        /// Sends half the audio, then waits for the release signal.
        Blocking(Arc<Notify>),
    }

    struct FakeFetcher {
        service: ServiceName,
        behavior: Behavior,
        calls: Arc<Mutex<Vec<(ServiceName, String)>>>,
    }

    #[async_trait]
    impl BackendFetcher for FakeFetcher {
        fn service(&self) -> ServiceName {
            self.service
        }

        async fn fetch(
            &self,
            descriptor: &TrackDescriptor,
            _credentials: &crate::download_manager::ServiceCredentials,
            progress: ProgressCallback,
        ) -> Result<AudioStream, FetchError> {
            self.calls
                .lock()
                .unwrap()
                .push((self.service, descriptor.catalog_id.clone()));
            match &self.behavior {
                Behavior::Succeed => {
                    progress(0.5);
                    progress(1.0);
                    Ok(stream::iter(vec![Ok(vec![1u8; 8])]).boxed())
                }
                Behavior::Unavailable => Err(FetchError::Unavailable("not in catalog".to_string())),
                Behavior::Error => Err(FetchError::Other("boom".to_string())),
                Behavior::Lacks(missing) => {
                    if missing.contains(&descriptor.catalog_id) {
                        return Err(FetchError::NotCarried("no such track".to_string()));
                    }
                    progress(1.0);
                    Ok(stream::iter(vec![Ok(vec![1u8; 8])]).boxed())
                }
                Behavior::Stall => {
                    progress(0.5);
                    let first = stream::iter(vec![Ok(vec![1u8; 4])]);
                    Ok(first.chain(stream::pending()).boxed())
                }
                Behavior::Blocking(release) => {
                    progress(0.5);
                    let release = release.clone();
                    let first = stream::iter(vec![Ok(vec![1u8; 4])]);
                    let rest = stream::once(async move {
                        release.notified().await;
                        Ok(vec![2u8; 4])
                    });
                    Ok(first.chain(rest).boxed())
                }
            }
        }
    }

    #[derive(Default)]
    struct MemoryWriter {
        files: Mutex<HashMap<PathBuf, Vec<u8>>>,
        discarded: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl MediaWriter for MemoryWriter {
        fn final_path(&self, descriptor: &TrackDescriptor) -> PathBuf {
            PathBuf::from(format!("/music/{}.flac", descriptor.title))
        }

        fn temp_path(&self, item_id: &str, descriptor: &TrackDescriptor) -> PathBuf {
            PathBuf::from(format!("/music/{}.flac.{}.part", descriptor.title, item_id))
        }

        async fn write(&self, mut stream: AudioStream, path: &Path) -> Result<u64> {
            let mut data = Vec::new();
            while let Some(chunk) = stream.next().await {
                data.extend(chunk?);
            }
            let len = data.len() as u64;
            self.files.lock().unwrap().insert(path.to_path_buf(), data);
            Ok(len)
        }

        async fn finalize(&self, temp: &Path, destination: &Path) -> Result<()> {
            let mut files = self.files.lock().unwrap();
            let data = files
                .remove(temp)
                .ok_or_else(|| anyhow::anyhow!("missing temp file"))?;
            files.insert(destination.to_path_buf(), data);
            Ok(())
        }

        async fn discard(&self, path: &Path) {
            self.files.lock().unwrap().remove(path);
            self.discarded.lock().unwrap().push(path.to_path_buf());
        }
    }

    #[derive(Default)]
    struct RecordingHistory {
        records: Mutex<Vec<HistoryRecord>>,
    }

    impl HistoryRecorder for RecordingHistory {
        fn record(&self, record: &HistoryRecord) -> Result<()> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    struct Harness {
        store: Arc<QueueStore>,
        writer: Arc<MemoryWriter>,
        history: Arc<RecordingHistory>,
        calls: Arc<Mutex<Vec<(ServiceName, String)>>>,
        resolve_gate: Arc<Notify>,
        deps: WorkerDeps,
    }

    fn harness(
        behaviors: Vec<(ServiceName, Behavior)>,
        settings: RuntimeSettings,
        not_found: Vec<String>,
    ) -> Harness {
        let store = Arc::new(QueueStore::new(Arc::new(ProgressBroadcaster::new(1000))));
        let writer = Arc::new(MemoryWriter::default());
        let history = Arc::new(RecordingHistory::default());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let resolve_gate = Arc::new(Notify::new());
        let fetchers = behaviors
            .into_iter()
            .map(|(service, behavior)| {
                let fetcher: Arc<dyn BackendFetcher> = Arc::new(FakeFetcher {
                    service,
                    behavior,
                    calls: calls.clone(),
                });
                (service, fetcher)
            })
            .collect();
        let deps = WorkerDeps {
            store: store.clone(),
            resolver: Arc::new(FakeResolver {
                not_found,
                gate: resolve_gate.clone(),
            }),
            fetchers,
            writer: writer.clone(),
            history: history.clone(),
            health: Arc::new(ServiceHealth::new(Duration::from_secs(60))),
            settings: Arc::new(RwLock::new(settings)),
        };
        Harness {
            store,
            writer,
            history,
            calls,
            resolve_gate,
            deps,
        }
    }

    fn trail(item: &QueueItem) -> Vec<(ServiceName, AttemptOutcome)> {
        item.attempted_services
            .iter()
            .map(|a| (a.service, a.outcome.clone()))
            .collect()
    }

    async fn wait_for(store: &QueueStore, item_id: &str, pred: impl Fn(&QueueItem) -> bool) -> QueueItem {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(item) = store.get(item_id) {
                    if pred(&item) {
                        return item;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for item")
    }

    async fn wait_terminal(store: &QueueStore, item_id: &str) -> QueueItem {
        wait_for(store, item_id, |i| i.state.is_terminal()).await
    }

    #[tokio::test]
    async fn falls_back_to_next_service_when_default_unavailable() {
        let h = harness(
            vec![
                (ServiceName::Tidal, Behavior::Unavailable),
                (ServiceName::Qobuz, Behavior::Succeed),
                (ServiceName::Amazon, Behavior::Succeed),
            ],
            RuntimeSettings::default(),
            vec![],
        );
        let pool = WorkerPool::spawn(1, h.deps.clone());

        let id = h.store.enqueue("spotify:track:a").unwrap().item_id;
        let item = wait_terminal(&h.store, &id).await;

        assert_eq!(item.state, ItemState::Completed);
        let trail: Vec<_> = item
            .attempted_services
            .iter()
            .map(|a| (a.service, a.outcome.clone()))
            .collect();
        assert_eq!(
            trail,
            vec![
                (ServiceName::Tidal, AttemptOutcome::Unavailable),
                (ServiceName::Qobuz, AttemptOutcome::Success),
            ]
        );
        let path = item.result_path.clone().unwrap();
        assert!(h.writer.files.lock().unwrap().contains_key(&path));
        assert!(h.deps.health.unavailable().contains(&ServiceName::Tidal));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn no_fallback_attempts_only_default() {
        let settings = RuntimeSettings {
            allow_fallback: false,
            ..Default::default()
        };
        let h = harness(
            vec![
                (ServiceName::Tidal, Behavior::Error),
                (ServiceName::Qobuz, Behavior::Succeed),
            ],
            settings,
            vec![],
        );
        let pool = WorkerPool::spawn(2, h.deps.clone());

        let id = h.store.enqueue("spotify:track:a").unwrap().item_id;
        let item = wait_terminal(&h.store, &id).await;

        assert_eq!(item.state, ItemState::Failed);
        assert_eq!(item.attempted_services.len(), 1);
        assert!(item.result_path.is_none());
        assert!(item
            .error_message
            .unwrap()
            .starts_with("All services failed, last error: tidal: boom"));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn not_found_fails_without_attempts() {
        let h = harness(
            vec![(ServiceName::Tidal, Behavior::Succeed)],
            RuntimeSettings::default(),
            vec!["spotify:track:missing".to_string()],
        );
        let pool = WorkerPool::spawn(1, h.deps.clone());

        let id = h.store.enqueue("spotify:track:missing").unwrap().item_id;
        let item = wait_terminal(&h.store, &id).await;

        assert_eq!(item.state, ItemState::Failed);
        assert!(item.attempted_services.is_empty());
        assert!(item.descriptor.is_none());
        assert!(h.calls.lock().unwrap().is_empty());

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn single_worker_processes_in_admission_order() {
        let h = harness(
            vec![(ServiceName::Tidal, Behavior::Succeed)],
            RuntimeSettings::default(),
            vec![],
        );
        let ids: Vec<String> = ["spotify:track:1", "spotify:track:2", "spotify:track:3"]
            .iter()
            .map(|r| h.store.enqueue(r).unwrap().item_id)
            .collect();
        let mut subscription = h.store.broadcaster().subscribe();

        let pool = WorkerPool::spawn(1, h.deps.clone());
        for id in &ids {
            wait_terminal(&h.store, id).await;
        }
        pool.shutdown().await;

        let mut sequence: Vec<String> = Vec::new();
        while let Some(event) = subscription.try_recv() {
            if let ProgressEvent::Item { item_id, .. } = event {
                if sequence.last() != Some(&item_id) {
                    sequence.push(item_id);
                }
            }
        }
        // One contiguous run of events per item, in admission order.
        assert_eq!(sequence, ids);

        let calls: Vec<String> = h.calls.lock().unwrap().iter().map(|(_, r)| r.clone()).collect();
        assert_eq!(calls, vec!["spotify:track:1", "spotify:track:2", "spotify:track:3"]);
    }

    #[tokio::test]
    async fn cancel_while_fetching_discards_result() {
        let release = Arc::new(Notify::new());
        let h = harness(
            vec![(ServiceName::Tidal, Behavior::Blocking(release.clone()))],
            RuntimeSettings::default(),
            vec![],
        );
        let pool = WorkerPool::spawn(1, h.deps.clone());

        let id = h.store.enqueue("spotify:track:a").unwrap().item_id;
        wait_for(&h.store, &id, |i| {
            i.state == ItemState::Fetching && i.progress_fraction >= 0.5
        })
        .await;

        h.store.cancel(&id).unwrap();
        release.notify_one();

        let item = wait_terminal(&h.store, &id).await;
        assert_eq!(item.state, ItemState::Cancelled);
        assert!(item.result_path.is_none());
        assert!(!h
            .writer
            .files
            .lock()
            .unwrap()
            .contains_key(&PathBuf::from("/music/Title spotify:track:a.flac")));
        assert_eq!(h.writer.discarded.lock().unwrap().len(), 1);
        assert!(h.history.records.lock().unwrap().is_empty());

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn history_records_completed_and_failed() {
        let h = harness(
            vec![(ServiceName::Tidal, Behavior::Succeed)],
            RuntimeSettings::default(),
            vec!["spotify:track:missing".to_string()],
        );
        let pool = WorkerPool::spawn(1, h.deps.clone());

        let ok = h.store.enqueue("spotify:track:ok").unwrap().item_id;
        let missing = h.store.enqueue("spotify:track:missing").unwrap().item_id;
        wait_terminal(&h.store, &ok).await;
        wait_terminal(&h.store, &missing).await;
        pool.shutdown().await;

        let records = h.history.records.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].item_id, ok);
        assert_eq!(records[0].status, HistoryStatus::Completed);
        assert_eq!(records[0].service_used, Some(ServiceName::Tidal));
        assert!(records[0].result_path.is_some());
        assert_eq!(records[1].item_id, missing);
        assert_eq!(records[1].status, HistoryStatus::Failed);
        assert!(records[1].error_message.is_some());
    }

    #[tokio::test]
    async fn shutdown_cancels_item_in_flight() {
        let release = Arc::new(Notify::new());
        let h = harness(
            vec![(ServiceName::Tidal, Behavior::Blocking(release.clone()))],
            RuntimeSettings::default(),
            vec![],
        );
        let pool = WorkerPool::spawn(1, h.deps.clone());
        let token = pool.shutdown_token();

        let id = h.store.enqueue("spotify:track:a").unwrap().item_id;
        wait_for(&h.store, &id, |i| i.state == ItemState::Fetching).await;

        token.cancel();
        release.notify_one();
        pool.shutdown().await;

        assert_eq!(h.store.get(&id).unwrap().state, ItemState::Cancelled);
    }

    #[tokio::test]
    async fn missing_track_does_not_mark_service_unavailable() {
        let h = harness(
            vec![
                (
                    ServiceName::Tidal,
                    Behavior::Lacks(vec!["spotify:track:1".into(), "spotify:track:2".into()]),
                ),
                (ServiceName::Qobuz, Behavior::Lacks(vec!["spotify:track:1".into()])),
                (
                    ServiceName::Amazon,
                    Behavior::Lacks(vec!["spotify:track:1".into(), "spotify:track:2".into()]),
                ),
            ],
            RuntimeSettings::default(),
            vec![],
        );
        let pool = WorkerPool::spawn(1, h.deps.clone());

        let first = h.store.enqueue("spotify:track:1").unwrap().item_id;
        let second = h.store.enqueue("spotify:track:2").unwrap().item_id;
        let first = wait_terminal(&h.store, &first).await;
        let second = wait_terminal(&h.store, &second).await;

        assert_eq!(first.state, ItemState::Failed);
        assert_eq!(first.attempted_services.len(), 3);
        assert_eq!(second.state, ItemState::Completed);
        assert_eq!(
            trail(&second),
            vec![
                (ServiceName::Tidal, AttemptOutcome::Unavailable),
                (ServiceName::Qobuz, AttemptOutcome::Success),
            ]
        );
        assert!(h.deps.health.unavailable().is_empty());

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn attempt_timeout_moves_to_next_service() {
        let mut settings = RuntimeSettings::default();
        for service in settings.services.values_mut() {
            service.attempt_timeout = Duration::from_millis(50);
        }
        let h = harness(
            vec![
                (ServiceName::Tidal, Behavior::Stall),
                (ServiceName::Qobuz, Behavior::Succeed),
            ],
            settings,
            vec![],
        );
        let pool = WorkerPool::spawn(1, h.deps.clone());

        let id = h.store.enqueue("spotify:track:a").unwrap().item_id;
        let item = wait_terminal(&h.store, &id).await;

        assert_eq!(item.state, ItemState::Completed);
        let attempts = trail(&item);
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].0, ServiceName::Tidal);
        match &attempts[0].1 {
            AttemptOutcome::Error(reason) => assert!(reason.starts_with("timed out"), "{}", reason),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(attempts[1], (ServiceName::Qobuz, AttemptOutcome::Success));

        let temp = PathBuf::from(format!("/music/Title spotify:track:a.flac.{}.part", id));
        assert_eq!(*h.writer.discarded.lock().unwrap(), vec![temp.clone()]);
        let files = h.writer.files.lock().unwrap();
        assert!(!files.contains_key(&temp));
        assert!(files.contains_key(item.result_path.as_ref().unwrap()));
        // A slow attempt is not a service outage.
        assert!(h.deps.health.unavailable().is_empty());
        drop(files);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_while_resolving_skips_fetching() {
        let h = harness(
            vec![(ServiceName::Tidal, Behavior::Succeed)],
            RuntimeSettings::default(),
            vec![],
        );
        let pool = WorkerPool::spawn(1, h.deps.clone());

        let reference = format!("{}:a", GATED_PREFIX);
        let id = h.store.enqueue(&reference).unwrap().item_id;
        wait_for(&h.store, &id, |i| i.state == ItemState::Resolving).await;

        assert_eq!(h.store.cancel(&id), Ok(CancelOutcome::Requested));
        h.resolve_gate.notify_one();

        let item = wait_terminal(&h.store, &id).await;
        assert_eq!(item.state, ItemState::Cancelled);
        assert!(item.attempted_services.is_empty());
        assert!(item.error_message.is_none());
        assert!(item.descriptor.is_none());
        assert!(h.calls.lock().unwrap().is_empty());
        assert!(h.history.records.lock().unwrap().is_empty());

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn history_failure_does_not_revert_completion() {
        let mut history = MockHistoryRecorder::new();
        history
            .expect_record()
            .withf(|record| {
                record.status == HistoryStatus::Completed
                    && record.service_used == Some(ServiceName::Tidal)
            })
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("database is locked")));

        let mut h = harness(
            vec![(ServiceName::Tidal, Behavior::Succeed)],
            RuntimeSettings::default(),
            vec![],
        );
        h.deps.history = Arc::new(history);
        let pool = WorkerPool::spawn(1, h.deps.clone());

        let id = h.store.enqueue("spotify:track:a").unwrap().item_id;
        wait_terminal(&h.store, &id).await;
        pool.shutdown().await;

        let item = h.store.get(&id).unwrap();
        assert_eq!(item.state, ItemState::Completed);
        assert!(item.error_message.is_none());
    }
}
