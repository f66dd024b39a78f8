//! Test server lifecycle management
//!
//! Each test gets an isolated server with its own engine, download
//! directory and history database. Metadata and backend services are
//! in-process fakes serving the fixture catalog from `constants.rs`.

use super::constants::*;
use async_trait::async_trait;
use futures::StreamExt;
use spotiflac_server::config::RuntimeSettings;
use spotiflac_server::download_manager::{
    AudioStream, BackendFetcher, DownloadManager, DownloadManagerParts, FetchError,
    HistoryRecorder, MetadataResolver, ProgressCallback, ResolveError, ServiceCredentials,
    ServiceName, TrackDescriptor,
};
use spotiflac_server::history::SqliteHistoryStore;
use spotiflac_server::media_files::FsMediaWriter;
use spotiflac_server::server::{make_app, RequestsLoggingLevel, ServerConfig, ServerState};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

const CHUNK_SIZE: usize = 1024;
const FAST_TRACK_CHUNKS: usize = 4;

// ============================================================================
// Fake collaborators
// ============================================================================

fn fixture_track(id: &str) -> Option<TrackDescriptor> {
    let (title, artist, album, number) = match id {
        TRACK_1_ID => ("Opening Track", "The Test Band", "First Album", 1),
        TRACK_2_ID => ("Middle Track", "The Test Band", "First Album", 2),
        TRACK_3_ID => ("Closing Track", "The Test Band", "First Album", 3),
        SLOW_TRACK_ID => ("Long Jam", "Jazz Ensemble", "Jazz Collection", 1),
        _ => return None,
    };
    Some(TrackDescriptor {
        catalog_id: id.to_string(),
        title: title.to_string(),
        artists: vec![artist.to_string()],
        album: album.to_string(),
        duration_ms: 180_000,
        track_number: Some(number),
        isrc: None,
        service_ids: HashMap::new(),
    })
}

fn reference_id(source_reference: &str) -> &str {
    source_reference.rsplit(':').next().unwrap_or(source_reference)
}

struct FixtureResolver;

#[async_trait]
impl MetadataResolver for FixtureResolver {
    async fn resolve(&self, source_reference: &str) -> Result<TrackDescriptor, ResolveError> {
        fixture_track(reference_id(source_reference)).ok_or(ResolveError::NotFound)
    }

    async fn expand(&self, source_reference: &str) -> Result<Vec<String>, ResolveError> {
        match reference_id(source_reference) {
            ALBUM_1_ID => Ok([TRACK_1_ID, TRACK_2_ID, TRACK_3_ID]
                .iter()
                .map(|id| track_uri(id))
                .collect()),
            EMPTY_PLAYLIST_ID => Ok(Vec::new()),
            _ => Err(ResolveError::NotFound),
        }
    }
}

/// How a fake backend answers every fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchBehavior {
    Deliver,
    Unavailable,
    Fail,
}

struct FakeFetcher {
    service: ServiceName,
    behavior: FetchBehavior,
}

#[async_trait]
impl BackendFetcher for FakeFetcher {
    fn service(&self) -> ServiceName {
        self.service
    }

    async fn fetch(
        &self,
        descriptor: &TrackDescriptor,
        _credentials: &ServiceCredentials,
        progress: ProgressCallback,
    ) -> Result<AudioStream, FetchError> {
        match self.behavior {
            FetchBehavior::Unavailable => {
                return Err(FetchError::Unavailable("service offline".to_string()))
            }
            FetchBehavior::Fail => return Err(FetchError::Other("track not available".to_string())),
            FetchBehavior::Deliver => {}
        }

        let (chunks, delay) = if descriptor.catalog_id == SLOW_TRACK_ID {
            (SLOW_TRACK_CHUNKS, Duration::from_millis(SLOW_CHUNK_DELAY_MS))
        } else {
            (FAST_TRACK_CHUNKS, Duration::ZERO)
        };

        let stream = futures::stream::iter(1..=chunks)
            .then(move |i| {
                let progress = progress.clone();
                async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    progress(i as f64 / chunks as f64);
                    Ok(vec![0u8; CHUNK_SIZE])
                }
            })
            .boxed();
        Ok(stream)
    }
}

// ============================================================================
// Server
// ============================================================================

pub struct TestServerOptions {
    pub worker_count: usize,
    pub behaviors: HashMap<ServiceName, FetchBehavior>,
}

impl Default for TestServerOptions {
    fn default() -> Self {
        Self {
            worker_count: 2,
            behaviors: HashMap::new(),
        }
    }
}

impl TestServerOptions {
    pub fn with_behavior(mut self, service: ServiceName, behavior: FetchBehavior) -> Self {
        self.behaviors.insert(service, behavior);
        self
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }
}

/// Test server instance with an isolated engine.
///
/// When dropped, the HTTP server shuts down and temp resources are cleaned up.
pub struct TestServer {
    /// Base URL for making requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    /// The port the server is listening on
    pub port: u16,

    /// Directory downloads are written to
    pub download_dir: PathBuf,

    /// Engine behind the server, for direct access in tests
    pub manager: Arc<DownloadManager>,

    // Private fields - keep resources alive until drop
    _temp_dir: TempDir,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    /// Spawns a server where every backend delivers.
    pub async fn spawn() -> Self {
        Self::spawn_with(TestServerOptions::default()).await
    }

    /// Spawns a new test server on a random port
    ///
    /// # Panics
    ///
    /// Panics if temp resources cannot be created, the port cannot be bound
    /// or the server does not become ready within the timeout.
    pub async fn spawn_with(options: TestServerOptions) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let download_dir = temp_dir.path().join("downloads");

        let settings = Arc::new(RwLock::new(RuntimeSettings {
            download_path: download_dir.clone(),
            ..RuntimeSettings::default()
        }));

        let history = Arc::new(
            SqliteHistoryStore::open(&temp_dir.path().join("history.db"))
                .expect("Failed to open history store"),
        );

        let fetchers: HashMap<ServiceName, Arc<dyn BackendFetcher>> = ServiceName::ALL
            .iter()
            .map(|service| {
                let behavior = options
                    .behaviors
                    .get(service)
                    .copied()
                    .unwrap_or(FetchBehavior::Deliver);
                let fetcher: Arc<dyn BackendFetcher> = Arc::new(FakeFetcher {
                    service: *service,
                    behavior,
                });
                (*service, fetcher)
            })
            .collect();

        let manager = Arc::new(DownloadManager::new(DownloadManagerParts {
            resolver: Arc::new(FixtureResolver),
            fetchers,
            writer: Arc::new(FsMediaWriter::new(settings.clone())),
            history: history.clone() as Arc<dyn HistoryRecorder>,
            settings,
            worker_count: options.worker_count,
            event_buffer_capacity: 256,
            unavailable_cooldown: Duration::from_secs(60),
        }));
        manager.start();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();
        let base_url = format!("http://127.0.0.1:{}", port);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let config = ServerConfig {
            requests_logging_level: RequestsLoggingLevel::None,
            host: "127.0.0.1".to_string(),
            port,
            ..ServerConfig::default()
        };
        let state = ServerState::new(config, manager.clone(), Some(history), None);
        let app = make_app(state);

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Server failed");
        });

        let server = Self {
            base_url,
            port,
            download_dir,
            manager,
            _temp_dir: temp_dir,
            _shutdown_tx: Some(shutdown_tx),
        };

        server.wait_for_ready().await;

        server
    }

    /// Waits for the server to become ready by polling the /health endpoint
    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("Failed to build reqwest client");

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            if start.elapsed() > timeout {
                panic!(
                    "Server did not become ready within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }

            match client.get(format!("{}/health", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => return,
                _ => {
                    tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }

    pub fn ws_url(&self) -> String {
        self.base_url.replace("http://", "ws://") + "/ws"
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self._shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
