use axum::extract::FromRef;

use crate::download_manager::DownloadManager;
use crate::history::SqliteHistoryStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use super::ServerConfig;

pub type GuardedDownloadManager = Arc<DownloadManager>;
pub type OptionalHistoryStore = Option<Arc<SqliteHistoryStore>>;

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub download_manager: GuardedDownloadManager,
    pub history_store: OptionalHistoryStore,
    /// Config file settings updates are written back to, if any.
    pub config_path: Option<PathBuf>,
    pub hash: String,
}

impl ServerState {
    pub fn new(
        config: ServerConfig,
        download_manager: GuardedDownloadManager,
        history_store: OptionalHistoryStore,
        config_path: Option<PathBuf>,
    ) -> Self {
        Self {
            config,
            start_time: Instant::now(),
            download_manager,
            history_store,
            config_path,
            hash: env!("GIT_HASH").to_string(),
        }
    }
}

impl FromRef<ServerState> for ServerConfig {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}

impl FromRef<ServerState> for GuardedDownloadManager {
    fn from_ref(input: &ServerState) -> Self {
        input.download_manager.clone()
    }
}

impl FromRef<ServerState> for OptionalHistoryStore {
    fn from_ref(input: &ServerState) -> Self {
        input.history_store.clone()
    }
}
