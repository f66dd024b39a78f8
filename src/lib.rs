//! SpotiFLAC Server Library
//!
//! This library exposes the internal modules for testing and potential reuse.

pub mod app;
pub mod backends;
pub mod config;
pub mod download_manager;
pub mod history;
pub mod media_files;
pub mod metadata;
pub mod server;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use download_manager::DownloadManager;
pub use server::{run_server, RequestsLoggingLevel};
