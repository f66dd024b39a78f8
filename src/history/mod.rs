//! Durable log of finished downloads.

mod schema;
mod store;

pub use store::{HistoryEntry, SqliteHistoryStore, DEFAULT_HISTORY_LIMIT};
