use super::schema::HISTORY_VERSIONED_SCHEMAS;
use crate::download_manager::{
    HistoryRecord, HistoryRecorder, HistoryStatus, ServiceAttempt, ServiceName,
};
use crate::sqlite_persistence::open_versioned;
use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// A persisted history row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub item_id: String,
    pub source_reference: String,
    pub title: Option<String>,
    pub artists: Option<String>,
    pub album: Option<String>,
    pub status: HistoryStatus,
    pub service_used: Option<ServiceName>,
    pub result_path: Option<String>,
    pub error_message: Option<String>,
    pub attempts: Vec<ServiceAttempt>,
    /// Unix seconds.
    pub finished_at: i64,
}

pub struct SqliteHistoryStore {
    conn: Mutex<Connection>,
}

impl SqliteHistoryStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_versioned(path, HISTORY_VERSIONED_SCHEMAS, "history")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        HISTORY_VERSIONED_SCHEMAS
            .last()
            .context("No history schema defined")?
            .create(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Most recent entries first.
    pub fn list(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, item_id, source_reference, title, artists, album, status, service_used,
                    result_path, error_message, attempts_json, finished_at
             FROM download_history
             ORDER BY finished_at DESC, id DESC
             LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit as i64], Self::row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Removes every entry, returning how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute("DELETE FROM download_history", [])?;
        info!("Cleared {} history entries", removed);
        Ok(removed)
    }

    /// Removes one entry. Returns false when it did not exist.
    pub fn delete(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute("DELETE FROM download_history WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<HistoryEntry> {
        let status: String = row.get("status")?;
        let service_used: Option<String> = row.get("service_used")?;
        let attempts_json: String = row.get("attempts_json")?;
        let attempts = serde_json::from_str(&attempts_json).unwrap_or_else(|e| {
            warn!("Unreadable attempts in history row: {}", e);
            Vec::new()
        });

        Ok(HistoryEntry {
            id: row.get("id")?,
            item_id: row.get("item_id")?,
            source_reference: row.get("source_reference")?,
            title: row.get("title")?,
            artists: row.get("artists")?,
            album: row.get("album")?,
            status: HistoryStatus::from_str(&status).unwrap_or(HistoryStatus::Failed),
            service_used: service_used.as_deref().and_then(ServiceName::from_str),
            result_path: row.get("result_path")?,
            error_message: row.get("error_message")?,
            attempts,
            finished_at: row.get("finished_at")?,
        })
    }
}

impl HistoryRecorder for SqliteHistoryStore {
    fn record(&self, record: &HistoryRecord) -> Result<()> {
        let attempts_json = serde_json::to_string(&record.attempts)?;
        let descriptor = record.descriptor.as_ref();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO download_history
                (item_id, source_reference, title, artists, album, status, service_used,
                 result_path, error_message, attempts_json, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.item_id,
                record.source_reference,
                descriptor.map(|d| d.title.clone()),
                descriptor.map(|d| d.artists_display()),
                descriptor.map(|d| d.album.clone()),
                record.status.as_str(),
                record.service_used.map(|s| s.as_str()),
                record
                    .result_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().to_string()),
                record.error_message,
                attempts_json,
                record.finished_at.timestamp(),
            ],
        )
        .context("Failed to insert history entry")?;
        debug!("Recorded {} as {}", record.item_id, record.status.as_str());
        Ok(())
    }
}
