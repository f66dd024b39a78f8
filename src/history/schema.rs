use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

const DOWNLOAD_HISTORY_TABLE_V1: Table = Table {
    name: "download_history",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("item_id", &SqlType::Text, non_null = true),
        sqlite_column!("source_reference", &SqlType::Text, non_null = true),
        sqlite_column!("title", &SqlType::Text),
        sqlite_column!("artists", &SqlType::Text),
        sqlite_column!("album", &SqlType::Text),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("service_used", &SqlType::Text),
        sqlite_column!("result_path", &SqlType::Text),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!("attempts_json", &SqlType::Text, non_null = true),
        sqlite_column!("finished_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_history_finished_at", "finished_at")],
};

pub const HISTORY_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[DOWNLOAD_HISTORY_TABLE_V1],
    migration: None,
}];
