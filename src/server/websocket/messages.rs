//! WebSocket message types.
//!
//! Server messages use a `{type, payload}` envelope. Client messages are a
//! closed set tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::download_manager::{ProgressEvent, ProgressView, QueueSnapshot};

/// Server -> Client message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub payload: serde_json::Value,
}

impl ServerMessage {
    pub fn new(msg_type: impl Into<String>, payload: impl Serialize) -> Self {
        Self {
            msg_type: msg_type.into(),
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn empty(msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            payload: serde_json::Value::Null,
        }
    }

    /// Wraps an engine event: item events become `download_progress`,
    /// queue-level events become `queue_update`.
    pub fn from_event(event: &ProgressEvent) -> Self {
        match event {
            ProgressEvent::Item { .. } => Self::new(msg_types::DOWNLOAD_PROGRESS, event),
            ProgressEvent::QueueChanged { .. } => Self::new(msg_types::QUEUE_UPDATE, event),
        }
    }
}

/// Client -> Server messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    RequestStatus,
    Cancel { item_id: String },
}

/// Sent once after the upgrade.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Connected {
    pub server_version: String,
}

/// Full state for reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusUpdate {
    pub progress: Option<ProgressView>,
    pub queue: QueueSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CancelResult {
    pub item_id: String,
    pub success: bool,
    /// "cancelled", "requested" or "already_terminal" on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Message type constants.
pub mod msg_types {
    pub const CONNECTED: &str = "connected";
    pub const PONG: &str = "pong";
    pub const ERROR: &str = "error";
    pub const STATUS_UPDATE: &str = "status_update";
    pub const CANCEL_RESULT: &str = "cancel_result";
    /// An item changed state or progress.
    pub const DOWNLOAD_PROGRESS: &str = "download_progress";
    /// Items were admitted or removed.
    pub const QUEUE_UPDATE: &str = "queue_update";
}
