//! HTTP client for end-to-end tests
//!
//! Wraps reqwest with one method per server endpoint. When API routes or
//! request formats change, update only this file.
#![allow(dead_code)]

use super::constants::*;
use reqwest::{Response, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

pub struct TestClient {
    /// The underlying reqwest client (public for custom requests in tests)
    pub client: reqwest::Client,
    /// The base URL of the test server
    pub base_url: String,
}

impl TestClient {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to build reqwest client");

        Self { client, base_url }
    }

    async fn get(&self, path: &str) -> Response {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .expect("GET request failed")
    }

    async fn post(&self, path: &str, body: Option<Value>) -> Response {
        let mut request = self.client.post(format!("{}{}", self.base_url, path));
        if let Some(body) = body {
            request = request.json(&body);
        }
        request.send().await.expect("POST request failed")
    }

    // ========================================================================
    // Health
    // ========================================================================

    /// GET /health
    pub async fn health(&self) -> Response {
        self.get("/health").await
    }

    // ========================================================================
    // Download queue
    // ========================================================================

    /// POST /api/download/track
    pub async fn enqueue_track(&self, url: &str) -> Response {
        self.post("/api/download/track", Some(json!({ "url": url })))
            .await
    }

    /// Enqueues a track and returns its item id, asserting success.
    pub async fn enqueue_track_id(&self, url: &str) -> String {
        let response = self.enqueue_track(url).await;
        assert_eq!(response.status(), StatusCode::OK, "enqueue of {} failed", url);
        let body: Value = response.json().await.expect("Invalid enqueue response");
        body["item_id"]
            .as_str()
            .expect("Missing item_id")
            .to_string()
    }

    /// POST /api/download/collection
    pub async fn enqueue_collection(&self, url: &str) -> Response {
        self.post("/api/download/collection", Some(json!({ "url": url })))
            .await
    }

    /// GET /api/download/queue
    pub async fn get_queue(&self) -> Response {
        self.get("/api/download/queue").await
    }

    /// GET /api/download/queue as JSON
    pub async fn queue_json(&self) -> Value {
        self.get_queue()
            .await
            .json()
            .await
            .expect("Invalid queue response")
    }

    /// GET /api/download/progress
    pub async fn get_progress(&self, item_id: Option<&str>) -> Response {
        match item_id {
            Some(id) => self.get(&format!("/api/download/progress?item_id={}", id)).await,
            None => self.get("/api/download/progress").await,
        }
    }

    /// GET /api/download/status
    pub async fn get_status(&self) -> Response {
        self.get("/api/download/status").await
    }

    /// POST /api/download/queue/{id}/cancel
    pub async fn cancel_item(&self, item_id: &str) -> Response {
        self.post(&format!("/api/download/queue/{}/cancel", item_id), None)
            .await
    }

    /// POST /api/download/queue/cancel-all
    pub async fn cancel_all_pending(&self) -> Response {
        self.post("/api/download/queue/cancel-all", None).await
    }

    /// POST /api/download/queue/clear
    pub async fn clear_completed(&self) -> Response {
        self.post("/api/download/queue/clear", None).await
    }

    /// POST /api/download/queue/clear-all
    pub async fn clear_all(&self) -> Response {
        self.post("/api/download/queue/clear-all", None).await
    }

    /// Finds one item in the current queue snapshot.
    pub async fn find_item(&self, item_id: &str) -> Option<Value> {
        let queue = self.queue_json().await;
        queue["items"]
            .as_array()?
            .iter()
            .find(|item| item["id"] == item_id)
            .cloned()
    }

    /// Polls the queue until `pred` holds for the item, panicking on timeout.
    pub async fn wait_for_item(&self, item_id: &str, pred: impl Fn(&Value) -> bool) -> Value {
        let start = std::time::Instant::now();
        loop {
            if let Some(item) = self.find_item(item_id).await {
                if pred(&item) {
                    return item;
                }
            }
            if start.elapsed() > Duration::from_millis(ITEM_WAIT_TIMEOUT_MS) {
                panic!(
                    "Item {} did not reach the expected state within {}ms: {:?}",
                    item_id,
                    ITEM_WAIT_TIMEOUT_MS,
                    self.find_item(item_id).await
                );
            }
            tokio::time::sleep(Duration::from_millis(ITEM_POLL_INTERVAL_MS)).await;
        }
    }

    pub async fn wait_for_state(&self, item_id: &str, state: &str) -> Value {
        self.wait_for_item(item_id, |item| item["state"] == state)
            .await
    }

    pub async fn wait_for_terminal(&self, item_id: &str) -> Value {
        self.wait_for_item(item_id, |item| {
            matches!(
                item["state"].as_str(),
                Some("completed") | Some("failed") | Some("cancelled")
            )
        })
        .await
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    /// POST /api/spotify/metadata
    pub async fn get_metadata(&self, url: &str) -> Response {
        self.post("/api/spotify/metadata", Some(json!({ "url": url })))
            .await
    }

    // ========================================================================
    // History
    // ========================================================================

    /// GET /api/history/downloads
    pub async fn get_history(&self, limit: Option<usize>) -> Response {
        match limit {
            Some(limit) => self.get(&format!("/api/history/downloads?limit={}", limit)).await,
            None => self.get("/api/history/downloads").await,
        }
    }

    /// POST /api/history/downloads/clear
    pub async fn clear_history(&self) -> Response {
        self.post("/api/history/downloads/clear", None).await
    }

    /// DELETE /api/history/downloads/{id}
    pub async fn delete_history_entry(&self, id: i64) -> Response {
        self.client
            .delete(format!("{}/api/history/downloads/{}", self.base_url, id))
            .send()
            .await
            .expect("DELETE request failed")
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// GET /api/settings
    pub async fn get_settings(&self) -> Response {
        self.get("/api/settings").await
    }

    /// POST /api/settings
    pub async fn update_settings(&self, update: Value) -> Response {
        self.post("/api/settings", Some(update)).await
    }

    /// GET /api/defaults
    pub async fn get_defaults(&self) -> Response {
        self.get("/api/defaults").await
    }
}
