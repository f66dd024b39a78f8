//! Common test infrastructure
//!
//! Every test spawns its own server backed by an in-process engine with
//! fake metadata and backend services, a temporary download directory and a
//! temporary history database. Tests should only import from this module.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{TestClient, TestServer, TRACK_1_ID};
//!
//! #[tokio::test]
//! async fn test_download_track() {
//!     let server = TestServer::spawn().await;
//!     let client = TestClient::new(server.base_url.clone());
//!
//!     let item_id = client.enqueue_track_id(&track_uri(TRACK_1_ID)).await;
//!     let item = client.wait_for_terminal(&item_id).await;
//!     assert_eq!(item["state"], "completed");
//! }
//! ```

mod client;
mod constants;
mod server;

pub use client::TestClient;
pub use constants::*;
#[allow(unused_imports)]
pub use server::{FetchBehavior, TestServer, TestServerOptions};
