//! Shared constants for end-to-end tests
//!
//! The fake metadata service in `server.rs` knows exactly these references.
//! When the fixture catalog changes, update only this file.
#![allow(dead_code)]

// ============================================================================
// Fixture catalog
// ============================================================================

/// "Opening Track" by The Test Band, delivered instantly.
pub const TRACK_1_ID: &str = "4uLU6hMCjMI75M1A2tKUQC";

/// "Middle Track" by The Test Band, delivered instantly.
pub const TRACK_2_ID: &str = "7GhIk7Il098yCjg4BQjzvb";

/// "Closing Track" by The Test Band, delivered instantly.
pub const TRACK_3_ID: &str = "3n3Ppam7vgaVa1iaRUc9Lp";

/// "Long Jam" by Jazz Ensemble, streamed slowly so tests can act mid-fetch.
pub const SLOW_TRACK_ID: &str = "0VjIjW4GlUZAMYd2vXMi3b";

/// Unknown to the metadata service.
pub const MISSING_TRACK_ID: &str = "2takcwOaAZWiXQijPHIx7B";

/// "First Album" containing tracks 1, 2 and 3.
pub const ALBUM_1_ID: &str = "6akEvsycLGftJxYudPjmqK";

/// Playlist with no tracks.
pub const EMPTY_PLAYLIST_ID: &str = "37i9dQZF1DXcBWIGoYBM5M";

// ============================================================================
// Timing
// ============================================================================

/// Chunks the slow track is streamed in.
pub const SLOW_TRACK_CHUNKS: usize = 40;

/// Delay before each chunk of the slow track.
pub const SLOW_CHUNK_DELAY_MS: u64 = 50;

/// How long to wait for the server to become ready (milliseconds)
pub const SERVER_READY_TIMEOUT_MS: u64 = 5000;

/// How often to poll server readiness (milliseconds)
pub const SERVER_READY_POLL_INTERVAL_MS: u64 = 50;

/// Request timeout for test HTTP client (seconds)
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

/// How long a test waits for an item to reach a given state (milliseconds)
pub const ITEM_WAIT_TIMEOUT_MS: u64 = 10_000;

/// How often item state is polled (milliseconds)
pub const ITEM_POLL_INTERVAL_MS: u64 = 20;

// ============================================================================
// Helpers
// ============================================================================

pub fn track_uri(id: &str) -> String {
    format!("spotify:track:{}", id)
}

pub fn album_url(id: &str) -> String {
    format!("https://open.spotify.com/album/{}", id)
}

pub fn playlist_url(id: &str) -> String {
    format!("https://open.spotify.com/playlist/{}", id)
}
