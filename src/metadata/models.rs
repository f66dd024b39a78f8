//! Response shapes of the metadata API.

use crate::download_manager::{ServiceName, TrackDescriptor};
use serde::Deserialize;
use std::collections::HashMap;

/// A track as returned by `GET /track/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackResponse {
    pub id: String,
    pub name: String,
    pub artists: Vec<String>,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub track_number: Option<u32>,
    #[serde(default)]
    pub isrc: Option<String>,
    /// Backend ids keyed by service name; unknown services are ignored.
    #[serde(default)]
    pub service_ids: HashMap<String, String>,
}

impl TrackResponse {
    pub fn into_descriptor(self) -> TrackDescriptor {
        let service_ids = self
            .service_ids
            .into_iter()
            .filter_map(|(name, id)| ServiceName::from_str(&name).map(|s| (s, id)))
            .collect();
        TrackDescriptor {
            catalog_id: self.id,
            title: self.name,
            artists: self.artists,
            album: self.album,
            duration_ms: self.duration_ms,
            track_number: self.track_number,
            isrc: self.isrc,
            service_ids,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectionTrack {
    pub id: String,
}

/// An album or playlist as returned by `GET /{kind}/{id}/tracks`.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectionResponse {
    #[serde(default)]
    pub name: Option<String>,
    pub tracks: Vec<CollectionTrack>,
}
