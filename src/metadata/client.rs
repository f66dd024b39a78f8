//! HTTP client for the catalog metadata API.

use super::models::{CollectionResponse, TrackResponse};
use super::source_ref::{ReferenceKind, SourceReference};
use crate::download_manager::{MetadataResolver, ResolveError, TrackDescriptor};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Resolves references against a metadata API exposing
/// `GET /track/{id}`, `GET /album/{id}/tracks` and `GET /playlist/{id}/tracks`.
#[derive(Clone)]
pub struct HttpMetadataResolver {
    client: Client,
    base_url: String,
}

impl HttpMetadataResolver {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get(&self, url: &str) -> Result<Response, ResolveError> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ResolveError::Other(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(ResolveError::NotFound),
            StatusCode::TOO_MANY_REQUESTS => Err(ResolveError::RateLimited),
            status => Err(ResolveError::Other(format!(
                "Metadata request failed with status: {}",
                status
            ))),
        }
    }
}

fn parse_reference(source_reference: &str) -> Result<SourceReference, ResolveError> {
    SourceReference::parse(source_reference).map_err(|e| ResolveError::Other(e.to_string()))
}

#[async_trait]
impl MetadataResolver for HttpMetadataResolver {
    async fn resolve(&self, source_reference: &str) -> Result<TrackDescriptor, ResolveError> {
        let reference = parse_reference(source_reference)?;
        if reference.kind() != ReferenceKind::Track {
            return Err(ResolveError::Other(format!(
                "{} is not a track",
                reference.canonical()
            )));
        }

        let url = format!("{}/track/{}", self.base_url, reference.id());
        let track: TrackResponse = self
            .get(&url)
            .await?
            .json()
            .await
            .map_err(|e| ResolveError::Other(format!("Invalid track response: {}", e)))?;
        Ok(track.into_descriptor())
    }

    async fn expand(&self, source_reference: &str) -> Result<Vec<String>, ResolveError> {
        let reference = parse_reference(source_reference)?;
        if !reference.is_collection() {
            return Ok(vec![reference.canonical()]);
        }

        let url = format!(
            "{}/{}/{}/tracks",
            self.base_url,
            reference.kind(),
            reference.id()
        );
        let collection: CollectionResponse = self
            .get(&url)
            .await?
            .json()
            .await
            .map_err(|e| ResolveError::Other(format!("Invalid collection response: {}", e)))?;
        debug!(
            "{} expanded to {} track(s)",
            reference.canonical(),
            collection.tracks.len()
        );
        Ok(collection
            .tracks
            .into_iter()
            .map(|t| SourceReference::new(ReferenceKind::Track, t.id).canonical())
            .collect())
    }
}
