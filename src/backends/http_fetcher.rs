use crate::download_manager::{
    AudioStream, BackendFetcher, FetchError, ProgressCallback, ServiceCredentials, ServiceName,
    TrackDescriptor,
};
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tracing::debug;

/// Fetches audio from one backend's HTTP API.
///
/// Tracks are addressed by the backend's own id when the descriptor carries
/// one (`GET {api_url}/track/{id}/stream`), otherwise by ISRC
/// (`GET {api_url}/isrc/{isrc}/stream`). The requested quality is passed as
/// the `quality` query parameter.
///
/// 404 and 451 mean the track is not carried. 429, 502-504, refused
/// connections and a missing `api_url` mean the service is unavailable.
pub struct HttpBackendFetcher {
    service: ServiceName,
    client: Client,
}

impl HttpBackendFetcher {
    pub fn new(service: ServiceName) -> Result<Self> {
        // No client-level timeout: each attempt is bounded by the worker.
        let client = Client::builder().build()?;
        Ok(Self { service, client })
    }

    fn stream_url(
        &self,
        api_url: &str,
        descriptor: &TrackDescriptor,
    ) -> Result<String, FetchError> {
        let api_url = api_url.trim_end_matches('/');
        if let Some(id) = descriptor.service_ids.get(&self.service) {
            return Ok(format!("{}/track/{}/stream", api_url, id));
        }
        if let Some(isrc) = &descriptor.isrc {
            return Ok(format!("{}/isrc/{}/stream", api_url, isrc));
        }
        Err(FetchError::NotCarried(format!(
            "no {} id or ISRC for track",
            self.service
        )))
    }
}

#[async_trait]
impl BackendFetcher for HttpBackendFetcher {
    fn service(&self) -> ServiceName {
        self.service
    }

    async fn fetch(
        &self,
        descriptor: &TrackDescriptor,
        credentials: &ServiceCredentials,
        progress: ProgressCallback,
    ) -> Result<AudioStream, FetchError> {
        let api_url = credentials
            .api_url
            .as_deref()
            .ok_or_else(|| FetchError::Unavailable("no api_url configured".to_string()))?;
        let url = self.stream_url(api_url, descriptor)?;
        debug!("[{}] GET {}", self.service, url);

        let mut request = self
            .client
            .get(&url)
            .query(&[("quality", credentials.audio_format.as_str())]);
        if let Some(token) = &credentials.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                FetchError::Unavailable(e.to_string())
            } else {
                FetchError::Other(e.to_string())
            }
        })?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND | StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS => {
                return Err(FetchError::NotCarried(format!(
                    "{} returned {}",
                    self.service,
                    response.status()
                )))
            }
            StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => {
                return Err(FetchError::Unavailable(format!(
                    "{} returned {}",
                    self.service,
                    response.status()
                )))
            }
            status => {
                return Err(FetchError::Other(format!(
                    "request failed with status: {}",
                    status
                )))
            }
        }

        let total = response.content_length().filter(|len| *len > 0);
        let mut received: u64 = 0;
        let stream = response.bytes_stream().map(move |chunk| match chunk {
            Ok(bytes) => {
                received += bytes.len() as u64;
                if let Some(total) = total {
                    progress(received as f64 / total as f64);
                }
                Ok(bytes.to_vec())
            }
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
        });
        Ok(stream.boxed())
    }
}
