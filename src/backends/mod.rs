//! Backend service fetchers.

mod http_fetcher;

pub use http_fetcher::HttpBackendFetcher;

use crate::download_manager::{BackendFetcher, ServiceName};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

/// One HTTP fetcher per supported service.
pub fn http_fetchers() -> Result<HashMap<ServiceName, Arc<dyn BackendFetcher>>> {
    let mut fetchers: HashMap<ServiceName, Arc<dyn BackendFetcher>> = HashMap::new();
    for service in ServiceName::ALL {
        fetchers.insert(service, Arc::new(HttpBackendFetcher::new(service)?));
    }
    Ok(fetchers)
}
