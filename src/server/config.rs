use super::RequestsLoggingLevel;
use crate::config::{AppConfig, DEFAULT_HOST, DEFAULT_METRICS_PORT, DEFAULT_PORT};

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub requests_logging_level: RequestsLoggingLevel,
    pub host: String,
    pub port: u16,
    pub metrics_port: u16,
    /// Origins allowed by the CORS layer. Empty means any origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            requests_logging_level: RequestsLoggingLevel::Path,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            metrics_port: DEFAULT_METRICS_PORT,
            cors_origins: vec![],
        }
    }
}

impl From<&AppConfig> for ServerConfig {
    fn from(config: &AppConfig) -> Self {
        ServerConfig {
            requests_logging_level: config.logging_level.clone(),
            host: config.host.clone(),
            port: config.port,
            metrics_port: config.metrics_port,
            cors_origins: config.cors_origins.clone(),
        }
    }
}
