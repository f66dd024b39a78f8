mod file_config;

pub use file_config::{
    assign_key, lookup_key, DatabaseFileConfig, DownloadFileConfig, FileConfig, ServerFileConfig,
    ServiceFileConfig, ServicesFileConfig,
};

use crate::download_manager::{SelectorConfig, ServiceCredentials, ServiceName};
use crate::server::RequestsLoggingLevel;
use anyhow::{bail, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_METRICS_PORT: u16 = 9091;
pub const DEFAULT_WORKER_COUNT: usize = 2;
pub const MAX_WORKER_COUNT: usize = 8;
pub const DEFAULT_EVENT_BUFFER_CAPACITY: usize = 100;
pub const DEFAULT_RESOLVE_TIMEOUT_SEC: u64 = 30;
pub const DEFAULT_ATTEMPT_TIMEOUT_SEC: u64 = 120;
pub const DEFAULT_UNAVAILABLE_COOLDOWN_SEC: u64 = 300;
pub const DEFAULT_HISTORY_DB: &str = "spotiflac_history.db";

const VALID_AUDIO_FORMATS: [&str; 4] = ["LOSSLESS", "6", "7", "27"];

/// Names the config file: an explicit path wins over `SPOTIFLAC_CONFIG`.
pub fn config_path_from_env(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit.or_else(|| std::env::var("SPOTIFLAC_CONFIG").ok().map(PathBuf::from))
}

/// `$HOME/Music`, or `./downloads` when no home directory is known.
pub fn default_download_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home).join("Music"),
        _ => PathBuf::from("./downloads"),
    }
}

/// How downloaded files are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FilenameFormat {
    #[default]
    #[serde(rename = "title-artist")]
    TitleArtist,
    #[serde(rename = "artist-title")]
    ArtistTitle,
    #[serde(rename = "title")]
    Title,
}

impl FilenameFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilenameFormat::TitleArtist => "title-artist",
            FilenameFormat::ArtistTitle => "artist-title",
            FilenameFormat::Title => "title",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "title-artist" => Some(FilenameFormat::TitleArtist),
            "artist-title" => Some(FilenameFormat::ArtistTitle),
            "title" => Some(FilenameFormat::Title),
            _ => None,
        }
    }
}

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub config_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub metrics_port: Option<u16>,
    pub logging_level: Option<RequestsLoggingLevel>,
    pub download_path: Option<PathBuf>,
    pub worker_count: Option<usize>,
    pub history_db: Option<PathBuf>,
}

/// Per-service access and timeout settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    pub api_url: Option<String>,
    pub token: Option<String>,
    pub attempt_timeout: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            api_url: None,
            token: None,
            attempt_timeout: Duration::from_secs(DEFAULT_ATTEMPT_TIMEOUT_SEC),
        }
    }
}

/// Settings read by workers for every item and editable while running.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    pub download_path: PathBuf,
    pub filename_format: FilenameFormat,
    pub audio_format: String,
    pub default_service: ServiceName,
    pub allow_fallback: bool,
    pub fallback_order: Vec<ServiceName>,
    pub resolve_timeout: Duration,
    pub services: BTreeMap<ServiceName, ServiceSettings>,
}

pub type SharedSettings = Arc<RwLock<RuntimeSettings>>;

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            download_path: default_download_path(),
            filename_format: FilenameFormat::default(),
            audio_format: "LOSSLESS".to_string(),
            default_service: ServiceName::Tidal,
            allow_fallback: true,
            fallback_order: ServiceName::ALL.to_vec(),
            resolve_timeout: Duration::from_secs(DEFAULT_RESOLVE_TIMEOUT_SEC),
            services: ServiceName::ALL
                .iter()
                .map(|s| (*s, ServiceSettings::default()))
                .collect(),
        }
    }
}

impl RuntimeSettings {
    pub fn selector_config(&self) -> SelectorConfig {
        SelectorConfig {
            default_service: self.default_service,
            allow_fallback: self.allow_fallback,
            fallback_order: self.fallback_order.clone(),
        }
    }

    pub fn credentials(&self, service: ServiceName) -> ServiceCredentials {
        let settings = self.services.get(&service);
        ServiceCredentials {
            api_url: settings.and_then(|s| s.api_url.clone()),
            token: settings.and_then(|s| s.token.clone()),
            audio_format: self.audio_format.clone(),
        }
    }

    pub fn attempt_timeout(&self, service: ServiceName) -> Duration {
        self.services
            .get(&service)
            .map(|s| s.attempt_timeout)
            .unwrap_or(Duration::from_secs(DEFAULT_ATTEMPT_TIMEOUT_SEC))
    }

    pub fn validate(&self) -> Result<()> {
        validate_download_path(&self.download_path)?;
        validate_audio_format(&self.audio_format)?;
        if self.resolve_timeout.is_zero() {
            bail!("resolve_timeout_sec must be greater than 0");
        }
        for (service, settings) in &self.services {
            if settings.attempt_timeout.is_zero() {
                bail!("attempt_timeout_sec for {} must be greater than 0", service);
            }
        }
        Ok(())
    }

    /// Applies a partial update after validating the result as a whole.
    pub fn apply(&mut self, update: &SettingsUpdate) -> Result<()> {
        let mut next = self.clone();
        if let Some(path) = &update.download_path {
            next.download_path = PathBuf::from(path);
        }
        if let Some(format) = &update.filename_format {
            next.filename_format = match FilenameFormat::from_str(format) {
                Some(f) => f,
                None => bail!("Invalid filename format: {}", format),
            };
        }
        if let Some(format) = &update.audio_format {
            next.audio_format = format.clone();
        }
        if let Some(service) = &update.default_service {
            next.default_service = parse_service(service)?;
        }
        if let Some(allow) = update.allow_fallback {
            next.allow_fallback = allow;
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    /// Copies the runtime-editable values into a file config for saving.
    pub fn write_into(&self, file: &mut FileConfig) {
        let download = file.download.get_or_insert_with(Default::default);
        download.path = Some(self.download_path.to_string_lossy().to_string());
        download.filename_format = Some(self.filename_format.as_str().to_string());
        download.audio_format = Some(self.audio_format.clone());

        let services = file.services.get_or_insert_with(Default::default);
        services.default_service = Some(self.default_service.as_str().to_string());
        services.allow_fallback = Some(self.allow_fallback);
    }
}

/// Partial settings update as sent by clients.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    pub download_path: Option<String>,
    pub filename_format: Option<String>,
    pub audio_format: Option<String>,
    pub default_service: Option<String>,
    pub allow_fallback: Option<bool>,
}

/// Settings as shown to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsView {
    pub download_path: String,
    pub filename_format: String,
    pub audio_format: String,
    pub default_service: ServiceName,
    pub allow_fallback: bool,
    pub fallback_order: Vec<ServiceName>,
}

impl From<&RuntimeSettings> for SettingsView {
    fn from(settings: &RuntimeSettings) -> Self {
        Self {
            download_path: settings.download_path.to_string_lossy().to_string(),
            filename_format: settings.filename_format.as_str().to_string(),
            audio_format: settings.audio_format.clone(),
            default_service: settings.default_service,
            allow_fallback: settings.allow_fallback,
            fallback_order: settings.fallback_order.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// File the configuration was loaded from, used to persist settings changes.
    pub config_path: Option<PathBuf>,
    pub host: String,
    pub port: u16,
    pub metrics_port: u16,
    pub cors_origins: Vec<String>,
    pub logging_level: RequestsLoggingLevel,
    pub worker_count: usize,
    pub event_buffer_capacity: usize,
    pub unavailable_cooldown: Duration,
    pub metadata_api_url: Option<String>,
    pub history_db_path: PathBuf,
    pub runtime: RuntimeSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present, `SPOTIFLAC_*`
    /// environment variables override both.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        Self::resolve_with_env(cli, file_config, |key| std::env::var(key).ok())
    }

    pub fn resolve_with_env(
        cli: &CliConfig,
        file_config: Option<FileConfig>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let file = file_config.unwrap_or_default();
        let server = file.server.unwrap_or_default();
        let download = file.download.unwrap_or_default();
        let services = file.services.unwrap_or_default();
        let database = file.database.unwrap_or_default();

        let mut host = server
            .host
            .or_else(|| cli.host.clone())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let mut port = server.port.or(cli.port).unwrap_or(DEFAULT_PORT);
        let metrics_port = server
            .metrics_port
            .or(cli.metrics_port)
            .unwrap_or(DEFAULT_METRICS_PORT);
        let cors_origins = server.cors_origins.unwrap_or_else(|| {
            vec![
                "http://localhost:5173".to_string(),
                "http://localhost:8080".to_string(),
            ]
        });
        let logging_level = server
            .requests_logging_level
            .and_then(|s| parse_logging_level(&s))
            .or_else(|| cli.logging_level.clone())
            .unwrap_or_default();

        let mut download_path = download
            .path
            .map(PathBuf::from)
            .or_else(|| cli.download_path.clone())
            .unwrap_or_else(default_download_path);
        let filename_format = match download.filename_format {
            Some(f) => match FilenameFormat::from_str(&f) {
                Some(format) => format,
                None => bail!(
                    "Invalid filename format: {} (must be title-artist, artist-title or title)",
                    f
                ),
            },
            None => FilenameFormat::default(),
        };
        let audio_format = download
            .audio_format
            .unwrap_or_else(|| "LOSSLESS".to_string());
        let worker_count = download
            .worker_count
            .or(cli.worker_count)
            .unwrap_or(DEFAULT_WORKER_COUNT);
        let event_buffer_capacity = download
            .event_buffer_capacity
            .unwrap_or(DEFAULT_EVENT_BUFFER_CAPACITY);
        let resolve_timeout = Duration::from_secs(
            download
                .resolve_timeout_sec
                .unwrap_or(DEFAULT_RESOLVE_TIMEOUT_SEC),
        );

        let mut default_service = match services.default_service {
            Some(s) => parse_service(&s)?,
            None => ServiceName::Tidal,
        };
        let allow_fallback = services.allow_fallback.unwrap_or(true);
        let fallback_order = match services.fallback_order {
            Some(order) => parse_fallback_order(&order)?,
            None => ServiceName::ALL.to_vec(),
        };
        let unavailable_cooldown = Duration::from_secs(
            services
                .unavailable_cooldown_sec
                .unwrap_or(DEFAULT_UNAVAILABLE_COOLDOWN_SEC),
        );

        let mut service_settings = BTreeMap::new();
        for (service, section) in [
            (ServiceName::Tidal, services.tidal),
            (ServiceName::Qobuz, services.qobuz),
            (ServiceName::Amazon, services.amazon),
        ] {
            let section = section.unwrap_or_default();
            service_settings.insert(
                service,
                ServiceSettings {
                    api_url: section.api_url,
                    token: section.token,
                    attempt_timeout: Duration::from_secs(
                        section
                            .attempt_timeout_sec
                            .unwrap_or(DEFAULT_ATTEMPT_TIMEOUT_SEC),
                    ),
                },
            );
        }

        let history_db_path = database
            .path
            .map(PathBuf::from)
            .or_else(|| cli.history_db.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_HISTORY_DB));

        // Environment overrides
        if let Some(value) = env("SPOTIFLAC_SERVER_PORT") {
            match value.parse::<u16>() {
                Ok(p) => port = p,
                Err(_) => bail!("Invalid SPOTIFLAC_SERVER_PORT: {}", value),
            }
        }
        if let Some(value) = env("SPOTIFLAC_SERVER_HOST") {
            host = value;
        }
        if let Some(value) = env("SPOTIFLAC_DOWNLOAD_PATH") {
            download_path = PathBuf::from(value);
        }
        if let Some(value) = env("SPOTIFLAC_DEFAULT_SERVICE") {
            default_service = parse_service(&value)?;
        }

        if port < 1024 {
            bail!(
                "Server port must be between 1024-65535 (non-privileged ports), got {}",
                port
            );
        }
        if worker_count == 0 || worker_count > MAX_WORKER_COUNT {
            bail!(
                "worker_count must be between 1 and {}, got {}",
                MAX_WORKER_COUNT,
                worker_count
            );
        }
        if event_buffer_capacity == 0 {
            bail!("event_buffer_capacity must be greater than 0");
        }

        let runtime = RuntimeSettings {
            download_path,
            filename_format,
            audio_format,
            default_service,
            allow_fallback,
            fallback_order,
            resolve_timeout,
            services: service_settings,
        };
        runtime.validate()?;

        Ok(Self {
            config_path: cli.config_path.clone(),
            host,
            port,
            metrics_port,
            cors_origins,
            logging_level,
            worker_count,
            event_buffer_capacity,
            unavailable_cooldown,
            metadata_api_url: services.metadata_api_url,
            history_db_path,
            runtime,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn shared_settings(&self) -> SharedSettings {
        Arc::new(RwLock::new(self.runtime.clone()))
    }
}

fn parse_service(s: &str) -> Result<ServiceName> {
    match ServiceName::from_str(s) {
        Some(service) => Ok(service),
        None => bail!("Invalid service: {} (must be tidal, qobuz, or amazon)", s),
    }
}

fn parse_fallback_order(order: &[String]) -> Result<Vec<ServiceName>> {
    let mut parsed = Vec::with_capacity(order.len());
    for name in order {
        let service = parse_service(name)?;
        if parsed.contains(&service) {
            bail!("Service {} listed twice in fallback_order", service);
        }
        parsed.push(service);
    }
    Ok(parsed)
}

fn validate_download_path(path: &Path) -> Result<()> {
    if path.to_string_lossy().contains("..") {
        bail!("Download path cannot contain '..': {:?}", path);
    }
    Ok(())
}

fn validate_audio_format(format: &str) -> Result<()> {
    if !VALID_AUDIO_FORMATS.contains(&format) {
        bail!(
            "Invalid audio format: {} (must be LOSSLESS, 6, 7, or 27)",
            format
        );
    }
    Ok(())
}

/// Parses a logging level string into RequestsLoggingLevel.
/// Uses clap's ValueEnum trait for parsing.
fn parse_logging_level(s: &str) -> Option<RequestsLoggingLevel> {
    RequestsLoggingLevel::from_str(s, true).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_parse_logging_level() {
        assert!(matches!(
            parse_logging_level("none"),
            Some(RequestsLoggingLevel::None)
        ));
        assert!(matches!(
            parse_logging_level("PATH"),
            Some(RequestsLoggingLevel::Path)
        ));
        assert!(parse_logging_level("invalid").is_none());
    }

    #[test]
    fn test_resolve_defaults() {
        let config = AppConfig::resolve_with_env(&CliConfig::default(), None, no_env).unwrap();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.event_buffer_capacity, 100);
        assert_eq!(config.logging_level, RequestsLoggingLevel::Path);
        assert_eq!(config.runtime.default_service, ServiceName::Tidal);
        assert!(config.runtime.allow_fallback);
        assert_eq!(config.runtime.fallback_order, ServiceName::ALL.to_vec());
        assert_eq!(config.runtime.audio_format, "LOSSLESS");
        assert_eq!(config.runtime.filename_format, FilenameFormat::TitleArtist);
        assert_eq!(
            config.runtime.attempt_timeout(ServiceName::Qobuz),
            Duration::from_secs(DEFAULT_ATTEMPT_TIMEOUT_SEC)
        );
        assert_eq!(config.history_db_path, PathBuf::from(DEFAULT_HISTORY_DB));
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let cli = CliConfig {
            port: Some(3001),
            metrics_port: Some(9100),
            worker_count: Some(4),
            download_path: Some(PathBuf::from("/cli/music")),
            ..Default::default()
        };
        let file_config = FileConfig {
            server: Some(ServerFileConfig {
                port: Some(4000),
                requests_logging_level: Some("body".to_string()),
                ..Default::default()
            }),
            download: Some(DownloadFileConfig {
                path: Some("/toml/music".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = AppConfig::resolve_with_env(&cli, Some(file_config), no_env).unwrap();

        assert_eq!(config.port, 4000);
        assert_eq!(config.logging_level, RequestsLoggingLevel::Body);
        assert_eq!(config.runtime.download_path, PathBuf::from("/toml/music"));
        // CLI value used when TOML doesn't specify
        assert_eq!(config.metrics_port, 9100);
        assert_eq!(config.worker_count, 4);
    }

    #[test]
    fn test_env_overrides_file() {
        let file_config = FileConfig {
            server: Some(ServerFileConfig {
                port: Some(4000),
                ..Default::default()
            }),
            ..Default::default()
        };
        let env: HashMap<&str, &str> = [
            ("SPOTIFLAC_SERVER_PORT", "9000"),
            ("SPOTIFLAC_SERVER_HOST", "127.0.0.1"),
            ("SPOTIFLAC_DOWNLOAD_PATH", "/env/music"),
            ("SPOTIFLAC_DEFAULT_SERVICE", "qobuz"),
        ]
        .into();

        let config = AppConfig::resolve_with_env(&CliConfig::default(), Some(file_config), |k| {
            env.get(k).map(|v| v.to_string())
        })
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.runtime.download_path, PathBuf::from("/env/music"));
        assert_eq!(config.runtime.default_service, ServiceName::Qobuz);
        assert_eq!(config.bind_address(), "127.0.0.1:9000");
    }

    #[test]
    fn test_rejects_privileged_port() {
        let cli = CliConfig {
            port: Some(80),
            ..Default::default()
        };
        let result = AppConfig::resolve_with_env(&cli, None, no_env);
        assert!(result.unwrap_err().to_string().contains("1024-65535"));
    }

    #[test]
    fn test_rejects_path_traversal() {
        let cli = CliConfig {
            download_path: Some(PathBuf::from("/music/../etc")),
            ..Default::default()
        };
        let result = AppConfig::resolve_with_env(&cli, None, no_env);
        assert!(result.unwrap_err().to_string().contains(".."));
    }

    #[test]
    fn test_rejects_invalid_values() {
        let bad_format = FileConfig {
            download: Some(DownloadFileConfig {
                audio_format: Some("MP3".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(AppConfig::resolve_with_env(&CliConfig::default(), Some(bad_format), no_env)
            .unwrap_err()
            .to_string()
            .contains("Invalid audio format"));

        let bad_service = FileConfig {
            services: Some(ServicesFileConfig {
                default_service: Some("deezer".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(
            AppConfig::resolve_with_env(&CliConfig::default(), Some(bad_service), no_env)
                .is_err()
        );

        let duplicate_order = FileConfig {
            services: Some(ServicesFileConfig {
                fallback_order: Some(vec!["tidal".to_string(), "tidal".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(AppConfig::resolve_with_env(
            &CliConfig::default(),
            Some(duplicate_order),
            no_env
        )
        .unwrap_err()
        .to_string()
        .contains("listed twice"));

        let too_many_workers = CliConfig {
            worker_count: Some(64),
            ..Default::default()
        };
        assert!(AppConfig::resolve_with_env(&too_many_workers, None, no_env).is_err());
    }

    #[test]
    fn test_service_sections() {
        let file_config = FileConfig {
            services: Some(ServicesFileConfig {
                qobuz: Some(ServiceFileConfig {
                    api_url: Some("http://qobuz.local".to_string()),
                    token: Some("secret".to_string()),
                    attempt_timeout_sec: Some(15),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config =
            AppConfig::resolve_with_env(&CliConfig::default(), Some(file_config), no_env).unwrap();

        let credentials = config.runtime.credentials(ServiceName::Qobuz);
        assert_eq!(credentials.api_url.as_deref(), Some("http://qobuz.local"));
        assert_eq!(credentials.token.as_deref(), Some("secret"));
        assert_eq!(credentials.audio_format, "LOSSLESS");
        assert_eq!(
            config.runtime.attempt_timeout(ServiceName::Qobuz),
            Duration::from_secs(15)
        );
        assert!(config.runtime.credentials(ServiceName::Tidal).api_url.is_none());
    }

    #[test]
    fn test_apply_settings_update() {
        let mut settings = RuntimeSettings::default();
        let update = SettingsUpdate {
            default_service: Some("amazon".to_string()),
            allow_fallback: Some(false),
            filename_format: Some("artist-title".to_string()),
            ..Default::default()
        };

        settings.apply(&update).unwrap();
        assert_eq!(settings.default_service, ServiceName::Amazon);
        assert!(!settings.allow_fallback);
        assert_eq!(settings.filename_format, FilenameFormat::ArtistTitle);
    }

    #[test]
    fn test_apply_invalid_update_changes_nothing() {
        let mut settings = RuntimeSettings::default();
        let before = settings.clone();
        let update = SettingsUpdate {
            default_service: Some("qobuz".to_string()),
            download_path: Some("../../etc".to_string()),
            ..Default::default()
        };

        assert!(settings.apply(&update).is_err());
        assert_eq!(settings, before);
    }

    #[test]
    fn test_write_into_file_config() {
        let mut settings = RuntimeSettings::default();
        settings.default_service = ServiceName::Qobuz;
        settings.download_path = PathBuf::from("/srv/music");

        let mut file = FileConfig::default();
        settings.write_into(&mut file);

        let services = file.services.unwrap();
        assert_eq!(services.default_service.as_deref(), Some("qobuz"));
        assert_eq!(services.allow_fallback, Some(true));
        assert_eq!(file.download.unwrap().path.as_deref(), Some("/srv/music"));
    }
}
