use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(default)]
pub struct FileConfig {
    pub server: Option<ServerFileConfig>,
    pub download: Option<DownloadFileConfig>,
    pub services: Option<ServicesFileConfig>,
    pub database: Option<DatabaseFileConfig>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(default)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub metrics_port: Option<u16>,
    pub cors_origins: Option<Vec<String>>,
    pub requests_logging_level: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(default)]
pub struct DownloadFileConfig {
    pub path: Option<String>,
    /// One of "title-artist", "artist-title", "title".
    pub filename_format: Option<String>,
    /// "LOSSLESS" or a numeric quality tier ("6", "7", "27").
    pub audio_format: Option<String>,
    pub worker_count: Option<usize>,
    pub event_buffer_capacity: Option<usize>,
    pub resolve_timeout_sec: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(default)]
pub struct ServicesFileConfig {
    pub default_service: Option<String>,
    pub allow_fallback: Option<bool>,
    pub fallback_order: Option<Vec<String>>,
    pub unavailable_cooldown_sec: Option<u64>,
    pub metadata_api_url: Option<String>,
    pub tidal: Option<ServiceFileConfig>,
    pub qobuz: Option<ServiceFileConfig>,
    pub amazon: Option<ServiceFileConfig>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(default)]
pub struct ServiceFileConfig {
    pub api_url: Option<String>,
    pub token: Option<String>,
    pub attempt_timeout_sec: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(default)]
pub struct DatabaseFileConfig {
    pub path: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))
    }
}

/// Looks up a dotted key such as `services.default_service` in a TOML document.
pub fn lookup_key<'a>(document: &'a toml::Value, key: &str) -> Option<&'a toml::Value> {
    key.split('.')
        .try_fold(document, |value, part| value.as_table()?.get(part))
}

/// Sets a dotted key in a TOML document, creating intermediate tables.
///
/// The raw value is parsed as a boolean, an integer, a comma separated list
/// (when it contains a comma) or kept as a string.
pub fn assign_key(document: &mut toml::Table, key: &str, raw: &str) -> Result<()> {
    let parts: Vec<&str> = key.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        bail!("Invalid config key: {:?}", key);
    }

    let (last, parents) = parts.split_last().context("Empty config key")?;
    let mut table = document;
    for part in parents {
        let entry = table
            .entry(part.to_string())
            .or_insert(toml::Value::Table(toml::Table::new()));
        table = match entry {
            toml::Value::Table(t) => t,
            _ => bail!("Config key {:?} is not a table", part),
        };
    }
    table.insert(last.to_string(), parse_raw_value(raw));
    Ok(())
}

fn parse_raw_value(raw: &str) -> toml::Value {
    let raw = raw.trim();
    if let Ok(b) = raw.parse::<bool>() {
        return toml::Value::Boolean(b);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return toml::Value::Integer(i);
    }
    if raw.contains(',') {
        return toml::Value::Array(
            raw.split(',')
                .map(|s| toml::Value::String(s.trim().to_string()))
                .collect(),
        );
    }
    toml::Value::String(raw.to_string())
}
