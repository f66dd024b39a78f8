use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use spotiflac_server::app::{build_download_manager, open_history};
use spotiflac_server::config::{
    assign_key, config_path_from_env, lookup_key, AppConfig, CliConfig, DatabaseFileConfig,
    DownloadFileConfig, FileConfig, ServerFileConfig, ServiceFileConfig, ServicesFileConfig,
};
use spotiflac_server::download_manager::{
    CancelOutcome, DownloadManager, HistoryRecorder, ItemState, ProgressEvent, QueueItem, ServiceName,
};
use spotiflac_server::metadata::{ReferenceKind, SourceReference};

mod cli_style;
use cli_style::*;

/// How often the queue is re-read in case progress events were dropped.
const RECONCILE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(
    name = "spotiflac-cli",
    version,
    about = "Download tracks and manage the download server configuration",
    styles = get_styles()
)]
struct Cli {
    /// Path to a TOML config file. Falls back to SPOTIFLAC_CONFIG.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON instead of styled output.
    #[arg(short, long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download a track, album or playlist into the configured directory.
    Download {
        #[command(subcommand)]
        target: DownloadTarget,
    },
    /// Inspect or edit the configuration file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum DownloadTarget {
    /// A single track URL, URI or id.
    Track { url: String },
    /// Every track of an album.
    Album { url: String },
    /// Every track of a playlist.
    Playlist { url: String },
}

impl DownloadTarget {
    fn parts(&self) -> (ReferenceKind, &str) {
        match self {
            DownloadTarget::Track { url } => (ReferenceKind::Track, url.as_str()),
            DownloadTarget::Album { url } => (ReferenceKind::Album, url.as_str()),
            DownloadTarget::Playlist { url } => (ReferenceKind::Playlist, url.as_str()),
        }
    }
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the resolved configuration.
    Show,
    /// Print one value, e.g. `services.default_service`.
    Get { key: String },
    /// Set one value in the config file and validate the result.
    Set { key: String, value: String },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Download
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
struct ItemSummary {
    item_id: String,
    source_reference: String,
    state: ItemState,
    title: Option<String>,
    artists: Option<String>,
    service_used: Option<ServiceName>,
    result_path: Option<String>,
    error_message: Option<String>,
}

impl From<&QueueItem> for ItemSummary {
    fn from(item: &QueueItem) -> Self {
        Self {
            item_id: item.id.clone(),
            source_reference: item.source_reference.clone(),
            state: item.state,
            title: item.descriptor.as_ref().map(|d| d.title.clone()),
            artists: item.descriptor.as_ref().map(|d| d.artists_display()),
            service_used: item.service_used(),
            result_path: item
                .result_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
            error_message: item.error_message.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DownloadSummary {
    source_reference: String,
    completed: usize,
    failed: usize,
    cancelled: usize,
    items: Vec<ItemSummary>,
}

fn update_bar(bar: &ProgressBar, item: &QueueItem) {
    if bar.is_finished() {
        return;
    }
    bar.set_position((item.progress_fraction * 100.0).round() as u64);
    let label = item
        .descriptor
        .as_ref()
        .map(|d| truncate(&format!("{} - {}", d.artists_display(), d.title), 48))
        .unwrap_or_else(|| item.source_reference.clone());

    match item.state {
        ItemState::Completed => {
            bar.set_position(100);
            bar.finish_with_message(format!("{} ✓", label));
        }
        ItemState::Failed => bar.abandon_with_message(format!(
            "{} ✗ {}",
            label,
            item.error_message.as_deref().unwrap_or("failed")
        )),
        ItemState::Cancelled => bar.abandon_with_message(format!("{} (cancelled)", label)),
        state => bar.set_message(format!("{} [{}]", label, state)),
    }
}

async fn run_download(config: AppConfig, target: DownloadTarget, json: bool) -> Result<ExitCode> {
    let (kind, url) = target.parts();
    let reference = SourceReference::parse(url)?;
    if reference.kind() != kind {
        bail!("{} is a {}, not a {}", url, reference.kind(), kind);
    }

    let history = open_history(&config)?;
    let manager = build_download_manager(
        &config,
        config.shared_settings(),
        history as Arc<dyn HistoryRecorder>,
    )?;
    let mut subscription = manager.subscribe();
    manager.start();

    let item_ids: Vec<String> = if reference.is_collection() {
        manager
            .enqueue_collection(url)
            .await?
            .items
            .into_iter()
            .map(|i| i.item_id)
            .collect()
    } else {
        vec![manager.enqueue(url)?.item_id]
    };
    info!("Downloading {} track(s) from {}", item_ids.len(), reference);

    let progress = MultiProgress::new();
    if json {
        progress.set_draw_target(ProgressDrawTarget::hidden());
    }
    let bars: HashMap<String, ProgressBar> = item_ids
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let bar = progress.add(ProgressBar::new(100));
            bar.set_style(item_progress_style());
            bar.set_prefix(format!("{:>3}", i + 1));
            bar.enable_steady_tick(Duration::from_millis(120));
            (id.clone(), bar)
        })
        .collect();

    let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut listening = true;
    let mut interrupted = false;
    loop {
        let mut reconcile = false;
        tokio::select! {
            event = subscription.recv() => match event {
                Some(ProgressEvent::Item { item_id, state, progress_fraction, .. }) => {
                    if let Some(bar) = bars.get(&item_id) {
                        if !bar.is_finished() {
                            bar.set_position((progress_fraction * 100.0).round() as u64);
                        }
                    }
                    reconcile = state.is_terminal() || state == ItemState::Resolving;
                }
                Some(ProgressEvent::QueueChanged { .. }) => {}
                None => break,
            },
            _ = ticker.tick() => reconcile = true,
            signal = &mut ctrl_c, if listening => {
                if let Err(e) = signal {
                    warn!("Cannot listen for Ctrl-C: {}", e);
                    listening = false;
                } else if interrupted {
                    print_warning("Interrupted again, stopping now");
                    break;
                } else {
                    interrupted = true;
                    print_warning("Interrupted, cancelling downloads...");
                    cancel_items(&manager, &item_ids);
                    ctrl_c.set(tokio::signal::ctrl_c());
                }
            }
        }

        if reconcile {
            let snapshot = manager.get_queue();
            let mut all_done = true;
            for id in &item_ids {
                if let Some(item) = snapshot.get(id) {
                    if let Some(bar) = bars.get(id) {
                        update_bar(bar, item);
                    }
                    all_done &= item.state.is_terminal();
                }
            }
            if all_done {
                break;
            }
        }
    }

    let snapshot = manager.get_queue();
    manager.shutdown().await;

    let items: Vec<ItemSummary> = item_ids
        .iter()
        .filter_map(|id| snapshot.get(id))
        .map(ItemSummary::from)
        .collect();
    let count = |state: ItemState| items.iter().filter(|i| i.state == state).count();
    let summary = DownloadSummary {
        source_reference: reference.canonical(),
        completed: count(ItemState::Completed),
        failed: count(ItemState::Failed),
        cancelled: count(ItemState::Cancelled),
        items,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_download_summary(&summary);
    }

    Ok(if summary.failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn print_download_summary(summary: &DownloadSummary) {
    print_section_header("Download summary");
    let mut table = TableBuilder::new(vec!["State", "Track", "Service", "Details"]);
    for item in &summary.items {
        let track = match (&item.artists, &item.title) {
            (Some(artists), Some(title)) => truncate(&format!("{} - {}", artists, title), 40),
            _ => item.source_reference.clone(),
        };
        let details = item
            .result_path
            .clone()
            .or_else(|| item.error_message.clone())
            .unwrap_or_default();
        table.add_row(vec![
            item.state.as_str().to_string(),
            track,
            item.service_used
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| "-".to_string()),
            truncate(&details, 60),
        ]);
    }
    table.print();

    let totals = format!(
        "{} completed, {} failed, {} cancelled",
        summary.completed, summary.failed, summary.cancelled
    );
    if summary.failed > 0 {
        print_error(&totals);
    } else {
        print_success(&totals);
    }
}

/// Cancels every item, returning how many were cancelled or asked to stop.
fn cancel_items(manager: &DownloadManager, item_ids: &[String]) -> usize {
    item_ids
        .iter()
        .filter(|id| match manager.cancel_item(id) {
            Ok(outcome) => {
                debug!("Cancel {}: {}", id, outcome.label());
                !matches!(outcome, CancelOutcome::AlreadyTerminal(_))
            }
            Err(e) => {
                debug!("Cannot cancel {}: {}", id, e);
                false
            }
        })
        .count()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Config
// ═══════════════════════════════════════════════════════════════════════════════

fn service_section(config: &AppConfig, service: ServiceName) -> Option<ServiceFileConfig> {
    let settings = config.runtime.services.get(&service)?;
    Some(ServiceFileConfig {
        api_url: settings.api_url.clone(),
        token: settings.token.as_ref().map(|_| "********".to_string()),
        attempt_timeout_sec: Some(settings.attempt_timeout.as_secs()),
    })
}

/// The resolved configuration expressed as a config file, secrets masked.
fn effective_file_config(config: &AppConfig) -> FileConfig {
    let mut file = FileConfig {
        server: Some(ServerFileConfig {
            host: Some(config.host.clone()),
            port: Some(config.port),
            metrics_port: Some(config.metrics_port),
            cors_origins: Some(config.cors_origins.clone()),
            requests_logging_level: Some(config.logging_level.to_string().to_lowercase()),
        }),
        download: Some(DownloadFileConfig {
            worker_count: Some(config.worker_count),
            event_buffer_capacity: Some(config.event_buffer_capacity),
            resolve_timeout_sec: Some(config.runtime.resolve_timeout.as_secs()),
            ..Default::default()
        }),
        services: Some(ServicesFileConfig {
            fallback_order: Some(
                config
                    .runtime
                    .fallback_order
                    .iter()
                    .map(|s| s.as_str().to_string())
                    .collect(),
            ),
            unavailable_cooldown_sec: Some(config.unavailable_cooldown.as_secs()),
            metadata_api_url: config.metadata_api_url.clone(),
            tidal: service_section(config, ServiceName::Tidal),
            qobuz: service_section(config, ServiceName::Qobuz),
            amazon: service_section(config, ServiceName::Amazon),
            ..Default::default()
        }),
        database: Some(DatabaseFileConfig {
            path: Some(config.history_db_path.to_string_lossy().to_string()),
        }),
    };
    config.runtime.write_into(&mut file);
    file
}

fn print_value(value: &toml::Value) {
    match value {
        toml::Value::String(s) => println!("{}", s),
        other => println!("{}", other),
    }
}

fn run_config_show(config: &AppConfig, json: bool) -> Result<()> {
    let file = effective_file_config(config);
    if json {
        println!("{}", serde_json::to_string_pretty(&file)?);
        return Ok(());
    }

    print_section_header("Configuration");
    print_key_value(
        "Config file",
        &config
            .config_path
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| "(none)".to_string()),
    );
    println!();
    print!("{}", toml::to_string_pretty(&file).context("Failed to render config")?);
    Ok(())
}

fn run_config_get(config: &AppConfig, key: &str, json: bool) -> Result<()> {
    let document = toml::Value::try_from(effective_file_config(config))
        .context("Failed to render config")?;
    let value = match lookup_key(&document, key) {
        Some(v) => v,
        None => bail!("Unknown or unset config key: {}", key),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        print_value(value);
    }
    Ok(())
}

/// Edits `key` in the file at `path`, refusing values that would not load.
fn set_config_value(path: &Path, key: &str, raw: &str) -> Result<()> {
    let mut table: toml::Table = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?
    } else {
        toml::Table::new()
    };
    assign_key(&mut table, key, raw)?;

    let file: FileConfig = toml::Value::Table(table.clone())
        .try_into()
        .with_context(|| format!("Invalid value for {}: {}", key, raw))?;
    let known = toml::Value::try_from(&file).context("Failed to render config")?;
    if lookup_key(&known, key).is_none() {
        bail!("Unknown config key: {}", key);
    }
    let cli = CliConfig {
        config_path: Some(path.to_path_buf()),
        ..Default::default()
    };
    AppConfig::resolve(&cli, Some(file))?;

    let content = toml::to_string_pretty(&table).context("Failed to serialize config")?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }
    }
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config file: {:?}", path))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Entry point
// ═══════════════════════════════════════════════════════════════════════════════

fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig> {
    let file_config = match &config_path {
        Some(path) if path.exists() => Some(FileConfig::load(path)?),
        Some(path) => bail!("Config file not found: {:?}", path),
        None => None,
    };
    let cli = CliConfig {
        config_path,
        ..Default::default()
    };
    AppConfig::resolve(&cli, file_config)
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = config_path_from_env(cli.config);

    match cli.command {
        Command::Download { target } => run_download(load_config(config_path)?, target, cli.json).await,
        Command::Config { action } => {
            match action {
                ConfigAction::Show => run_config_show(&load_config(config_path)?, cli.json)?,
                ConfigAction::Get { key } => {
                    run_config_get(&load_config(config_path)?, &key, cli.json)?
                }
                ConfigAction::Set { key, value } => {
                    let path = config_path
                        .context("No config file: pass --config or set SPOTIFLAC_CONFIG")?;
                    set_config_value(&path, &key, &value)?;
                    if !cli.json {
                        print_success(&format!("Set {} = {} in {:?}", key, value, path));
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            print_error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}
