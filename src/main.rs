use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use spotiflac_server::app::{build_download_manager, open_history};
use spotiflac_server::config::{config_path_from_env, AppConfig, CliConfig, FileConfig};
use spotiflac_server::download_manager::HistoryRecorder;
use spotiflac_server::server::{metrics, run_server, ServerConfig, ServerState};
use spotiflac_server::RequestsLoggingLevel;

/// How long in-flight requests get to finish after Ctrl+C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(version, about = "Download queue server with service fallback")]
struct CliArgs {
    /// Path to a TOML config file. Falls back to SPOTIFLAC_CONFIG.
    #[clap(short, long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// The address to bind to.
    #[clap(long)]
    pub host: Option<String>,

    /// The port to listen on.
    #[clap(short, long)]
    pub port: Option<u16>,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long)]
    pub metrics_port: Option<u16>,

    /// The level of logging to perform on each request.
    #[clap(long)]
    pub logging_level: Option<RequestsLoggingLevel>,

    /// Directory downloaded files are written to.
    #[clap(long, value_parser = parse_path)]
    pub download_path: Option<PathBuf>,

    /// Number of concurrent download workers.
    #[clap(long)]
    pub worker_count: Option<usize>,

    /// Path to the SQLite download history database.
    #[clap(long, value_parser = parse_path)]
    pub history_db: Option<PathBuf>,
}

impl CliArgs {
    fn to_cli_config(&self, config_path: Option<PathBuf>) -> CliConfig {
        CliConfig {
            config_path,
            host: self.host.clone(),
            port: self.port,
            metrics_port: self.metrics_port,
            logging_level: self.logging_level.clone(),
            download_path: self.download_path.clone(),
            worker_count: self.worker_count,
            history_db: self.history_db.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let config_path = config_path_from_env(cli_args.config.clone());
    let file_config = match &config_path {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let app_config = AppConfig::resolve(&cli_args.to_cli_config(config_path), file_config)?;

    info!("Initializing metrics...");
    metrics::init_metrics();

    let history = open_history(&app_config)?;
    let settings = app_config.shared_settings();
    let manager = Arc::new(build_download_manager(
        &app_config,
        settings,
        history.clone() as Arc<dyn HistoryRecorder>,
    )?);

    info!(
        "Starting {} download worker(s), downloads go to {:?}",
        app_config.worker_count, app_config.runtime.download_path
    );
    manager.start();

    let state = ServerState::new(
        ServerConfig::from(&app_config),
        manager.clone(),
        Some(history),
        app_config.config_path.clone(),
    );

    let shutdown_token = CancellationToken::new();
    let mut server = tokio::spawn(run_server(state, shutdown_token.clone().cancelled_owned()));

    let result = tokio::select! {
        result = &mut server => {
            info!("HTTP server stopped");
            result.context("HTTP server task panicked")?
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown");
            shutdown_token.cancel();
            Ok(())
        }
    };

    manager.shutdown().await;

    if shutdown_token.is_cancelled() {
        match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
            Ok(Ok(Err(e))) => error!("HTTP server error during shutdown: {:#}", e),
            Ok(_) => {}
            Err(_) => warn!("HTTP server did not stop within {:?}", SHUTDOWN_GRACE),
        }
    }

    result
}
