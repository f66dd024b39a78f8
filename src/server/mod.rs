pub mod config;
mod download_routes;
mod history_routes;
mod http_layers;
mod metadata_routes;
pub mod metrics;
pub mod server;
mod settings_routes;
pub mod state;
pub mod websocket;

pub use config::ServerConfig;
pub use http_layers::*;
pub use server::{make_app, run_server};
pub use state::ServerState;
