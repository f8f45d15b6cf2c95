#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::missing_errors_doc)]

mod api;
mod error;
mod model;
mod processing;
mod repository;
mod utils;

use clap::Parser;
use log::{error, info};
use std::sync::Arc;

use crate::api::app_state::AppState;
use crate::utils::init_logger;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_PORT: u16 = 3333;

#[derive(Parser)]
#[command(name = "epg-viewer")]
#[command(version)]
#[command(about = "XMLTV EPG filter and export service for IPTV playlists", long_about = None)]
struct Args {
    /// The data directory for settings, mirrors and caches
    #[arg(short = 'd', long = "data-path", default_value = "./data")]
    data_path: String,

    /// The port to listen on, overrides the PORT environment variable
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// The host address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// log level
    #[arg(short = 'l', long = "log-level", default_missing_value = "info")]
    log_level: Option<String>,

    #[arg(long, default_value_t = false, default_missing_value = "true")]
    healthcheck: bool,
}

fn resolve_port(args_port: Option<u16>) -> u16 {
    args_port
        .or_else(|| std::env::var("PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(DEFAULT_PORT)
}

async fn healthcheck(port: u16) -> bool {
    match reqwest::Client::new()
        .get(format!("http://localhost:{port}/healthcheck"))
        .send()
        .await
    {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    init_logger(args.log_level.as_ref());

    let port = resolve_port(args.port);

    if args.healthcheck {
        let healthy = healthcheck(port).await;
        std::process::exit(i32::from(!healthy));
    }

    info!("Version: {VERSION}");
    info!("Current time: {}", chrono::offset::Local::now().format("%Y-%m-%d %H:%M:%S"));

    let data_dir = crate::utils::resolve_directory_path(&args.data_path);
    info!("Data dir: {}", data_dir.display());

    let app_state = match AppState::create(data_dir).await {
        Ok(state) => Arc::new(state),
        Err(err) => {
            error!("Failed to initialize: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = api::main_api::start_server(app_state, &args.host, port).await {
        error!("Can't start server: {err}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::resolve_port;

    #[test]
    fn test_resolve_port_prefers_argument() {
        assert_eq!(resolve_port(Some(8080)), 8080);
    }
}
