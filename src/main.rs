// src/main.rs

//! The main entry point for the opalcache middleware binary.

use anyhow::Result;
use opalcache::config::Config;
use opalcache::server;
use std::env;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("opalcache version {VERSION}");
        return Ok(());
    }

    // The configuration path can be provided via a --config flag; otherwise
    // it defaults to "config.json".
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.json");

    let mut config = match Config::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
            std::process::exit(1);
        }
    };

    // Override the listen port if provided as a command-line argument.
    if let Some(port_index) = args.iter().position(|arg| arg == "--port") {
        match args.get(port_index + 1).map(|s| s.parse::<u16>()) {
            Some(Ok(port)) => config.port = port,
            Some(Err(_)) | None => {
                eprintln!("--port flag requires a valid port number");
                std::process::exit(1);
            }
        }
    }

    // RUST_LOG wins over the configured level, as usual.
    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    if let Err(e) = server::run(config).await {
        error!("Server runtime error: {e:#}");
        return Err(e);
    }
    Ok(())
}
