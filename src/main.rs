use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{Level, info};

use wstunnel::{EventSink, FilterFactory, create_endpoint, load_config};

const DEFAULT_CONFIG_FILE: &str = "wstunnel.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let config_file = std::env::args_os()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from);
    let config = load_config(&config_file)?;

    let level = config
        .log_level
        .as_deref()
        .unwrap_or("info")
        .parse::<Level>()
        .context("Invalid log_level")?;
    tracing_subscriber::fmt().with_max_level(level).init();

    info!(
        config_file = %config_file.display(),
        endpoint = ?config.endpoint,
        "Configuration loaded"
    );

    let endpoint = create_endpoint(&config, &FilterFactory::with_builtins(), EventSink::none()).await?;
    endpoint.start().await?;
    info!(addresses = ?endpoint.address_list(), "Tunnel endpoint running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    endpoint.stop().await;
    Ok(())
}
