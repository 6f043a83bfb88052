mod accounts;
mod api;
mod config;
mod db;
mod identity;
mod lifecycle;
mod registry;

use std::path::PathBuf;
use std::process::ExitCode;
use anyhow::{Context, Result};
use crate::config::Config;
use crate::lifecycle::Lifecycle;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("registerd: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<bool> {
    // Load config; the path is optional, defaults and environment cover the rest
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref()).context("Failed to load configuration")?;

    // Initialize tracing
    let default_filter = if config.api.debug {
        "registerd=debug,tower_http=debug"
    } else {
        "registerd=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match &config_path {
        Some(path) => tracing::info!("Loaded config from {}", path.display()),
        None => tracing::info!("No config file given, using defaults and environment"),
    }

    let descriptor = identity::describe(&config.service);
    tracing::info!(
        id = %descriptor.uuid,
        "Starting {} v{}",
        descriptor.name,
        descriptor.version
    );

    let report = Lifecycle::new(config, descriptor).run().await?;

    if !report.deregistered {
        tracing::error!("Service record may still be present in the directory");
    }
    Ok(report.deregistered)
}
