pub mod emit;
pub mod materialize;

use anyhow::{Context, Result};
use csv_relay_core::{shutdown_signal, Config, ShutdownCoordinator, ShutdownReason};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

/// Load the YAML config at `path`, or the defaults when none is given.
pub async fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Config::load(path)
                .await
                .with_context(|| format!("Failed to load {}", path.display()))
        }
        None => Ok(Config::default()),
    }
}

/// Apply flags shared by both subcommands.
pub fn apply_common(config: &mut Config, bootstrap_servers: Vec<String>, topic: Option<String>) {
    if !bootstrap_servers.is_empty() {
        config.kafka.bootstrap_servers = bootstrap_servers;
    }
    if let Some(topic) = topic {
        config.topic = topic;
    }
}

/// Trigger a signal shutdown on SIGINT or SIGTERM.
pub fn watch_signals(coordinator: Arc<ShutdownCoordinator>) {
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(name) => coordinator.trigger(ShutdownReason::Signal(name.to_string())),
            Err(e) => error!("Failed to install signal handlers: {}", e),
        }
    });
}
