//! TOML configuration file parsing

use super::cli::{Cli, ExecutionMode};
use super::{BenchConfig, ClientMode, ConfirmationConfig};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<BenchConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<BenchConfig> {
    let config: BenchConfig = ::toml::from_str(contents).context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: BenchConfig) -> BenchConfig {
    if cli.mode == ExecutionMode::Coordinator {
        config.clients.mode = ClientMode::Distributed;
    }
    if let Some(ref store) = cli.store {
        config.clients.store = Some(store.clone());
    }
    if let Some(ref root) = cli.root {
        config.clients.root = root.clone();
    }
    if let Some(clients) = cli.clients {
        config.clients.number = clients;
    }
    if let Some(pause) = cli.pause {
        config.test.pause_secs = pause;
    }
    if let Some(ref path) = cli.json_output {
        config.output.json = Some(path.clone());
    }
    if let Some(ref listen) = cli.confirmation_listen {
        match config.clients.confirmation.as_mut() {
            Some(confirmation) => confirmation.listen = listen.clone(),
            None => {
                config.clients.confirmation = Some(ConfirmationConfig {
                    listen: listen.clone(),
                    retry_interval_secs: 5,
                    max_wait_secs: None,
                })
            }
        }
    }

    config
}
