//! `tollgate config`: CLI settings in `~/.tollgate/config.toml`.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Save the API server URL
    SetUrl {
        /// e.g. http://localhost:8080
        url: String,
    },

    /// Show the saved configuration
    Show,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
}

fn config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".tollgate").join("config.toml"))
}

fn read_config(path: &Path) -> Result<CliConfig> {
    if !path.exists() {
        return Ok(CliConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn write_config(path: &Path, cfg: &CliConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(cfg).context("Failed to serialize config")?;
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// Saved `api_url`, if any. Unreadable config is treated as unset.
pub fn load_api_url() -> Option<String> {
    config_path()
        .and_then(|path| read_config(&path))
        .ok()
        .and_then(|cfg| cfg.api_url)
}

pub fn execute(cmd: ConfigCommands, format: OutputFormat) -> Result<()> {
    let path = config_path()?;

    match cmd {
        ConfigCommands::SetUrl { url } => {
            let mut cfg = read_config(&path)?;
            cfg.api_url = Some(url.trim_end_matches('/').to_string());
            write_config(&path, &cfg)?;

            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("api_url saved to {}", path.display()));
                    Ok(())
                }
                _ => output::print_item(&cfg, format),
            }
        }

        ConfigCommands::Show => {
            let cfg = read_config(&path)?;
            match (format, &cfg.api_url) {
                (OutputFormat::Table, None) => {
                    output::print_info("No configuration values set.");
                    Ok(())
                }
                (OutputFormat::Table, Some(url)) => {
                    output::print_header("Configuration");
                    output::print_detail("api_url", url);
                    Ok(())
                }
                _ => output::print_item(&cfg, format),
            }
        }
    }
}
