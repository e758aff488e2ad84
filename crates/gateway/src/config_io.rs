// SPDX-License-Identifier: Apache-2.0

//! Main configuration loading (`tb_gateway.json`).
//!
//! JSON is the supported format. A legacy YAML file is accepted once: it is
//! parsed with a deprecation warning and rewritten as JSON next to it.

use std::path::{Path, PathBuf};
use tbgw_core::GeneralConfig;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Load the main configuration and apply environment overrides.
pub fn load_general_config(path: &Path) -> Result<GeneralConfig, ConfigError> {
    let mut config = read_config(path)?;
    config.apply_env_overrides();
    Ok(config)
}

fn read_config(path: &Path) -> Result<GeneralConfig, ConfigError> {
    if path.extension().is_some_and(|ext| ext == "json") && path.exists() {
        let raw = std::fs::read_to_string(path)?;
        return Ok(serde_json::from_str(&raw)?);
    }

    // Fall back to the YAML sibling (or a YAML path given directly).
    let yaml_path = if path.extension().is_some_and(|ext| ext == "yaml" || ext == "yml") {
        path.to_path_buf()
    } else {
        path.with_extension("yaml")
    };
    if !yaml_path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    warn!("YAML configuration is deprecated, please use JSON configuration instead");
    let raw = std::fs::read_to_string(&yaml_path)?;
    let config: GeneralConfig = serde_yaml::from_str(&raw)?;

    // Rewrite as JSON so the next start takes the supported path.
    let json_path = yaml_path.with_extension("json");
    match serde_json::to_string_pretty(&config) {
        Ok(json) => {
            if let Err(e) = std::fs::write(&json_path, json) {
                error!("cannot rewrite configuration as JSON: {e}");
            }
        }
        Err(e) => error!("cannot serialize configuration as JSON: {e}"),
    }
    Ok(config)
}
