use crate::config::{EngineConfig, LogSink};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// On-disk shape of the YAML config file. Every key is optional; missing keys
/// fall back to [`EngineConfig::default`].
#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StaticConfig {
    #[serde(default)]
    chunk_size_bytes: Option<u64>,
    #[serde(default)]
    chunk_size_mb: Option<u64>,
    #[serde(default)]
    max_parallel: Option<usize>,
    #[serde(default)]
    compression_level: Option<i32>,
    #[serde(default)]
    log_sink: Option<LogSink>,
    #[serde(default)]
    large_subtree: Option<PathBuf>,
}

/// Loads a YAML config file into an [`EngineConfig`] and validates it.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<EngineConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => {
            info!(config_path = ?path_ref, "Config file read successfully");
            content
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!("Failed to read config file {:?}: {}", path_ref, e));
        }
    };

    let config = parse_config(&config_content)
        .with_context(|| format!("Invalid config file {}", path_ref.display()))?;
    Ok(config)
}

/// Parses YAML text into a validated [`EngineConfig`].
pub fn parse_config(content: &str) -> Result<EngineConfig> {
    let static_conf: StaticConfig = if content.trim().is_empty() {
        StaticConfig::default()
    } else {
        match serde_yaml::from_str(content) {
            Ok(conf) => conf,
            Err(e) => {
                error!(error = ?e, "Failed to parse config YAML");
                return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
            }
        }
    };

    if static_conf.chunk_size_bytes.is_some() && static_conf.chunk_size_mb.is_some() {
        anyhow::bail!("Set either chunk_size_bytes or chunk_size_mb, not both");
    }

    let defaults = EngineConfig::default();
    let chunk_size_bytes = match (static_conf.chunk_size_bytes, static_conf.chunk_size_mb) {
        (Some(bytes), _) => bytes,
        (None, Some(mb)) => mb
            .checked_mul(crate::config::MIB)
            .ok_or_else(|| anyhow::anyhow!("chunk_size_mb {mb} overflows"))?,
        (None, None) => defaults.chunk_size_bytes,
    };

    let config = EngineConfig {
        chunk_size_bytes,
        max_parallel: static_conf.max_parallel.unwrap_or(defaults.max_parallel),
        compression_level: static_conf
            .compression_level
            .unwrap_or(defaults.compression_level),
        log_sink: static_conf.log_sink.unwrap_or(defaults.log_sink),
        large_subtree: static_conf.large_subtree.unwrap_or(defaults.large_subtree),
    };

    if let Err(e) = config.validate() {
        error!(error = %e, "Config failed validation");
        return Err(e.into());
    }

    info!(
        chunk_size_bytes = config.chunk_size_bytes,
        max_parallel = config.max_parallel,
        "Config parsed and validated successfully"
    );
    Ok(config)
}
