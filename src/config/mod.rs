//! Namespace configuration loaded from TOML

mod schema;

pub use schema::*;

use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Read and validate a configuration file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration text
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for ns in &config.namespaces {
        if ns.name.trim().is_empty() {
            return Err(ConfigError::Invalid("namespace name must not be empty".into()));
        }
        if !seen.insert(ns.name.as_str()) {
            return Err(ConfigError::Invalid(format!("duplicate namespace '{}'", ns.name)));
        }
        if let Some(breaker) = &ns.breaker {
            if breaker.strategy.size == 0 || breaker.strategy.cell_interval_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "namespace '{}': breaker window needs at least one non-empty cell",
                    ns.name
                )));
            }
        }
    }
    Ok(())
}
