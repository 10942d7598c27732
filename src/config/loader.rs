//! Configuration loading.
//!
//! The effective configuration is layered: built-in defaults, then an
//! optional TOML file, then command-line overrides. Validation runs once,
//! on the final result.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::schema::AdmissionConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML in {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Values given on the command line, applied over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
}

impl Overrides {
    fn apply(self, config: &mut AdmissionConfig) {
        if let Some(host) = self.host {
            config.listener.host = host;
        }
        if let Some(port) = self.port {
            config.listener.port = port;
        }
        if let Some(level) = self.log_level {
            config.observability.log_level = level;
        }
    }
}

/// Parse TOML text without validating it. `origin` names the text in errors.
fn parse_unchecked(content: &str, origin: &str) -> Result<AdmissionConfig, ConfigError> {
    toml::from_str(content).map_err(|source| ConfigError::Parse {
        origin: origin.to_string(),
        source,
    })
}

fn read_unchecked(path: &Path) -> Result<AdmissionConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_unchecked(&content, &path.display().to_string())
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<AdmissionConfig, ConfigError> {
    let config = parse_unchecked(content, "<inline>")?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<AdmissionConfig, ConfigError> {
    resolve_config(Some(path), Overrides::default())
}

/// Build the effective configuration: defaults, then `path` if given, then
/// `overrides`, validated as a whole.
pub fn resolve_config(
    path: Option<&Path>,
    overrides: Overrides,
) -> Result<AdmissionConfig, ConfigError> {
    let mut config = match path {
        Some(path) => read_unchecked(path)?,
        None => AdmissionConfig::default(),
    };
    overrides.apply(&mut config);
    validate_config(&config).map_err(ConfigError::Validation)?;

    tracing::debug!(
        source = %path.map_or_else(|| "defaults".to_string(), |p| p.display().to_string()),
        "Configuration resolved"
    );
    Ok(config)
}
