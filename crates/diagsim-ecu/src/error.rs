//! Error types for the ECU runtime and configuration loading

use diagsim_core::SimError;
use thiserror::Error;

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading a simulator configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML syntax or schema error
    #[error("Invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    /// YAML syntax or schema error
    #[error("Invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Well-formed config with an unusable value
    #[error("Invalid config value: {0}")]
    Invalid(String),

    /// Building the simulated entities failed
    #[error(transparent)]
    Sim(#[from] SimError),
}
