use thiserror::Error;

/// Top-level error type for the Topograph platform.
#[derive(Error, Debug)]
pub enum TopographError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),
}
