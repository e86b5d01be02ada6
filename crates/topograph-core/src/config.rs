//! Configuration loading for Topograph services.
//!
//! Configuration is loaded from (in priority order):
//! 1. Environment variables (TOPOGRAPH__ prefix, `__` separated)
//! 2. Config file (topograph.toml, or the given prefix)
//! 3. Defaults supplied by the section type

use serde::de::DeserializeOwned;

use crate::error::TopographError;

/// Environment variable prefix for all Topograph settings.
pub const ENV_PREFIX: &str = "TOPOGRAPH";

/// Default config file prefix (resolved to `topograph.toml`, `.yaml`, ...).
pub const DEFAULT_FILE_PREFIX: &str = "topograph";

/// Load one section of the configuration into `T`.
///
/// A missing file is fine; a missing section yields `T::default()`. A
/// section that is present but malformed is an error.
pub fn load_section<T>(file_prefix: &str, section: &str) -> Result<T, TopographError>
where
    T: DeserializeOwned + Default,
{
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(file_prefix).required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key(&format!("{section}.datasources"))
                .try_parsing(true),
        )
        .build()?;

    match cfg.get::<T>(section) {
        Ok(value) => Ok(value),
        Err(config::ConfigError::NotFound(_)) => {
            tracing::debug!(section, "Config section absent, using defaults");
            Ok(T::default())
        }
        Err(e) => Err(TopographError::Config(format!("[{section}]: {e}"))),
    }
}
