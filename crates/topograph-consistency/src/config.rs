//! Configuration for the consistency daemon.

use std::time::Duration;

use serde::Deserialize;

use topograph_graph::GraphConfig;

use crate::error::{ConsistencyError, Result};

/// Smallest accepted deletion window, in seconds.
pub const MIN_TIME_TO_DELETE_FLOOR: u64 = 60;

/// Largest accepted value for any option measured in seconds (100 years).
/// Keeps window arithmetic on timestamps and instants in range.
pub const MAX_PERIOD_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Consistency and ingestion settings.
///
/// Loaded from the `topograph.toml` `[consistency]` section or
/// `TOPOGRAPH__CONSISTENCY__` environment variables. All intervals are in
/// seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsistencyConfig {
    /// Items not refreshed for this long are tombstoned.
    #[serde(default = "default_min_time_to_delete")]
    pub min_time_to_delete: u64,

    /// Pause between initialization checks.
    #[serde(default = "default_initialization_interval")]
    pub initialization_interval: u64,

    /// Number of initialization checks before starting degraded.
    #[serde(default = "default_initialization_max_retries")]
    pub initialization_max_retries: u32,

    /// Pause between consistency sweeps.
    #[serde(default = "default_consistency_interval")]
    pub consistency_interval: u64,

    /// Physically remove tombstones older than this. Unset disables compaction.
    #[serde(default)]
    pub tombstone_retention: Option<u64>,

    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_ingest_queue_capacity")]
    pub ingest_queue_capacity: usize,

    #[serde(default)]
    pub backpressure: Backpressure,

    /// Datasource types that must report snapshot-end before sweeping starts.
    #[serde(default)]
    pub datasources: Vec<String>,
}

/// What a producer does when the ingest queue is full.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// Wait for room.
    #[default]
    Block,
    /// Discard the event being sent and log it.
    DropNewest,
}

fn default_min_time_to_delete() -> u64 {
    MIN_TIME_TO_DELETE_FLOOR
}

fn default_initialization_interval() -> u64 {
    1
}

fn default_initialization_max_retries() -> u32 {
    30
}

fn default_consistency_interval() -> u64 {
    600
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

fn default_ingest_queue_capacity() -> usize {
    1024
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            min_time_to_delete: default_min_time_to_delete(),
            initialization_interval: default_initialization_interval(),
            initialization_max_retries: default_initialization_max_retries(),
            consistency_interval: default_consistency_interval(),
            tombstone_retention: None,
            lock_timeout_ms: default_lock_timeout_ms(),
            ingest_queue_capacity: default_ingest_queue_capacity(),
            backpressure: Backpressure::default(),
            datasources: Vec::new(),
        }
    }
}

impl ConsistencyConfig {
    /// Load the `[consistency]` section from `{file_prefix}.toml` and the
    /// environment, then validate it.
    pub fn load(file_prefix: &str) -> Result<Self> {
        let config: Self = topograph_core::config::load_section(file_prefix, "consistency")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values outside their documented bounds.
    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("min_time_to_delete", Some(self.min_time_to_delete)),
            ("initialization_interval", Some(self.initialization_interval)),
            ("consistency_interval", Some(self.consistency_interval)),
            ("tombstone_retention", self.tombstone_retention),
        ];
        for (name, secs) in periods {
            if let Some(secs) = secs.filter(|secs| *secs > MAX_PERIOD_SECS) {
                return Err(invalid(format!(
                    "{name} must be at most {MAX_PERIOD_SECS}s, got {secs}"
                )));
            }
        }
        if self.min_time_to_delete < MIN_TIME_TO_DELETE_FLOOR {
            return Err(invalid(format!(
                "min_time_to_delete must be at least {MIN_TIME_TO_DELETE_FLOOR}s, got {}",
                self.min_time_to_delete
            )));
        }
        if self.initialization_interval == 0 {
            return Err(invalid("initialization_interval must be at least 1s"));
        }
        if self.initialization_max_retries == 0 {
            return Err(invalid("initialization_max_retries must be at least 1"));
        }
        if self.consistency_interval == 0 {
            return Err(invalid("consistency_interval must be at least 1s"));
        }
        if let Some(retention) = self.tombstone_retention {
            if retention < self.min_time_to_delete {
                return Err(invalid(format!(
                    "tombstone_retention ({retention}s) must not be shorter than \
                     min_time_to_delete ({}s)",
                    self.min_time_to_delete
                )));
            }
        }
        if self.lock_timeout_ms == 0 {
            return Err(invalid("lock_timeout_ms must be at least 1"));
        }
        if self.ingest_queue_capacity == 0 {
            return Err(invalid("ingest_queue_capacity must be at least 1"));
        }
        if self.datasources.iter().any(|name| name.trim().is_empty()) {
            return Err(invalid("datasource names must not be empty"));
        }
        Ok(())
    }

    pub fn min_time_to_delete(&self) -> chrono::TimeDelta {
        seconds(self.min_time_to_delete)
    }

    pub fn tombstone_retention(&self) -> Option<chrono::TimeDelta> {
        self.tombstone_retention.map(seconds)
    }

    pub fn initialization_interval(&self) -> Duration {
        Duration::from_secs(self.initialization_interval)
    }

    pub fn consistency_interval(&self) -> Duration {
        Duration::from_secs(self.consistency_interval)
    }

    /// Graph tuning derived from these settings.
    pub fn graph_config(&self) -> GraphConfig {
        GraphConfig {
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
        }
    }
}

// Clamped so an unvalidated value can neither wrap nor panic.
fn seconds(secs: u64) -> chrono::TimeDelta {
    chrono::TimeDelta::seconds(secs.min(MAX_PERIOD_SECS) as i64)
}

fn invalid(reason: impl Into<String>) -> ConsistencyError {
    ConsistencyError::Configuration(reason.into())
}
