//! Configuration for a sync session.

use serde::Deserialize;
use std::env;

/// Upper bound on rows returned by a single batch peek.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 3000;

/// Number of item ids combined into one store lookup.
pub const DEFAULT_LOOKUP_CHUNK_SIZE: usize = 50;

/// Tunables for a [`SyncContext`](crate::SyncContext) and its queue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Maximum operations grouped into one bulk remote call
    pub max_batch_size: usize,
    /// Maximum item ids per `findByItems` store query
    pub lookup_chunk_size: usize,
    /// Drain the queue in same-table/same-kind batches instead of one by one
    pub bulk_push: bool,
    /// Stop resubmitting after this many conflict rounds (`None` = no bound)
    pub max_conflict_rounds: Option<u32>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            lookup_chunk_size: DEFAULT_LOOKUP_CHUNK_SIZE,
            bulk_push: true,
            max_conflict_rounds: None,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables (and `.env`, if present).
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let max_batch_size = read_size("OFFSYNC_MAX_BATCH_SIZE", defaults.max_batch_size)?;
        let lookup_chunk_size =
            read_size("OFFSYNC_LOOKUP_CHUNK_SIZE", defaults.lookup_chunk_size)?;

        let bulk_push = match env::var("OFFSYNC_BULK_PUSH") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| ConfigError::Invalid("OFFSYNC_BULK_PUSH", raw))?,
            Err(_) => defaults.bulk_push,
        };

        let max_conflict_rounds = match env::var("OFFSYNC_MAX_CONFLICT_ROUNDS") {
            Ok(raw) => Some(
                raw.parse()
                    .map_err(|_| ConfigError::Invalid("OFFSYNC_MAX_CONFLICT_ROUNDS", raw))?,
            ),
            Err(_) => defaults.max_conflict_rounds,
        };

        let config = Self {
            max_batch_size,
            lookup_chunk_size,
            bulk_push,
            max_conflict_rounds,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the queue cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::Zero("max_batch_size"));
        }
        if self.lookup_chunk_size == 0 {
            return Err(ConfigError::Zero("lookup_chunk_size"));
        }
        Ok(())
    }
}

fn read_size(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid(name, raw)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1:?}")]
    Invalid(&'static str, String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}
