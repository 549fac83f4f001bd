// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::cache::{CacheConfig, CheckpointWorkerConfig};

/// Tidepool configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Number of engine partitions
    pub partition_count: u32,
    /// Store lock timeout (PostgreSQL) or busy timeout (SQLite), in seconds
    pub lock_timeout_secs: u64,
    /// Application identity recorded with every checkpoint
    pub app_name: String,
    /// Coalescing delay of the checkpoint worker, in milliseconds
    pub checkpoint_delay_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `TIDEPOOL_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `TIDEPOOL_PARTITION_COUNT`: Engine partitions, 1 to 1024 (default: 12)
    /// - `TIDEPOOL_LOCK_TIMEOUT_SECS`: Store lock timeout (default: 30)
    /// - `TIDEPOOL_APP_NAME`: Application identity (default: tidepool)
    /// - `TIDEPOOL_CHECKPOINT_DELAY_MS`: Checkpoint coalescing delay (default: 10)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("TIDEPOOL_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("TIDEPOOL_DATABASE_URL"))?;

        let partition_count: u32 = std::env::var("TIDEPOOL_PARTITION_COUNT")
            .unwrap_or_else(|_| "12".to_string())
            .parse()
            .ok()
            .filter(|count| (1..=1024).contains(count))
            .ok_or(ConfigError::Invalid(
                "TIDEPOOL_PARTITION_COUNT",
                "must be an integer between 1 and 1024",
            ))?;

        let lock_timeout_secs: u64 = std::env::var("TIDEPOOL_LOCK_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("TIDEPOOL_LOCK_TIMEOUT_SECS", "must be a positive integer")
            })?;

        let app_name =
            std::env::var("TIDEPOOL_APP_NAME").unwrap_or_else(|_| "tidepool".to_string());
        if app_name.trim().is_empty() {
            return Err(ConfigError::Invalid("TIDEPOOL_APP_NAME", "must not be empty"));
        }

        let checkpoint_delay_ms: u64 = std::env::var("TIDEPOOL_CHECKPOINT_DELAY_MS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "TIDEPOOL_CHECKPOINT_DELAY_MS",
                    "must be a non-negative integer",
                )
            })?;

        Ok(Self {
            database_url,
            partition_count,
            lock_timeout_secs,
            app_name,
            checkpoint_delay_ms,
        })
    }

    /// Read a `.env` file if present, then load from the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    /// Cache engine settings.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            partition_count: self.partition_count,
        }
    }

    /// Checkpoint worker settings.
    pub fn worker_config(&self) -> CheckpointWorkerConfig {
        CheckpointWorkerConfig {
            coalesce_delay: Duration::from_millis(self.checkpoint_delay_ms),
            ..Default::default()
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

/// Install a global `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Does nothing if a subscriber is already installed.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}
