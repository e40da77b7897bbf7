//! Configuration module
//!
//! Loads configuration from environment variables.

use std::env;
use std::time::Duration;

use crate::command::CommandOptions;
use crate::stream::{ConsumerOptions, IteratorInit};

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Sleep between shard polls
    pub stream_poll_interval_ms: u64,

    /// Max records per stream fetch
    pub stream_batch_limit: usize,

    /// Where a shard iterator starts on open
    pub iterator_init: IteratorInit,

    /// Retries on event log append conflicts
    pub command_retry_max: u32,

    /// Per external call deadline
    pub call_timeout_ms: u64,

    /// Number of hash shards on the change stream
    pub shard_count: u32,

    /// Environment (development, production)
    pub environment: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::MissingEnv("DATABASE_URL"))?;

        let database_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("DATABASE_MAX_CONNECTIONS"))?;

        let stream_poll_interval_ms = env::var("STREAM_POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("STREAM_POLL_INTERVAL_MS"))?;

        let stream_batch_limit = env::var("STREAM_BATCH_LIMIT")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("STREAM_BATCH_LIMIT"))?;

        let iterator_init = parse_iterator_init(
            &env::var("ITERATOR_INIT").unwrap_or_else(|_| "after_checkpoint".to_string()),
        )
        .ok_or(ConfigError::InvalidValue("ITERATOR_INIT"))?;

        let command_retry_max = env::var("COMMAND_RETRY_MAX")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("COMMAND_RETRY_MAX"))?;

        let call_timeout_ms = env::var("CALL_TIMEOUT_MS")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("CALL_TIMEOUT_MS"))?;

        let shard_count = env::var("SHARD_COUNT")
            .unwrap_or_else(|_| "4".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("SHARD_COUNT"))?;
        if shard_count == 0 {
            return Err(ConfigError::InvalidValue("SHARD_COUNT"));
        }

        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        Ok(Self {
            database_url,
            database_max_connections,
            stream_poll_interval_ms,
            stream_batch_limit,
            iterator_init,
            command_retry_max,
            call_timeout_ms,
            shard_count,
            environment,
        })
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Stream consumer knobs derived from this configuration.
    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            poll_interval: Duration::from_millis(self.stream_poll_interval_ms),
            batch_limit: self.stream_batch_limit,
            iterator_init: self.iterator_init,
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            ..ConsumerOptions::default()
        }
    }

    /// Command service knobs derived from this configuration.
    pub fn command_options(&self) -> CommandOptions {
        CommandOptions {
            retry_max: self.command_retry_max,
            call_timeout: Duration::from_millis(self.call_timeout_ms),
        }
    }
}

fn parse_iterator_init(value: &str) -> Option<IteratorInit> {
    match value {
        "latest" => Some(IteratorInit::Latest),
        "trim_horizon" => Some(IteratorInit::TrimHorizon),
        "after_checkpoint" => Some(IteratorInit::AfterCheckpoint),
        _ => None,
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iterator_init_parsing() {
        assert_eq!(parse_iterator_init("latest"), Some(IteratorInit::Latest));
        assert_eq!(
            parse_iterator_init("trim_horizon"),
            Some(IteratorInit::TrimHorizon)
        );
        assert_eq!(
            parse_iterator_init("after_checkpoint"),
            Some(IteratorInit::AfterCheckpoint)
        );
        assert_eq!(parse_iterator_init("yesterday"), None);
    }
}
