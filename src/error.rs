//! Error types for keyscan
//!
//! This module defines the error hierarchy for:
//! - Scan round-trip failures (transport, protocol, timeout)
//! - Configuration and CLI errors
//!
//! Stalled cursors and cancellation are not errors. A stall completes the
//! affected shard, and cancellation simply stops scheduling round-trips.

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for keyscan
#[derive(Error, Debug)]
pub enum KeyscanError {
    /// Scan failures surfaced by a shard
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors (writing keys to stdout, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Interrupted by signal
    #[error("Operation interrupted by signal")]
    Interrupted,
}

/// Coarse classification of a [`ScanError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network failure or timeout
    Transport,
    /// Malformed or semantically invalid response
    Protocol,
}

/// Errors that terminate a shard scan
///
/// None of these are retried. The owning shard fails, and the merged scan
/// fails with it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// Could not reach the shard
    #[error("Failed to connect to shard '{shard}': {reason}")]
    ConnectionFailed { shard: String, reason: String },

    /// Round-trip failed in transit
    #[error("Scan round-trip to shard '{shard}' failed: {reason}")]
    Transport { shard: String, reason: String },

    /// Round-trip exceeded the gateway timeout
    #[error("Scan round-trip to shard '{shard}' timed out after {timeout:?}")]
    Timeout { shard: String, timeout: Duration },

    /// Response was malformed or violated the cursor protocol
    #[error("Invalid scan response from shard '{shard}': {reason}")]
    Protocol { shard: String, reason: String },

    /// Shard task ended without completing or failing
    #[error("Scan of shard '{shard}' ended without a terminal signal")]
    Aborted { shard: String },
}

impl ScanError {
    /// Shard the failure belongs to
    pub fn shard(&self) -> &str {
        match self {
            ScanError::ConnectionFailed { shard, .. }
            | ScanError::Transport { shard, .. }
            | ScanError::Timeout { shard, .. }
            | ScanError::Protocol { shard, .. }
            | ScanError::Aborted { shard } => shard,
        }
    }

    /// Classify the failure
    pub fn kind(&self) -> FailureKind {
        match self {
            ScanError::ConnectionFailed { .. }
            | ScanError::Transport { .. }
            | ScanError::Timeout { .. } => FailureKind::Transport,
            ScanError::Protocol { .. } | ScanError::Aborted { .. } => FailureKind::Protocol,
        }
    }

    /// Map a Redis client error for the given shard
    pub fn from_redis(shard: &str, err: redis::RedisError) -> Self {
        if err.is_timeout() {
            ScanError::Transport {
                shard: shard.to_string(),
                reason: format!("timed out: {}", err),
            }
        } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            ScanError::Transport {
                shard: shard.to_string(),
                reason: err.to_string(),
            }
        } else {
            ScanError::Protocol {
                shard: shard.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

/// Configuration and CLI errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Batch hint out of range
    #[error("Invalid batch hint {hint}: must be between {min} and {max}")]
    InvalidBatchHint { hint: usize, min: usize, max: usize },

    /// Shard URL could not be parsed
    #[error("Invalid shard URL '{url}': {reason}")]
    InvalidShardUrl { url: String, reason: String },

    /// No shard given
    #[error("No shards configured - pass --shard or set KEYSCAN_SHARDS")]
    NoShards,

    /// Glob pattern could not be compiled
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Unknown output format
    #[error("Invalid output format '{0}': expected 'text' or 'json'")]
    InvalidFormat(String),

    /// Timeout of zero
    #[error("Invalid timeout: must be at least 1 second")]
    InvalidTimeout,
}

/// Result type alias for KeyscanError
pub type Result<T> = std::result::Result<T, KeyscanError>;

/// Result type alias for ScanError
pub type ScanResult<T> = std::result::Result<T, ScanError>;
