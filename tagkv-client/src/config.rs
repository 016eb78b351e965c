//! # Client Configuration
//!
//! Purpose: Describe the endpoint, pool, and logical database a cache handle
//! binds to, loadable from JSON.
//!
//! ## Design Principles
//! 1. **Serde Defaults**: Every field has a default, so a config document only
//!    names what it changes.
//! 2. **Fail Fast**: `validate` rejects a zero pool size or an unusable
//!    address before any socket is opened.
//! 3. **Immutable After Use**: Pools copy what they need at construction.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::strategy::SelectionStrategy;

/// Default number of pooled connections.
pub const DEFAULT_POOL_SIZE: usize = 5;

/// Default connect and response timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Configuration errors, raised before a pool exists.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("pool size must be at least 1 (got {0})")]
    InvalidPoolSize(usize),
    #[error("unknown selection strategy '{0}'")]
    UnknownStrategy(String),
    #[error("invalid endpoint address '{0}'")]
    InvalidAddress(String),
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Remote endpoint and per-connection transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Server address, e.g. "127.0.0.1:6379" or "cache.internal:6379".
    pub address: String,
    /// Sent with `AUTH` right after each (re)connect.
    pub password: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    /// Upper bound on waiting for a single reply.
    pub response_timeout_ms: Option<u64>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            address: "127.0.0.1:6379".to_string(),
            password: None,
            connect_timeout_ms: Some(DEFAULT_TIMEOUT_MS),
            response_timeout_ms: Some(DEFAULT_TIMEOUT_MS),
        }
    }
}

impl EndpointConfig {
    /// Builds an endpoint for `address` with default timeouts.
    pub fn new(address: impl Into<String>) -> Self {
        EndpointConfig {
            address: address.into(),
            ..EndpointConfig::default()
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_ms.map(Duration::from_millis)
    }

    /// Checks that the address has a host and a numeric port.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid = match self.address.rsplit_once(':') {
            Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
            None => false,
        };
        if valid {
            Ok(())
        } else {
            Err(ConfigError::InvalidAddress(self.address.clone()))
        }
    }
}

/// Pool shape. Fixed for the lifetime of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub pool_size: usize,
    pub strategy: SelectionStrategy,
    pub endpoint: EndpointConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            pool_size: DEFAULT_POOL_SIZE,
            strategy: SelectionStrategy::default(),
            endpoint: EndpointConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size < 1 {
            return Err(ConfigError::InvalidPoolSize(self.pool_size));
        }
        self.endpoint.validate()
    }
}

/// Everything needed to open a cache handle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub pool: PoolConfig,
    /// Logical database number (`SELECT n`).
    pub database: u32,
    /// Prepended to every key, including tag set names.
    pub key_prefix: String,
}

impl CacheConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: CacheConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()
    }
}
