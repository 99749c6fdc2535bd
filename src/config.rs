//! Configuration access for the QoS plugin.
//!
//! The host engine exposes global and per-job configuration as flat string
//! key-value pairs. This module provides a typed view over that map, the
//! plugin's configuration keys, and the [`QosPluginConfig`] defaults read
//! once at worker start.
//!
//! A missing key falls back to its documented default; a present but
//! unparseable value is a [`ConfigError`] and fatal at plugin initialization
//! (not to the worker).

use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

// =============================================================================
// Configuration Keys
// =============================================================================

/// Records between latency-tag emissions on the task side.
pub const TAGGING_INTERVAL_KEY: &str = "plugins.streaming.qosreporter.tagginginterval";

/// The default tagging interval (one in N records carries a tag).
pub const DEFAULT_TAGGING_INTERVAL: u32 = 7;

/// Milliseconds between report flushes from a forwarder to its manager.
pub const AGGREGATION_INTERVAL_KEY: &str = "plugins.streaming.qosreporter.aggregationinterval";

/// The default aggregation interval in milliseconds.
pub const DEFAULT_AGGREGATION_INTERVAL_MS: u64 = 1000;

/// Milliseconds between violation scans and constraint-log windows on the
/// manager side.
pub const ADJUSTMENT_INTERVAL_KEY: &str = "plugins.streaming.qosmanager.adjustmentinterval";

/// The default adjustment interval in milliseconds.
pub const DEFAULT_ADJUSTMENT_INTERVAL_MS: u64 = 5000;

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while reading engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required key is absent and has no default.
    #[error("missing required configuration key '{0}'")]
    MissingKey(String),

    /// A key is present but its value does not parse.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

// =============================================================================
// Configuration View
// =============================================================================

/// A flat key-value view of the engine's global or per-job configuration.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    entries: HashMap<String, String>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a key, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Returns the raw string value for `key`, if present.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Parses the value for `key` if present.
    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.entries.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    /// Parses the value for `key`, falling back to `default` when absent.
    pub fn get_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.get_parsed(key)?.unwrap_or(default))
    }

    /// Parses the value for `key`, failing with [`ConfigError::MissingKey`]
    /// when absent.
    pub fn require<T>(&self, key: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get_parsed(key)?
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
    }
}

// =============================================================================
// Plugin Configuration
// =============================================================================

/// Plugin-wide defaults, read from the global configuration at worker start.
///
/// Per-job configuration may override the reporter intervals at task
/// registration time; the adjustment interval is manager-wide.
#[derive(Debug, Clone)]
pub struct QosPluginConfig {
    /// Records between latency-tag emissions.
    pub tagging_interval: u32,

    /// Milliseconds between forwarder report flushes. Also the freshness
    /// window beyond which a QoS sample is treated as missing.
    pub aggregation_interval_ms: u64,

    /// Milliseconds between manager violation scans and log windows.
    pub adjustment_interval_ms: u64,
}

impl Default for QosPluginConfig {
    fn default() -> Self {
        Self {
            tagging_interval: DEFAULT_TAGGING_INTERVAL,
            aggregation_interval_ms: DEFAULT_AGGREGATION_INTERVAL_MS,
            adjustment_interval_ms: DEFAULT_ADJUSTMENT_INTERVAL_MS,
        }
    }
}

impl QosPluginConfig {
    /// Reads the plugin configuration, applying defaults for absent keys.
    pub fn from_configuration(config: &Configuration) -> Result<Self, ConfigError> {
        Ok(Self {
            tagging_interval: config.get_or(TAGGING_INTERVAL_KEY, DEFAULT_TAGGING_INTERVAL)?,
            aggregation_interval_ms: config
                .get_or(AGGREGATION_INTERVAL_KEY, DEFAULT_AGGREGATION_INTERVAL_MS)?,
            adjustment_interval_ms: config
                .get_or(ADJUSTMENT_INTERVAL_KEY, DEFAULT_ADJUSTMENT_INTERVAL_MS)?,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_keys_absent() {
        let config = QosPluginConfig::from_configuration(&Configuration::new()).unwrap();
        assert_eq!(config.tagging_interval, DEFAULT_TAGGING_INTERVAL);
        assert_eq!(config.aggregation_interval_ms, DEFAULT_AGGREGATION_INTERVAL_MS);
        assert_eq!(config.adjustment_interval_ms, DEFAULT_ADJUSTMENT_INTERVAL_MS);
    }

    #[test]
    fn test_overrides_are_parsed() {
        let mut raw = Configuration::new();
        raw.set(TAGGING_INTERVAL_KEY, "13");
        raw.set(AGGREGATION_INTERVAL_KEY, "250");
        let config = QosPluginConfig::from_configuration(&raw).unwrap();
        assert_eq!(config.tagging_interval, 13);
        assert_eq!(config.aggregation_interval_ms, 250);
        assert_eq!(config.adjustment_interval_ms, DEFAULT_ADJUSTMENT_INTERVAL_MS);
    }

    #[test]
    fn test_invalid_value_is_an_error() {
        let mut raw = Configuration::new();
        raw.set(AGGREGATION_INTERVAL_KEY, "soon");
        let err = QosPluginConfig::from_configuration(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert!(err.to_string().contains(AGGREGATION_INTERVAL_KEY));
    }

    #[test]
    fn test_require_reports_missing_key() {
        let config = Configuration::new();
        let err = config.require::<u64>("plugins.streaming.absent").unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey(_)));
    }

    #[test]
    fn test_get_str_and_set() {
        let mut config = Configuration::new();
        config.set("a.b", "c");
        assert_eq!(config.get_str("a.b"), Some("c"));
        assert_eq!(config.get_str("a.c"), None);
    }
}
