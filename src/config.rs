//! Ledger configuration.
//!
//! Loading configuration is left to the application. [`LedgerConfig`]
//! deserializes from any serde format, and [`LedgerConfig::from_properties`]
//! accepts a flat `ledger.*` key/value map.

use crate::error::{LedgerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Settings shared by every ledger in a registry.
///
/// # Examples
///
/// ```
/// use eventledger::{FlushPolicy, LedgerConfig};
///
/// let config: LedgerConfig = serde_json::from_str(
///     r#"{"auto_flush": false, "flush_interval_writes": 5, "memory": {"preferred_max_size": 10}}"#,
/// ).unwrap();
///
/// assert_eq!(config.memory.preferred_max_size, 10);
/// assert!(matches!(config.flush_policy(), FlushPolicy::Batched { writes: 5, .. }));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Flush the writer after every record.
    pub auto_flush: bool,

    /// With `auto_flush` off, flush once this many writes are buffered.
    pub flush_interval_writes: u64,

    /// With `auto_flush` off, flush when this many seconds passed since the last flush.
    pub flush_interval_seconds: f64,

    /// Flush a dirty writer before serving a disk read.
    pub flush_before_read: bool,

    /// Also `fsync` the log file on every flush.
    pub sync_data: bool,

    /// Capacity of the write-behind queue, in records.
    pub write_behind_queue_capacity: usize,

    pub lock_mode: LockMode,

    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Housekeeping evicts oldest records down to this many.
    pub preferred_max_size: usize,

    /// Size above which housekeeping raises an alarm.
    pub alarm_size: usize,
}

/// Whether a persistence driver takes an exclusive advisory lock on its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    #[default]
    Exclusive,
    None,
}

/// When buffered bytes are pushed out of the writer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlushPolicy {
    EveryWrite,
    Batched { writes: u64, interval: Duration },
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            auto_flush: true,
            flush_interval_writes: 5000,
            flush_interval_seconds: 5.0,
            flush_before_read: true,
            sync_data: false,
            write_behind_queue_capacity: 10_000,
            lock_mode: LockMode::Exclusive,
            memory: MemoryConfig::default(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            preferred_max_size: 10_000,
            alarm_size: 100_000,
        }
    }
}

impl LedgerConfig {
    pub fn flush_policy(&self) -> FlushPolicy {
        if self.auto_flush {
            FlushPolicy::EveryWrite
        } else {
            FlushPolicy::Batched {
                writes: self.flush_interval_writes.max(1),
                interval: Duration::from_secs_f64(self.flush_interval_seconds.max(0.0)),
            }
        }
    }

    /// Reject settings no ledger can run with.
    pub fn validate(&self) -> Result<()> {
        if self.memory.preferred_max_size == 0 {
            return Err(LedgerError::InvalidConfig(
                "memory.preferred_max_size must be positive".into(),
            ));
        }
        if self.write_behind_queue_capacity == 0 {
            return Err(LedgerError::InvalidConfig(
                "write_behind_queue_capacity must be positive".into(),
            ));
        }
        if !self.flush_interval_seconds.is_finite() || self.flush_interval_seconds < 0.0 {
            return Err(LedgerError::InvalidConfig(format!(
                "flush_interval_seconds must be a non-negative number, got {}",
                self.flush_interval_seconds
            )));
        }
        Ok(())
    }

    /// Build a config from flat properties such as `ledger.auto_flush=false`.
    ///
    /// Missing keys keep their defaults. Values that fail to parse also fall
    /// back to the default, with a warning.
    ///
    /// # Examples
    ///
    /// ```
    /// use eventledger::LedgerConfig;
    /// use std::collections::HashMap;
    ///
    /// let props = HashMap::from([
    ///     ("ledger.auto_flush".to_string(), "false".to_string()),
    ///     ("ledger.memory.alarm_size".to_string(), "500".to_string()),
    /// ]);
    /// let config = LedgerConfig::from_properties(&props);
    /// assert!(!config.auto_flush);
    /// assert_eq!(config.memory.alarm_size, 500);
    /// ```
    pub fn from_properties(props: &HashMap<String, String>) -> Self {
        let defaults = LedgerConfig::default();
        LedgerConfig {
            auto_flush: property(props, "ledger.auto_flush", defaults.auto_flush),
            flush_interval_writes: property(
                props,
                "ledger.flush_interval_writes",
                defaults.flush_interval_writes,
            ),
            flush_interval_seconds: property(
                props,
                "ledger.flush_interval_seconds",
                defaults.flush_interval_seconds,
            ),
            flush_before_read: property(props, "ledger.flush_before_read", defaults.flush_before_read),
            sync_data: property(props, "ledger.sync_data", defaults.sync_data),
            write_behind_queue_capacity: property(
                props,
                "ledger.write_behind_queue_capacity",
                defaults.write_behind_queue_capacity,
            ),
            lock_mode: match props.get("ledger.lock_mode").map(|v| v.trim()) {
                Some("none") => LockMode::None,
                Some("exclusive") | None => LockMode::Exclusive,
                Some(other) => {
                    log::warn!("eventledger: ignoring ledger.lock_mode={other:?}");
                    defaults.lock_mode
                }
            },
            memory: MemoryConfig {
                preferred_max_size: property(
                    props,
                    "ledger.memory.preferred_max_size",
                    defaults.memory.preferred_max_size,
                ),
                alarm_size: property(props, "ledger.memory.alarm_size", defaults.memory.alarm_size),
            },
        }
    }
}

fn property<T: std::str::FromStr>(props: &HashMap<String, String>, key: &str, default: T) -> T {
    match props.get(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("eventledger: ignoring unparsable {key}={raw:?}");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = LedgerConfig::default();
        assert!(config.auto_flush);
        assert_eq!(config.flush_interval_writes, 5000);
        assert_eq!(config.flush_interval_seconds, 5.0);
        assert!(config.flush_before_read);
        assert_eq!(config.memory.preferred_max_size, 10_000);
        assert_eq!(config.memory.alarm_size, 100_000);
        assert_eq!(config.flush_policy(), FlushPolicy::EveryWrite);
        config.validate().unwrap();
    }

    #[test]
    fn batched_policy_from_seconds() {
        let config = LedgerConfig {
            auto_flush: false,
            flush_interval_writes: 5,
            flush_interval_seconds: 1.5,
            ..LedgerConfig::default()
        };
        assert_eq!(
            config.flush_policy(),
            FlushPolicy::Batched {
                writes: 5,
                interval: Duration::from_millis(1500)
            }
        );
    }

    #[test]
    fn bad_properties_fall_back_to_defaults() {
        let props = HashMap::from([
            ("ledger.flush_interval_writes".to_string(), "lots".to_string()),
            ("ledger.flush_interval_seconds".to_string(), "0.25".to_string()),
            ("ledger.lock_mode".to_string(), "none".to_string()),
        ]);
        let config = LedgerConfig::from_properties(&props);
        assert_eq!(config.flush_interval_writes, 5000);
        assert_eq!(config.flush_interval_seconds, 0.25);
        assert_eq!(config.lock_mode, LockMode::None);
    }

    #[test]
    fn validate_rejects_unusable_sizes() {
        let mut config = LedgerConfig::default();
        config.memory.preferred_max_size = 0;
        assert!(matches!(config.validate(), Err(LedgerError::InvalidConfig(_))));

        let mut config = LedgerConfig::default();
        config.write_behind_queue_capacity = 0;
        assert!(config.validate().is_err());

        // An alarm below the preferred size is allowed: it fires whenever
        // eviction cannot keep up.
        let mut config = LedgerConfig::default();
        config.memory.alarm_size = 10;
        config.memory.preferred_max_size = 100;
        config.validate().unwrap();
    }
}
