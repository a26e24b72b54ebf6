//! Configuration loading for the scheduler binary.
//!
//! Mirrors the teacher workspace's `toml`-backed `from_path` helper, plus a
//! concrete [`SchedulerConfig`] covering the tunables the spec leaves as
//! implementation details: the suspicion limit, heartbeat tolerance, the
//! dispatch batching window, the per-worker overbook limit, and the assumed
//! network bandwidth used by the dispatcher's transfer-cost estimate.

use derive_more::derive::From;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

#[derive(Debug, From)]
pub enum ConfigError {
    #[from(ignore)]
    IOError(std::io::Error),

    #[from(ignore)]
    DeserializationFailed(toml::de::Error),

    InvalidPath(std::path::PathBuf),
}

impl From<toml::de::Error> for ConfigError {
    fn from(value: toml::de::Error) -> Self {
        Self::DeserializationFailed(value)
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}

impl std::error::Error for ConfigError {}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Returns the regular `toml::Value`, for callers that want to inspect the
/// document before committing to a concrete type.
pub fn value_from_path<V: Into<std::path::PathBuf>>(target: V) -> ConfigResult<toml::Value> {
    from_path(target)
}

pub fn from_path<T, V>(target: V) -> ConfigResult<T>
where
    T: DeserializeOwned,
    V: Into<std::path::PathBuf>,
{
    let target_path = target.into();
    let config_content = std::fs::read_to_string(&target_path)
        .map_err(|_| ConfigError::InvalidPath(target_path.clone()))
        .or_else(|_| std::fs::read_to_string(target_path).map_err(ConfigError::from))?;
    let config_obj: T = toml::from_str(&config_content)?;
    Ok(config_obj)
}

/// Number of distinct worker-loss events a task may be suspected of taking
/// part in before it is deemed poison (spec.md §3 invariant 7, §4.5).
pub const DEFAULT_SUSPICION_LIMIT: u32 = 3;

/// Missed consecutive heartbeats before a worker is considered lost
/// (spec.md §5 "Timeouts").
pub const DEFAULT_HEARTBEAT_MISS_LIMIT: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Address the scheduler listens on for both worker and client
    /// connections (spec.md §6 transport).
    pub bind_address: String,

    /// Worker failures a task may be blamed in before it is erred
    /// permanently (spec.md §3 invariant 7).
    pub suspicion_limit: u32,

    /// Missed heartbeats before `remove-worker` fires (spec.md §5).
    pub heartbeat_miss_limit: u32,

    /// Expected gap between a worker's heartbeats, in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Outbound batching window per spec.md §5 ("the first message on an
    /// idle link sends immediately, subsequent messages buffer and flush
    /// together").
    pub batch_window_ms: u64,

    /// Maximum tasks a single worker may hold in `processing` at once
    /// before the dispatcher stops pushing it more ready work
    /// (spec.md §4.3's "overbook limit", left as a TODO constant in the
    /// reference scheduler; here it is a tunable).
    pub worker_overbook_limit: usize,

    /// Assumed network bandwidth, in bytes/sec, used by the dispatcher's
    /// `transfer_cost(k, w)` estimate (spec.md §4.3).
    pub assumed_bandwidth_bytes_per_sec: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8786".to_string(),
            suspicion_limit: DEFAULT_SUSPICION_LIMIT,
            heartbeat_miss_limit: DEFAULT_HEARTBEAT_MISS_LIMIT,
            heartbeat_interval_ms: 1_000,
            batch_window_ms: 2,
            worker_overbook_limit: 128,
            assumed_bandwidth_bytes_per_sec: 100_000_000,
        }
    }
}

impl SchedulerConfig {
    pub fn load(path: impl Into<std::path::PathBuf>) -> ConfigResult<Self> {
        from_path(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.suspicion_limit, 3);
        assert_eq!(config.heartbeat_miss_limit, 5);
        assert_eq!(config.batch_window_ms, 2);
    }

    #[test]
    fn loading_missing_file_is_an_error() {
        let result = SchedulerConfig::load("/does/not/exist.toml");
        assert!(matches!(result, Err(ConfigError::InvalidPath(_))));
    }

    #[test]
    fn loads_partial_toml_and_fills_defaults() {
        let dir = std::env::temp_dir().join(format!(
            "scheduler-config-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("scheduler.toml");
        std::fs::write(&path, "suspicion_limit = 7\n").unwrap();

        let config = SchedulerConfig::load(&path).unwrap();
        assert_eq!(config.suspicion_limit, 7);
        assert_eq!(config.bind_address, "0.0.0.0:8786");

        std::fs::remove_file(&path).unwrap();
    }
}
