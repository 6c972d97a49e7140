use std::path::PathBuf;
use std::time::Duration;

use crate::arbiter::RetryPolicy;
use crate::engine::DEFAULT_LOCK_TIMEOUT;

const WAL_FILE_NAME: &str = "roster.wal";

/// Runtime settings, read from `ROSTER_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Longest wait for one key's lock before `ConcurrentModification`.
    pub lock_timeout: Duration,
    pub retry: RetryPolicy,
    /// WAL appends since the last compaction that trigger an inline compaction.
    /// Zero disables compaction.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            retry: RetryPolicy::default(),
            compact_threshold: 1000,
            metrics_port: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("ROSTER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            lock_timeout: env_parse("ROSTER_LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            retry: RetryPolicy {
                max_attempts: env_parse("ROSTER_MAX_ATTEMPTS")
                    .unwrap_or(defaults.retry.max_attempts),
                backoff: env_parse("ROSTER_RETRY_BACKOFF_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.backoff),
            },
            compact_threshold: env_parse("ROSTER_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: env_parse("ROSTER_METRICS_PORT"),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(WAL_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wal_lives_in_data_dir() {
        let config = Config {
            data_dir: PathBuf::from("/var/lib/roster"),
            ..Config::default()
        };
        assert_eq!(config.wal_path(), PathBuf::from("/var/lib/roster/roster.wal"));
    }

    #[test]
    fn defaults_are_bounded() {
        let config = Config::default();
        assert!(config.retry.max_attempts >= 1);
        assert!(config.lock_timeout > Duration::ZERO);
        assert_eq!(config.metrics_port, None);
    }
}
