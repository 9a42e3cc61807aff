use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable overriding [`MergeConfig::worker_count`]
pub const ENV_WORKERS: &str = "LIGHTNING_MERGE_WORKERS";
/// Environment variable overriding [`MergeConfig::stall_timeout`], in milliseconds
pub const ENV_STALL_TIMEOUT_MS: &str = "LIGHTNING_MERGE_STALL_TIMEOUT_MS";

/// Tuning knobs for one merge job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Number of worker threads executing chunk and bucket tasks
    pub worker_count: usize,
    /// Bits consumed per radix digit (1..=16)
    pub radix_bits: u8,
    /// Largest number of rows (left + right) a finalized bucket may hold
    pub bucket_row_threshold: usize,
    /// Upper bound on radix digits consumed before a bucket is declared skewed
    pub max_radix_depth: usize,
    /// Buckets per worker when hash partitioning
    pub hash_fanout: usize,
    /// A task silent for longer than this is considered stalled
    pub stall_timeout: Duration,
    /// How often the supervisor checks heartbeats
    pub poll_interval: Duration,
    /// Re-executions granted to a stalled or crashed task
    pub max_task_retries: u32,
    /// Delay before a retried task starts
    pub retry_backoff: Duration,
    /// Tasks heartbeat after this many rows
    pub heartbeat_rows: usize,
    /// Time allowed for worker threads to exit on shutdown before they are detached
    pub shutdown_grace: Duration,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            radix_bits: 8,
            bucket_row_threshold: 1 << 20,
            max_radix_depth: 16,
            hash_fanout: 4,
            stall_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(20),
            max_task_retries: 1,
            retry_backoff: Duration::from_millis(10),
            heartbeat_rows: 4096,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

/// Named configurations for common workloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPreset {
    /// Balanced settings
    Default,
    /// Small joins where a quick failure matters more than throughput
    LowLatency,
    /// Joins over very large tables
    LargeJoin,
}

impl ConfigPreset {
    pub fn to_config(self) -> MergeConfig {
        match self {
            ConfigPreset::Default => MergeConfig::default(),
            ConfigPreset::LowLatency => MergeConfig {
                stall_timeout: Duration::from_secs(2),
                poll_interval: Duration::from_millis(5),
                bucket_row_threshold: 1 << 16,
                heartbeat_rows: 512,
                ..MergeConfig::default()
            },
            ConfigPreset::LargeJoin => MergeConfig {
                radix_bits: 10,
                bucket_row_threshold: 1 << 23,
                stall_timeout: Duration::from_secs(300),
                poll_interval: Duration::from_millis(100),
                hash_fanout: 16,
                heartbeat_rows: 65536,
                ..MergeConfig::default()
            },
        }
    }
}

impl MergeConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: MergeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Apply `LIGHTNING_MERGE_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(workers) = std::env::var(ENV_WORKERS) {
            self.worker_count = workers
                .parse()
                .map_err(|_| Error::Config(format!("{} must be an integer", ENV_WORKERS)))?;
        }
        if let Ok(ms) = std::env::var(ENV_STALL_TIMEOUT_MS) {
            let ms: u64 = ms.parse().map_err(|_| {
                Error::Config(format!("{} must be an integer", ENV_STALL_TIMEOUT_MS))
            })?;
            self.stall_timeout = Duration::from_millis(ms);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(Error::Config("Worker count must be greater than 0".into()));
        }

        if self.radix_bits == 0 || self.radix_bits > 16 {
            return Err(Error::Config("Radix bits must be between 1 and 16".into()));
        }

        if self.bucket_row_threshold == 0 {
            return Err(Error::Config(
                "Bucket row threshold must be greater than 0".into(),
            ));
        }

        if self.max_radix_depth == 0 {
            return Err(Error::Config("Radix depth must be at least 1".into()));
        }

        if self.hash_fanout == 0 {
            return Err(Error::Config("Hash fanout must be greater than 0".into()));
        }

        if self.stall_timeout.is_zero() {
            return Err(Error::Config("Stall timeout must be non-zero".into()));
        }

        if self.poll_interval.is_zero() || self.poll_interval > self.stall_timeout {
            return Err(Error::Config(
                "Poll interval must be non-zero and no longer than the stall timeout".into(),
            ));
        }

        if self.heartbeat_rows == 0 {
            return Err(Error::Config("Heartbeat rows must be greater than 0".into()));
        }

        Ok(())
    }

    /// Number of buckets a single radix digit fans out to.
    pub fn radix_fanout(&self) -> usize {
        1usize << self.radix_bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        MergeConfig::default().validate().unwrap();
        for preset in [
            ConfigPreset::Default,
            ConfigPreset::LowLatency,
            ConfigPreset::LargeJoin,
        ] {
            preset.to_config().validate().unwrap();
        }
    }

    #[test]
    fn test_rejects_bad_radix_bits() {
        let config = MergeConfig {
            radix_bits: 17,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_poll_longer_than_timeout() {
        let config = MergeConfig {
            stall_timeout: Duration::from_millis(10),
            poll_interval: Duration::from_millis(50),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = MergeConfig::from_json_str(r#"{ "worker_count": 3, "radix_bits": 4 }"#)
            .unwrap();
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.radix_fanout(), 16);
        assert_eq!(config.max_task_retries, 1);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "bucket_row_threshold": 128 }}"#).unwrap();
        let config = MergeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bucket_row_threshold, 128);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var(ENV_WORKERS, "2");
        std::env::set_var(ENV_STALL_TIMEOUT_MS, "750");
        let config = MergeConfig::default().with_env_overrides();
        std::env::remove_var(ENV_WORKERS);
        std::env::remove_var(ENV_STALL_TIMEOUT_MS);

        let config = config.unwrap();
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.stall_timeout, Duration::from_millis(750));
    }

    #[test]
    #[serial]
    fn test_env_override_rejects_garbage() {
        std::env::set_var(ENV_WORKERS, "many");
        let result = MergeConfig::default().with_env_overrides();
        std::env::remove_var(ENV_WORKERS);
        assert!(result.is_err());
    }
}
