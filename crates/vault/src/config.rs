//! Transfer settings persisted as JSON.

use std::path::Path;
use std::time::Duration;

use icebox_transfer::{MIB, RetryPolicy, validate_part_size};
use serde::{Deserialize, Serialize};

use crate::error::VaultError;
use crate::poller::PollSchedule;

/// Tunables for retrieval and upload workflows.
///
/// Every field has a default, so a partial file only overrides what it names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Consecutive failures tolerated before a step is abandoned.
    pub max_retries: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_backoff_factor: f64,

    /// Download window, in MiB.
    pub window_size_mib: u64,
    /// Upload part size, in MiB. Must be a power of two.
    pub part_size_mib: u64,

    pub initial_poll_delay_secs: u64,
    pub poll_interval_secs: u64,
    /// Upper bound on total time spent waiting for a job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_poll_wait_secs: Option<u64>,

    /// Abort the remote upload when completion is rejected.
    pub abort_on_rejection: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        let poll = PollSchedule::default();
        Self {
            max_retries: retry.max_retries,
            retry_initial_delay_ms: retry.initial_delay.as_millis() as u64,
            retry_max_delay_ms: retry.max_delay.as_millis() as u64,
            retry_backoff_factor: retry.backoff_factor,
            window_size_mib: 64,
            part_size_mib: 8,
            initial_poll_delay_secs: poll.initial_delay.as_secs(),
            poll_interval_secs: poll.interval.as_secs(),
            max_poll_wait_secs: None,
            abort_on_rejection: false,
        }
    }
}

impl TransferConfig {
    /// Reads settings from `path`.
    ///
    /// A missing file yields the defaults. So does an unparsable one, with a
    /// warning.
    pub fn load(path: &Path) -> Result<Self, VaultError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str::<Self>(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse transfer config, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), VaultError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::debug!(path = %path.display(), "transfer config saved");
        Ok(())
    }

    /// Rejects settings the workflows cannot run with.
    pub fn validate(&self) -> Result<(), VaultError> {
        if self.window_size_mib == 0 {
            return Err(VaultError::Config("window_size_mib must be positive".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(VaultError::Config("poll_interval_secs must be positive".into()));
        }
        if !self.retry_backoff_factor.is_finite() || self.retry_backoff_factor < 1.0 {
            return Err(VaultError::Config(format!(
                "retry_backoff_factor must be at least 1, got {}",
                self.retry_backoff_factor
            )));
        }
        if self.retry_initial_delay_ms > self.retry_max_delay_ms {
            return Err(VaultError::Config(
                "retry_initial_delay_ms exceeds retry_max_delay_ms".into(),
            ));
        }
        validate_part_size(self.part_size())
            .map_err(|e| VaultError::Config(format!("part_size_mib: {e}")))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            backoff_factor: self.retry_backoff_factor,
        }
    }

    pub fn poll_schedule(&self) -> PollSchedule {
        PollSchedule {
            initial_delay: Duration::from_secs(self.initial_poll_delay_secs),
            interval: Duration::from_secs(self.poll_interval_secs),
            deadline: self.max_poll_wait_secs.map(Duration::from_secs),
        }
    }

    pub fn window_size(&self) -> u64 {
        self.window_size_mib.saturating_mul(MIB)
    }

    pub fn part_size(&self) -> u64 {
        self.part_size_mib.saturating_mul(MIB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_service_schedule() {
        let config = TransferConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.window_size(), 64 * MIB);
        assert_eq!(config.part_size(), 8 * MIB);

        let schedule = config.poll_schedule();
        assert_eq!(schedule.initial_delay, Duration::from_secs(3 * 60 * 60));
        assert_eq!(schedule.interval, Duration::from_secs(15 * 60));
        assert_eq!(schedule.deadline, None);
        assert!(!config.abort_on_rejection);
        config.validate().unwrap();
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = TransferConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, TransferConfig::default());
    }

    #[test]
    fn partial_file_overrides_named_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfer.json");
        std::fs::write(&path, r#"{"max_retries": 2, "max_poll_wait_secs": 3600}"#).unwrap();

        let config = TransferConfig::load(&path).unwrap();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.retry_policy().max_retries, 2);
        assert_eq!(config.poll_schedule().deadline, Some(Duration::from_secs(3600)));
        assert_eq!(config.part_size_mib, 8);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfer.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(TransferConfig::load(&path).unwrap(), TransferConfig::default());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("transfer.json");
        let config = TransferConfig {
            part_size_mib: 16,
            abort_on_rejection: true,
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(TransferConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn validate_rejects_bad_part_size() {
        let config = TransferConfig {
            part_size_mib: 3,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(VaultError::Config(_))));

        let config = TransferConfig {
            window_size_mib: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
