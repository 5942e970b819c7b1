//! Filesystem readiness wait.
//!
//! Producers signal a finished stage by creating a marker file; consumers
//! poll for it. Polling is the only synchronization between the two, so it
//! works the same whether the worker shares the process or not.

use std::path::Path;
use std::time::Duration;

use rand::Rng;
use tokio::fs;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{env_millis, env_secs};
use crate::error::{ConfigError, ReadinessError};

/// Poll schedule for [`await_file`].
#[derive(Debug, Clone, Copy)]
pub struct ReadinessConfig {
    pub poll_interval: Duration,
    /// Upper bound of random delay added to each poll.
    pub jitter: Duration,
    pub timeout: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            jitter: Duration::from_millis(250),
            timeout: Duration::from_secs(300),
        }
    }
}

impl ReadinessConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            poll_interval: env_millis("INTAKE_READINESS_INTERVAL_MS", 1000)?,
            jitter: env_millis("INTAKE_READINESS_JITTER_MS", 250)?,
            timeout: env_secs("INTAKE_READINESS_TIMEOUT_SECS", 300)?,
        };
        if config.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "INTAKE_READINESS_INTERVAL_MS".into(),
                message: "poll interval must be positive".into(),
            });
        }
        Ok(config)
    }

    /// Number of failed polls before timing out: `ceil(timeout / interval)`,
    /// at least one.
    pub fn max_polls(&self) -> u32 {
        let interval = self.poll_interval.as_nanos().max(1);
        let polls = self.timeout.as_nanos().div_ceil(interval);
        polls.clamp(1, u32::MAX as u128) as u32
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.poll_interval;
        }
        self.poll_interval + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Wait until `path` exists. Returns the number of polls it took.
pub async fn await_file(path: &Path, config: &ReadinessConfig) -> Result<u32, ReadinessError> {
    let started = Instant::now();
    let max_polls = config.max_polls();

    for poll in 1..=max_polls {
        // An I/O error here means "not visible yet"; keep polling.
        if fs::try_exists(path).await.unwrap_or(false) {
            debug!(path = %path.display(), polls = poll, "Readiness marker present");
            return Ok(poll);
        }
        tokio::time::sleep(config.next_delay()).await;
    }

    let waited = started.elapsed();
    warn!(
        path = %path.display(),
        polls = max_polls,
        waited_ms = waited.as_millis() as u64,
        "Readiness wait timed out"
    );
    Err(ReadinessError::Timeout {
        path: path.to_path_buf(),
        polls: max_polls,
        waited,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fast(interval_ms: u64, timeout_ms: u64) -> ReadinessConfig {
        ReadinessConfig {
            poll_interval: Duration::from_millis(interval_ms),
            jitter: Duration::ZERO,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[test]
    fn poll_budget() {
        let cfg = ReadinessConfig {
            poll_interval: Duration::from_secs(1),
            jitter: Duration::ZERO,
            timeout: Duration::from_secs(3),
        };
        assert_eq!(cfg.max_polls(), 3);
        assert_eq!(fast(1000, 2500).max_polls(), 3);
        assert_eq!(fast(1000, 0).max_polls(), 1);
    }

    #[tokio::test]
    async fn existing_file_is_ready_on_first_poll() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stage1-complete");
        tokio::fs::write(&path, b"").await.unwrap();
        assert_eq!(await_file(&path, &fast(10, 100)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn times_out_after_exact_poll_count() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("never");
        let err = await_file(&path, &fast(10, 30)).await.unwrap_err();
        let ReadinessError::Timeout { polls, waited, .. } = err;
        assert_eq!(polls, 3);
        assert!(waited >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn returns_within_one_interval_of_creation() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stage2-complete");
        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(35)).await;
            tokio::fs::write(writer_path, b"").await.unwrap();
        });

        let started = std::time::Instant::now();
        await_file(&path, &fast(20, 2000)).await.unwrap();
        // Created at ~35ms; the next poll lands by ~60ms.
        assert!(started.elapsed() < Duration::from_millis(35 + 20 + 200));
    }
}
