//! Configuration types.
//!
//! Everything is read from `INTAKE_*` environment variables. Each component
//! owns its config struct and a `from_env()` constructor; [`IntakeConfig`]
//! gathers them for the binary.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::attachments::ExtractionConfig;
use crate::auth::AuthConfig;
use crate::bundle::ReadinessConfig;
use crate::error::ConfigError;
use crate::llm::EnrichmentConfig;
use crate::mailbox::ImapConfig;
use crate::retry::RetryPolicy;
use crate::sink::SinkConfig;
use crate::worker::WorkerPoolConfig;

/// Default bundle root.
pub const DEFAULT_DATA_DIR: &str = "./data/bundles";

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Full service configuration.
#[derive(Debug)]
pub struct IntakeConfig {
    pub imap: ImapConfig,
    pub auth: AuthConfig,
    /// Root directory holding one bundle directory per message.
    pub data_dir: PathBuf,
    pub extraction: ExtractionConfig,
    pub workers: WorkerPoolConfig,
    pub readiness: ReadinessConfig,
    pub retry: RetryPolicy,
    pub enrichment: EnrichmentConfig,
    pub sink: SinkConfig,
    /// Fixed delay before reconnecting after an error or close.
    pub reconnect_delay: Duration,
}

impl IntakeConfig {
    /// Build the full configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            imap: ImapConfig::from_env()?,
            auth: AuthConfig::from_env()?,
            data_dir: PathBuf::from(env_or("INTAKE_DATA_DIR", DEFAULT_DATA_DIR)),
            extraction: ExtractionConfig::from_env()?,
            workers: WorkerPoolConfig::from_env()?,
            readiness: ReadinessConfig::from_env()?,
            retry: RetryPolicy::from_env()?,
            enrichment: EnrichmentConfig::from_env()?,
            sink: SinkConfig::from_env()?,
            reconnect_delay: env_secs(
                "INTAKE_RECONNECT_DELAY_SECS",
                DEFAULT_RECONNECT_DELAY.as_secs(),
            )?,
        })
    }
}

/// Directory for rolling log files; console only when unset. Read on its own
/// so logging can start before the rest of the configuration is loaded.
pub fn log_dir() -> Option<PathBuf> {
    env_opt("INTAKE_LOG_DIR").map(PathBuf::from)
}

/// Read an optional, non-empty variable.
pub fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read a variable, falling back to `default`.
pub fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

/// Read a required variable.
pub fn env_required(key: &str) -> Result<String, ConfigError> {
    env_opt(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

/// Parse a variable, falling back to `default` when unset.
pub fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_opt(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
    }
}

/// Parse a duration given in seconds.
pub fn env_secs(key: &str, default: u64) -> Result<Duration, ConfigError> {
    env_parse(key, default).map(Duration::from_secs)
}

/// Parse a duration given in milliseconds.
pub fn env_millis(key: &str, default: u64) -> Result<Duration, ConfigError> {
    env_parse(key, default).map(Duration::from_millis)
}
