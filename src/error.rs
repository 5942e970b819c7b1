//! Error types for mail-intake.
//!
//! Every failure is caught at the smallest enclosing unit (one attachment, one
//! message, one worker task) and classified with [`ErrorClass`] so callers can
//! decide whether to retry, skip, or reconnect.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Bundle error: {0}")]
    Bundle(#[from] BundleError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a failure should be treated by the surrounding unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network hiccup, rate limit, 5xx. Retried with backoff.
    TransientExternal,
    /// Malformed input, unsupported format, validation failure. Skipped.
    PermanentExternal,
    /// Connection drop or auth failure. Forces a reconnect.
    ConnectivityFailure,
    /// Readiness wait expired. Handled like `PermanentExternal`.
    Timeout,
}

impl ErrorClass {
    /// Whether the failure must not be retried automatically.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::PermanentExternal | Self::Timeout)
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::TransientExternal => "transient_external",
            Self::PermanentExternal => "permanent_external",
            Self::ConnectivityFailure => "connectivity_failure",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Credential collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("No stored credentials at {}; run the authorization flow first", .path.display())]
    MissingCredentials { path: PathBuf },

    #[error("Stored credentials have no refresh token")]
    NoRefreshToken,

    #[error("Token refresh failed: {reason}")]
    RefreshFailed { reason: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mailbox protocol collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Failed to connect to {host}: {reason}")]
    ConnectFailed { host: String, reason: String },

    #[error("Authentication failed for {user}: {reason}")]
    AuthFailed { user: String, reason: String },

    #[error("Connection closed by server")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Message {uid} not found")]
    MessageNotFound { uid: u32 },

    #[error("Part {part} of message {uid} not found")]
    PartNotFound { uid: u32, part: usize },

    #[error("Credential error: {0}")]
    Credentials(#[from] AuthError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MailboxError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MessageNotFound { .. } | Self::PartNotFound { .. } => {
                ErrorClass::PermanentExternal
            }
            _ => ErrorClass::ConnectivityFailure,
        }
    }
}

/// Attachment extraction errors. Always converted into an error record by the
/// attachment pipeline, never propagated past one attachment.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("Extractor command {program} failed to start: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Extractor command {program} exited with status {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: i32,
        stderr: String,
    },

    #[error("Extractor timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unreadable {format} file: {reason}")]
    Unreadable { format: String, reason: String },

    #[error("Extractor panicked: {0}")]
    Panicked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// On-disk bundle errors.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("Bundle artifact missing: {}", .path.display())]
    MissingArtifact { path: PathBuf },

    #[error("Bundle {} is not ready: {marker} missing", .dir.display())]
    NotReady { dir: PathBuf, marker: &'static str },

    #[error("Invalid bundle artifact {}: {reason}", .path.display())]
    Invalid { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// ReadinessSignal errors.
#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    #[error("Timed out after {waited:?} ({polls} polls) waiting for {}", .path.display())]
    Timeout {
        path: PathBuf,
        polls: u32,
        waited: Duration,
    },
}

/// External service (enrichment / commit) errors.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{service} transient failure{}: {reason}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Transient {
        service: String,
        status: Option<u16>,
        reason: String,
    },

    #[error("{service} failed{}: {reason}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Fatal {
        service: String,
        status: Option<u16>,
        reason: String,
    },

    #[error("Invalid response from {service}: {reason}")]
    InvalidResponse { service: String, reason: String },

    #[error("Credential error: {0}")]
    Credentials(#[from] AuthError),
}

impl ServiceError {
    /// Build an error from an HTTP status, classifying 429 and 5xx as transient.
    pub fn from_status(service: &str, status: u16, reason: impl Into<String>) -> Self {
        if status == 429 || (500..600).contains(&status) {
            Self::Transient {
                service: service.to_string(),
                status: Some(status),
                reason: reason.into(),
            }
        } else {
            Self::Fatal {
                service: service.to_string(),
                status: Some(status),
                reason: reason.into(),
            }
        }
    }

    /// Build an error from a transport failure. Timeouts and connect errors
    /// are transient; everything else is fatal.
    pub fn from_reqwest(service: &str, err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(service, status.as_u16(), err.to_string());
        }
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Transient {
                service: service.to_string(),
                status: None,
                reason: err.to_string(),
            }
        } else {
            Self::Fatal {
                service: service.to_string(),
                status: None,
                reason: err.to_string(),
            }
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient { .. } => ErrorClass::TransientExternal,
            Self::Credentials(_) => ErrorClass::ConnectivityFailure,
            Self::Fatal { .. } | Self::InvalidResponse { .. } => ErrorClass::PermanentExternal,
        }
    }
}

/// Worker pool and worker task errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Task {task_id} not admitted within {waited:?}")]
    AdmissionTimeout { task_id: Uuid, waited: Duration },

    #[error("Worker pool is shutting down")]
    ShuttingDown,

    #[error("Readiness wait failed: {0}")]
    Readiness(#[from] ReadinessError),

    #[error("Bundle error: {0}")]
    Bundle(#[from] BundleError),

    #[error("Enrichment refused: {reason}")]
    Refused { reason: String },

    #[error("Enrichment failed after {attempts} attempt(s): {source}")]
    Enrichment {
        attempts: u32,
        #[source]
        source: ServiceError,
    },

    #[error("Commit failed after {attempts} attempt(s): {source}")]
    Commit {
        attempts: u32,
        #[source]
        source: ServiceError,
    },

    #[error("Worker {task_id} panicked: {reason}")]
    Panicked { task_id: Uuid, reason: String },
}

impl WorkerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::AdmissionTimeout { .. } | Self::ShuttingDown => ErrorClass::TransientExternal,
            Self::Readiness(_) => ErrorClass::Timeout,
            Self::Bundle(_) | Self::Refused { .. } | Self::Panicked { .. } => {
                ErrorClass::PermanentExternal
            }
            Self::Enrichment { source, .. } | Self::Commit { source, .. } => source.class(),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
