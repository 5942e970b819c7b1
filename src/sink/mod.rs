//! Commit collaborator.
//!
//! A [`CommitSink`] stores one enriched offer and acknowledges it. Failures
//! are [`ServiceError`]s so the worker's retry wrapper can tell transient
//! from fatal.

pub mod jsonl;
pub mod sheets;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

pub use jsonl::JsonlSink;
pub use sheets::SheetsSink;

use crate::auth::TokenSource;
use crate::config::{env_opt, env_or, env_parse};
use crate::error::{ConfigError, ServiceError};
use crate::llm::OfferRecord;

pub const DEFAULT_SINK_PATH: &str = "./data/offers.jsonl";

/// Where a committed record ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAck {
    /// Sheet name, file path, or other sink-specific locator.
    pub location: String,
}

#[async_trait]
pub trait CommitSink: Send + Sync {
    async fn commit(&self, offer: &OfferRecord) -> Result<CommitAck, ServiceError>;
}

/// Which sink to commit to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkConfig {
    Sheets {
        spreadsheet_id: String,
        /// Sheet id (not index) of the template to duplicate.
        template_sheet_id: Option<i64>,
    },
    Jsonl {
        path: PathBuf,
    },
}

impl SinkConfig {
    /// Sheets when a spreadsheet id is set, JSON lines otherwise.
    pub fn from_env() -> Result<Self, ConfigError> {
        match env_opt("INTAKE_SHEETS_SPREADSHEET_ID") {
            Some(spreadsheet_id) => Ok(Self::Sheets {
                spreadsheet_id,
                template_sheet_id: env_opt("INTAKE_SHEETS_TEMPLATE_ID")
                    .map(|_| env_parse("INTAKE_SHEETS_TEMPLATE_ID", 0i64))
                    .transpose()?,
            }),
            None => Ok(Self::Jsonl {
                path: PathBuf::from(env_or("INTAKE_SINK_PATH", DEFAULT_SINK_PATH)),
            }),
        }
    }

    /// Whether the sink needs bearer credentials.
    pub fn requires_credentials(&self) -> bool {
        matches!(self, Self::Sheets { .. })
    }

    /// Build the configured sink. The Sheets sink reads its bearer token from
    /// `tokens` on every call.
    pub fn build(&self, tokens: Option<Arc<dyn TokenSource>>) -> Result<Arc<dyn CommitSink>, ConfigError> {
        match self {
            Self::Sheets {
                spreadsheet_id,
                template_sheet_id,
            } => {
                let tokens = tokens.ok_or_else(|| ConfigError::InvalidValue {
                    key: "INTAKE_SHEETS_SPREADSHEET_ID".into(),
                    message: "the Sheets sink needs OAuth credentials".into(),
                })?;
                Ok(Arc::new(SheetsSink::new(tokens, spreadsheet_id.clone(), *template_sheet_id)))
            }
            Self::Jsonl { path } => Ok(Arc::new(JsonlSink::new(path.clone()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenSource;

    #[test]
    fn sheets_sink_requires_credentials() {
        let config = SinkConfig::Sheets {
            spreadsheet_id: "abc".into(),
            template_sheet_id: Some(0),
        };
        assert!(config.requires_credentials());
        assert!(config.build(None).is_err());
        assert!(config.build(Some(Arc::new(StaticTokenSource::new("t")))).is_ok());
    }

    #[test]
    fn jsonl_sink_needs_nothing() {
        let config = SinkConfig::Jsonl {
            path: PathBuf::from("offers.jsonl"),
        };
        assert!(!config.requires_credentials());
        assert!(config.build(None).is_ok());
    }
}
