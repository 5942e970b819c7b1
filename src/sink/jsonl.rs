//! JSON-lines sink for local operation.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::{CommitAck, CommitSink};
use crate::error::ServiceError;
use crate::llm::OfferRecord;

const SERVICE: &str = "jsonl";

/// Appends one offer per line to a file.
pub struct JsonlSink {
    path: PathBuf,
    // Workers commit concurrently; lines must not interleave.
    write_lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn io_error(&self, e: std::io::Error) -> ServiceError {
        ServiceError::Fatal {
            service: SERVICE.into(),
            status: None,
            reason: format!("{}: {e}", self.path.display()),
        }
    }
}

#[async_trait]
impl CommitSink for JsonlSink {
    async fn commit(&self, offer: &OfferRecord) -> Result<CommitAck, ServiceError> {
        let mut line = serde_json::to_string(offer).map_err(|e| ServiceError::Fatal {
            service: SERVICE.into(),
            status: None,
            reason: e.to_string(),
        })?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| self.io_error(e))?;
        file.flush().await.map_err(|e| self.io_error(e))?;

        debug!(path = %self.path.display(), "Offer appended");
        Ok(CommitAck {
            location: self.path.display().to_string(),
        })
    }
}
