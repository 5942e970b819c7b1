//! Stage 2: combine per-attachment outputs into one aggregate record.
//!
//! Combining is a pure function of the bundle's stage 1 artifacts, so it can
//! be re-run after a crash and produces byte-identical output.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use super::{Bundle, BundleMetadata, Marker};
use crate::attachments::ExtractionRecord;
use crate::error::BundleError;

/// `aggregate.json`: everything a worker needs to enrich one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub uid: u32,
    pub message_id: Option<String>,
    pub subject: String,
    pub body: String,
    pub metadata: BundleMetadata,
    pub attachments: Vec<ExtractionRecord>,
}

/// Read subject, body, metadata and every extraction record, then write
/// `aggregate.json`. Requires the stage 1 marker.
pub async fn combine(bundle: &Bundle) -> Result<PathBuf, BundleError> {
    if !bundle.has_marker(Marker::Stage1).await? {
        return Err(BundleError::NotReady {
            dir: bundle.dir().to_path_buf(),
            marker: Marker::Stage1.file_name(),
        });
    }

    let metadata = bundle.read_metadata().await?;
    let record = AggregateRecord {
        uid: metadata.uid,
        message_id: metadata.message_id.clone(),
        subject: bundle.read_subject().await?,
        body: bundle.read_body().await?,
        attachments: bundle.read_extractions().await?,
        metadata,
    };

    let path = bundle.aggregate_path();
    let json = serde_json::to_vec_pretty(&record).map_err(|e| BundleError::Invalid {
        path: path.clone(),
        reason: e.to_string(),
    })?;

    // Rename so a reader never sees a half-written aggregate.
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &json).await?;
    fs::rename(&tmp, &path).await?;

    debug!(
        bundle = %bundle.dir().display(),
        attachments = record.attachments.len(),
        "Aggregate written"
    );
    Ok(path)
}

/// Combine and write the stage 2 marker.
pub async fn complete_stage2(bundle: &Bundle) -> Result<PathBuf, BundleError> {
    let path = combine(bundle).await?;
    bundle.mark(Marker::Stage2).await?;
    Ok(path)
}
