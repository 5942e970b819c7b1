//! On-disk message bundles.
//!
//! One directory per message, keyed by the provider UID:
//! - `subject.txt`, `body.txt`, `metadata.json`
//! - `attachments/<name>`: raw attachment bytes
//! - `extracted/<name>.json`: one extraction record per attachment
//! - `stage1-complete`, `stage2-complete`: empty marker files
//! - `aggregate.json`: combined record read by workers
//! - `acknowledged`: marker written once the message is marked consumed
//! - `offer.json`: enrichment output, written by the worker
//! - `committed`: marker written by the worker after the commit succeeded
//! - `worker-error.txt`: why the last worker run failed
//!
//! A bundle that is acknowledged but neither committed nor failed has never
//! finished a worker run and is handed to the pool again.
//!
//! This layout is the only contract between the message processor and the
//! workers, so it must stay stable across restarts.

pub mod combine;
pub mod readiness;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

pub use combine::{AggregateRecord, combine, complete_stage2};
pub use readiness::{ReadinessConfig, await_file};

use crate::attachments::ExtractionRecord;
use crate::error::BundleError;

/// Well-known bundle file names.
pub mod paths {
    pub const SUBJECT: &str = "subject.txt";
    pub const BODY: &str = "body.txt";
    pub const METADATA: &str = "metadata.json";
    pub const ATTACHMENTS: &str = "attachments";
    pub const EXTRACTED: &str = "extracted";
    pub const AGGREGATE: &str = "aggregate.json";
    pub const OFFER: &str = "offer.json";
    pub const WORKER_ERROR: &str = "worker-error.txt";
}

/// Stage completion markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// Every attachment extraction has settled.
    Stage1,
    /// The aggregate record has been written.
    Stage2,
    /// The message was marked consumed in the mailbox.
    Acknowledged,
    /// The enriched offer reached the sink.
    Committed,
}

impl Marker {
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Stage1 => "stage1-complete",
            Self::Stage2 => "stage2-complete",
            Self::Acknowledged => "acknowledged",
            Self::Committed => "committed",
        }
    }
}

/// Summary of the message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentSummary {
    pub subject: String,
    pub body_preview: String,
    pub body_chars: usize,
}

/// One attachment as listed in the metadata descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentSummary {
    pub filename: String,
    pub mime_type: String,
    pub extension: Option<String>,
    pub allowed: bool,
    pub size: usize,
}

/// `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub uid: u32,
    pub message_id: Option<String>,
    pub from: Option<String>,
    pub date: Option<String>,
    pub content: ContentSummary,
    pub attachments: Vec<AttachmentSummary>,
}

const BODY_PREVIEW_CHARS: usize = 200;

impl ContentSummary {
    pub fn new(subject: &str, body: &str) -> Self {
        Self {
            subject: subject.to_string(),
            body_preview: body.chars().take(BODY_PREVIEW_CHARS).collect(),
            body_chars: body.chars().count(),
        }
    }
}

/// Root directory holding every bundle.
#[derive(Debug, Clone)]
pub struct BundleStore {
    root: PathBuf,
}

impl BundleStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the bundle root if it is missing.
    pub async fn ensure_root(&self) -> Result<(), BundleError> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Directory for message `uid`.
    pub fn dir_for(&self, uid: u32) -> PathBuf {
        self.root.join(uid.to_string())
    }

    /// Open the bundle for `uid`, creating it and clearing markers and
    /// outputs left behind by an earlier, failed attempt.
    pub async fn open_fresh(&self, uid: u32) -> Result<Bundle, BundleError> {
        let bundle = Bundle::new(self.dir_for(uid));
        fs::create_dir_all(bundle.dir.join(paths::ATTACHMENTS)).await?;
        bundle.clear_stale().await?;
        fs::create_dir_all(bundle.dir.join(paths::EXTRACTED)).await?;
        Ok(bundle)
    }

    /// Every bundle directory under the root, ordered by name.
    pub async fn list(&self) -> Result<Vec<Bundle>, BundleError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs.into_iter().map(Bundle::new).collect())
    }

    /// Delete every bundle.
    pub async fn remove_all(&self) -> Result<(), BundleError> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Handle to one bundle directory.
#[derive(Debug, Clone)]
pub struct Bundle {
    dir: PathBuf,
}

impl Bundle {
    /// Wrap an existing bundle directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn marker_path(&self, marker: Marker) -> PathBuf {
        self.dir.join(marker.file_name())
    }

    pub fn aggregate_path(&self) -> PathBuf {
        self.dir.join(paths::AGGREGATE)
    }

    pub fn offer_path(&self) -> PathBuf {
        self.dir.join(paths::OFFER)
    }

    pub fn extracted_dir(&self) -> PathBuf {
        self.dir.join(paths::EXTRACTED)
    }

    pub async fn has_marker(&self, marker: Marker) -> Result<bool, BundleError> {
        Ok(fs::try_exists(self.marker_path(marker)).await?)
    }

    /// Write an empty marker file.
    pub async fn mark(&self, marker: Marker) -> Result<(), BundleError> {
        fs::write(self.marker_path(marker), b"").await?;
        Ok(())
    }

    async fn clear_stale(&self) -> Result<(), BundleError> {
        for marker in [Marker::Committed, Marker::Acknowledged, Marker::Stage2, Marker::Stage1] {
            remove_if_exists(&self.marker_path(marker)).await?;
        }
        remove_if_exists(&self.dir.join(paths::WORKER_ERROR)).await?;
        remove_if_exists(&self.offer_path()).await?;
        remove_if_exists(&self.aggregate_path()).await?;
        match fs::remove_dir_all(self.extracted_dir()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_subject(&self, subject: &str) -> Result<(), BundleError> {
        fs::write(self.dir.join(paths::SUBJECT), subject).await?;
        Ok(())
    }

    pub async fn write_body(&self, body: &str) -> Result<(), BundleError> {
        fs::write(self.dir.join(paths::BODY), body).await?;
        Ok(())
    }

    pub async fn read_subject(&self) -> Result<String, BundleError> {
        self.read_required(paths::SUBJECT).await
    }

    pub async fn read_body(&self) -> Result<String, BundleError> {
        self.read_required(paths::BODY).await
    }

    pub async fn write_metadata(&self, metadata: &BundleMetadata) -> Result<(), BundleError> {
        self.write_json(&self.dir.join(paths::METADATA), metadata).await
    }

    pub async fn read_metadata(&self) -> Result<BundleMetadata, BundleError> {
        self.read_json(&self.dir.join(paths::METADATA)).await
    }

    /// Persist raw attachment bytes, returning the file path.
    pub async fn write_attachment(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf, BundleError> {
        let path = self.dir.join(paths::ATTACHMENTS).join(filename);
        fs::write(&path, bytes).await?;
        Ok(path)
    }

    /// Persist one extraction record.
    pub async fn write_extraction(&self, record: &ExtractionRecord) -> Result<PathBuf, BundleError> {
        let path = self.extracted_dir().join(format!("{}.json", record.filename));
        self.write_json(&path, record).await?;
        Ok(path)
    }

    /// All extraction records, ordered by file name.
    pub async fn read_extractions(&self) -> Result<Vec<ExtractionRecord>, BundleError> {
        let dir = self.extracted_dir();
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".json") {
                names.push(name);
            }
        }
        names.sort();

        let mut records = Vec::with_capacity(names.len());
        for name in names {
            records.push(self.read_json(&dir.join(name)).await?);
        }
        Ok(records)
    }

    pub async fn read_aggregate(&self) -> Result<AggregateRecord, BundleError> {
        self.read_json(&self.aggregate_path()).await
    }

    pub async fn write_offer<T: Serialize>(&self, offer: &T) -> Result<PathBuf, BundleError> {
        let path = self.offer_path();
        self.write_json(&path, offer).await?;
        Ok(path)
    }

    /// Record why a worker run failed.
    pub async fn write_worker_error(&self, reason: &str) -> Result<(), BundleError> {
        fs::write(self.dir.join(paths::WORKER_ERROR), reason).await?;
        Ok(())
    }

    /// Drop the failure note left by an earlier run.
    pub async fn clear_worker_error(&self) -> Result<(), BundleError> {
        remove_if_exists(&self.dir.join(paths::WORKER_ERROR)).await
    }

    pub async fn has_worker_error(&self) -> Result<bool, BundleError> {
        Ok(fs::try_exists(self.dir.join(paths::WORKER_ERROR)).await?)
    }

    /// Acknowledged, but no worker run has finished for it yet.
    pub async fn awaiting_worker(&self) -> Result<bool, BundleError> {
        Ok(self.has_marker(Marker::Acknowledged).await?
            && !self.has_marker(Marker::Committed).await?
            && !self.has_worker_error().await?)
    }

    async fn read_required(&self, name: &str) -> Result<String, BundleError> {
        let path = self.dir.join(name);
        match fs::read_to_string(&path).await {
            Ok(s) => Ok(s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BundleError::MissingArtifact { path })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<T, BundleError> {
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BundleError::MissingArtifact {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw).map_err(|e| BundleError::Invalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    async fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<(), BundleError> {
        let json = serde_json::to_vec_pretty(value).map_err(|e| BundleError::Invalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        fs::write(path, json).await?;
        Ok(())
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), BundleError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
