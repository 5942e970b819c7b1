//! Message processor: one bundle per message.
//!
//! Flow for each unconsumed message:
//! 1. Open a fresh bundle directory keyed by UID
//! 2. Persist subject and body
//! 3. Fetch and persist each allowed attachment, extracting concurrently
//! 4. Persist the metadata descriptor
//! 5. Wait for every extraction to settle, then mark stage 1
//! 6. Combine into the aggregate record, then mark stage 2
//! 7. Acknowledge the message only if every attachment succeeded
//! 8. Hand the bundle to the worker side without waiting for admission
//!
//! **Invariant: a message is never acknowledged while any stage failed.**
//! Unacknowledged messages stay in the backlog and get a fresh bundle on the
//! next scan. Acknowledged bundles that never finished a worker run (the
//! pool refused them, or the process stopped first) are handed off again at
//! the end of every scan.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::attachments::{AttachmentPipeline, FilenameSanitizer, classify, extension_for_mime};
use crate::bundle::{AttachmentSummary, BundleMetadata, BundleStore, ContentSummary, Marker, complete_stage2};
use crate::error::{Error, ErrorClass, MailboxError, Result, WorkerError};
use crate::mailbox::{MailboxSession, MessageRef};
use crate::worker::{TaskSubmitter, WorkerTask};

/// Counts from one backlog scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub found: usize,
    pub acknowledged: usize,
    /// Bundles written but left unacknowledged because an attachment failed.
    pub incomplete: usize,
    /// Messages that failed before their bundle was complete.
    pub failed: usize,
    /// Complete bundles left unconsumed because the worker side is stopping.
    pub deferred: usize,
    /// Acknowledged bundles handed to the worker side again.
    pub requeued: usize,
}

/// What happened to one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Acknowledged and handed to the worker side.
    Acknowledged { bundle: PathBuf },
    /// Left unconsumed for the next scan.
    Incomplete { bundle: PathBuf, failed_attachments: usize },
    /// Complete, but left unconsumed because the worker side is stopping.
    Deferred { bundle: PathBuf },
}

pub struct MessageProcessor {
    store: BundleStore,
    attachments: Arc<AttachmentPipeline>,
    submitter: Arc<dyn TaskSubmitter>,
    admission_timeout: Duration,
    filenames: FilenameSanitizer,
    /// Bundles given to the submitter whose worker run has not finished.
    handed_off: Arc<Mutex<HashSet<PathBuf>>>,
    // One scan at a time; concurrent scans could submit a message twice
    // before its acknowledgment lands.
    scan_guard: Mutex<()>,
}

impl MessageProcessor {
    pub fn new(
        store: BundleStore,
        attachments: Arc<AttachmentPipeline>,
        submitter: Arc<dyn TaskSubmitter>,
        admission_timeout: Duration,
    ) -> Self {
        Self {
            store,
            attachments,
            submitter,
            admission_timeout,
            filenames: FilenameSanitizer::new(),
            handed_off: Arc::new(Mutex::new(HashSet::new())),
            scan_guard: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &BundleStore {
        &self.store
    }

    /// Process every unconsumed message, oldest first.
    ///
    /// Per-message failures are logged and counted. A connectivity failure
    /// aborts the scan so the caller can reconnect.
    pub async fn process_backlog(
        &self,
        session: &mut dyn MailboxSession,
    ) -> std::result::Result<ScanReport, MailboxError> {
        let _guard = self.scan_guard.lock().await;

        let messages = session.list_unconsumed().await?;
        let mut report = ScanReport {
            found: messages.len(),
            ..Default::default()
        };
        if messages.is_empty() {
            debug!("No unconsumed messages");
        } else {
            info!(count = messages.len(), "Processing backlog");
        }

        for (done, message) in messages.iter().enumerate() {
            if !self.submitter.accepting() {
                info!(remaining = messages.len() - done, "Worker side is stopping, ending scan");
                break;
            }
            match self.process_one(session, message).await {
                Ok(MessageOutcome::Acknowledged { .. }) => report.acknowledged += 1,
                Ok(MessageOutcome::Incomplete { .. }) => report.incomplete += 1,
                Ok(MessageOutcome::Deferred { .. }) => report.deferred += 1,
                Err(Error::Mailbox(e)) if e.class() == ErrorClass::ConnectivityFailure => {
                    error!(uid = message.uid, error = %e, "Connection lost while processing message");
                    return Err(e);
                }
                Err(e) => {
                    error!(uid = message.uid, error = %e, "Failed to process message");
                    report.failed += 1;
                }
            }
        }

        report.requeued = self.requeue_unfinished().await;

        if report != ScanReport::default() {
            info!(
                found = report.found,
                acknowledged = report.acknowledged,
                incomplete = report.incomplete,
                failed = report.failed,
                deferred = report.deferred,
                requeued = report.requeued,
                "Backlog processed"
            );
        }
        Ok(report)
    }

    /// Hand off every acknowledged bundle that has no finished worker run and
    /// is not already with the submitter. Returns how many were handed off.
    async fn requeue_unfinished(&self) -> usize {
        if !self.submitter.accepting() {
            return 0;
        }
        let bundles = match self.store.list().await {
            Ok(bundles) => bundles,
            Err(e) => {
                warn!(error = %e, "Could not list bundles");
                return 0;
            }
        };

        let mut requeued = 0;
        for bundle in bundles {
            let dir = bundle.dir().to_path_buf();
            match bundle.awaiting_worker().await {
                Ok(true) => {
                    if self.hand_off(dir.clone()).await {
                        info!(bundle = %dir.display(), "Re-queued bundle without a finished worker run");
                        requeued += 1;
                    }
                }
                Ok(false) => {
                    self.handed_off.lock().await.remove(&dir);
                }
                Err(e) => warn!(bundle = %dir.display(), error = %e, "Could not inspect bundle"),
            }
        }
        requeued
    }

    /// Submit `dir` in the background. Returns false if it is already handed
    /// off. A refused submission is forgotten so a later scan retries it.
    async fn hand_off(&self, dir: PathBuf) -> bool {
        if !self.handed_off.lock().await.insert(dir.clone()) {
            return false;
        }

        let submitter = Arc::clone(&self.submitter);
        let handed_off = Arc::clone(&self.handed_off);
        let task = WorkerTask::new(&dir, self.admission_timeout);
        tokio::spawn(async move {
            let Err(e) = submitter.submit(task).await else {
                return;
            };
            handed_off.lock().await.remove(&dir);
            match e {
                WorkerError::ShuttingDown => {
                    info!(bundle = %dir.display(), "Worker side stopped; bundle left for the next start");
                }
                e => {
                    error!(bundle = %dir.display(), error = %e, "Worker submission failed; will retry on the next scan");
                }
            }
        });
        true
    }

    /// Run one message through the whole pipeline.
    pub async fn process_one(
        &self,
        session: &mut dyn MailboxSession,
        message: &MessageRef,
    ) -> Result<MessageOutcome> {
        let uid = message.uid;
        info!(uid, message_id = ?message.message_id, "Processing message");

        let bundle = self.store.open_fresh(uid).await?;
        let content = session.fetch_content(message).await?;
        bundle.write_subject(&content.subject).await?;
        bundle.write_body(&content.body).await?;

        let mut summaries = Vec::with_capacity(message.parts.len());
        let mut used_names = HashSet::new();
        let mut extractions = Vec::new();
        let mut failed = 0usize;

        for part in &message.parts {
            let filename = unique_name(&mut used_names, self.filenames.decode(part.filename.as_deref()));
            let classification = classify(&filename, &part.content_type);
            let extension = classification
                .extension
                .clone()
                .or_else(|| extension_for_mime(&part.content_type).map(str::to_string));

            summaries.push(AttachmentSummary {
                filename: filename.clone(),
                mime_type: part.content_type.clone(),
                extension: extension.clone(),
                allowed: classification.allowed,
                size: part.size,
            });

            if !classification.allowed {
                info!(uid, file = %filename, mime = %part.content_type, "Skipping disallowed attachment");
                continue;
            }

            let bytes = match session.fetch_part(message, part.index).await {
                Ok(bytes) => bytes,
                Err(e) if e.class() == ErrorClass::ConnectivityFailure => {
                    // Let already-started extractions finish before bailing.
                    join_all(extractions).await;
                    return Err(e.into());
                }
                Err(e) => {
                    error!(uid, file = %filename, error = %e, "Failed to fetch attachment");
                    failed += 1;
                    continue;
                }
            };

            let path = match bundle.write_attachment(&filename, &bytes).await {
                Ok(path) => path,
                Err(e) => {
                    error!(uid, file = %filename, error = %e, "Failed to save attachment");
                    failed += 1;
                    continue;
                }
            };
            debug!(uid, file = %filename, bytes = bytes.len(), "Attachment saved");

            let pipeline = Arc::clone(&self.attachments);
            let bundle = bundle.clone();
            let extension = extension.unwrap_or_default();
            extractions.push(tokio::spawn(async move {
                pipeline.extract_into(&bundle, &path, &extension).await
            }));
        }

        let metadata = BundleMetadata {
            uid,
            message_id: message.message_id.clone(),
            from: content.from.clone(),
            date: content.date.clone(),
            content: ContentSummary::new(&content.subject, &content.body),
            attachments: summaries,
        };
        let metadata_written = bundle.write_metadata(&metadata).await;

        let attempted = extractions.len();
        for settled in join_all(extractions).await {
            match settled {
                Ok(record) if record.succeeded() => {}
                Ok(record) => {
                    warn!(uid, file = %record.filename, "Attachment extraction failed");
                    failed += 1;
                }
                Err(e) => {
                    error!(uid, error = %e, "Extraction task did not complete");
                    failed += 1;
                }
            }
        }
        metadata_written?;

        bundle.mark(Marker::Stage1).await?;
        debug!(uid, attachments = attempted, "Stage 1 complete");
        complete_stage2(&bundle).await?;
        debug!(uid, "Stage 2 complete");

        let dir = bundle.dir().to_path_buf();
        if failed > 0 {
            warn!(
                uid,
                failed,
                bundle = %dir.display(),
                "Leaving message unconsumed after attachment failures"
            );
            return Ok(MessageOutcome::Incomplete {
                bundle: dir,
                failed_attachments: failed,
            });
        }

        if !self.submitter.accepting() {
            info!(uid, bundle = %dir.display(), "Worker side is stopping, leaving message unconsumed");
            return Ok(MessageOutcome::Deferred { bundle: dir });
        }

        session.acknowledge(uid).await?;
        info!(uid, bundle = %dir.display(), "Message acknowledged");
        if let Err(e) = bundle.mark(Marker::Acknowledged).await {
            // Without the marker a refused hand-off is not retried by later scans.
            warn!(uid, bundle = %dir.display(), error = %e, "Could not mark bundle acknowledged");
        }

        self.hand_off(dir.clone()).await;
        Ok(MessageOutcome::Acknowledged { bundle: dir })
    }
}

/// `name`, or `name (n).ext` if an earlier part of the message already used it.
fn unique_name(used: &mut HashSet<String>, name: String) -> String {
    if used.insert(name.clone()) {
        return name;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
        _ => (name.clone(), String::new()),
    };
    (2u32..)
        .map(|n| format!("{stem} ({n}){ext}"))
        .find(|candidate| used.insert(candidate.clone()))
        .unwrap_or(name)
}
