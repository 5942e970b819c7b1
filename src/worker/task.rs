//! Worker task and the worker entry point.
//!
//! A worker knows nothing about the mailbox or the processor: it gets a
//! bundle directory, waits for both stage markers, then enriches and
//! commits. The same function backs pool workers and the standalone
//! `enrich` command.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bundle::{Bundle, Marker, ReadinessConfig, await_file};
use crate::error::WorkerError;
use crate::llm::{EnrichOutcome, Enricher};
use crate::retry::RetryPolicy;
use crate::sink::{CommitAck, CommitSink};

/// A bundle waiting for (or holding) a worker slot.
#[derive(Debug, Clone)]
pub struct WorkerTask {
    pub id: Uuid,
    pub bundle: PathBuf,
    /// Admission must happen before this instant.
    pub deadline: Instant,
}

impl WorkerTask {
    pub fn new(bundle: impl Into<PathBuf>, admission_timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            bundle: bundle.into(),
            deadline: Instant::now() + admission_timeout,
        }
    }
}

/// Collaborators a worker needs.
#[derive(Clone)]
pub struct WorkerDeps {
    pub enricher: Arc<dyn Enricher>,
    pub sink: Arc<dyn CommitSink>,
    pub readiness: ReadinessConfig,
    pub retry: RetryPolicy,
}

/// Run one task: readiness → enrich → persist offer → commit.
///
/// The outcome is recorded in the bundle: the `committed` marker on success,
/// `worker-error.txt` on failure.
pub async fn run_task(task: &WorkerTask, deps: &WorkerDeps) -> Result<CommitAck, WorkerError> {
    let bundle = Bundle::new(&task.bundle);
    let result = run_stages(task, &bundle, deps).await;

    let recorded = match &result {
        Ok(_) => match bundle.clear_worker_error().await {
            Ok(()) => bundle.mark(Marker::Committed).await,
            Err(e) => Err(e),
        },
        Err(e) => bundle.write_worker_error(&e.to_string()).await,
    };
    if let Err(e) = recorded {
        warn!(worker = %task.id, bundle = %task.bundle.display(), error = %e, "Could not record worker outcome");
    }
    result
}

async fn run_stages(task: &WorkerTask, bundle: &Bundle, deps: &WorkerDeps) -> Result<CommitAck, WorkerError> {
    for marker in [Marker::Stage1, Marker::Stage2] {
        let polls = await_file(&bundle.marker_path(marker), &deps.readiness).await?;
        debug!(worker = %task.id, marker = marker.file_name(), polls, "Marker observed");
    }

    let aggregate = bundle.read_aggregate().await?;

    let outcome = deps
        .retry
        .run("enrich", || deps.enricher.enrich(&aggregate))
        .await
        .map_err(|e| WorkerError::Enrichment {
            attempts: e.attempts(),
            source: e.into_inner(),
        })?;
    let offer = match outcome {
        EnrichOutcome::Offer(offer) => offer,
        EnrichOutcome::Refused(reason) => return Err(WorkerError::Refused { reason }),
    };

    let offer_path = bundle.write_offer(&offer).await?;
    debug!(worker = %task.id, path = %offer_path.display(), "Offer persisted");

    let ack = deps
        .retry
        .run("commit", || deps.sink.commit(&offer))
        .await
        .map_err(|e| WorkerError::Commit {
            attempts: e.attempts(),
            source: e.into_inner(),
        })?;

    info!(
        worker = %task.id,
        uid = aggregate.uid,
        location = %ack.location,
        "Offer committed"
    );
    Ok(ack)
}
