//! Bounded worker pool.
//!
//! At most `max_workers` tasks run at once. `submit` applies backpressure:
//! while the pool is full it waits `admission_interval` and tries again,
//! until a slot frees, the task's admission deadline passes, or the pool
//! shuts down.
//!
//! Each worker runs in its own task under a supervisor owned by the
//! coordinator. The supervisor removes the entry from the active set however
//! the worker ended (success, error, panic, abort) and publishes a
//! [`WorkerReport`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::TaskSubmitter;
use super::task::{WorkerDeps, WorkerTask, run_task};
use crate::config::{env_millis, env_parse, env_secs};
use crate::error::{ConfigError, ErrorClass, WorkerError};

/// Pool sizing and admission timing.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub max_workers: usize,
    /// Delay between admission attempts while the pool is full.
    pub admission_interval: Duration,
    /// How long a submitted task may wait for a slot.
    pub admission_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            admission_interval: Duration::from_secs(1),
            admission_timeout: Duration::from_secs(600),
        }
    }
}

impl WorkerPoolConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            max_workers: env_parse("INTAKE_MAX_WORKERS", 2usize)?,
            admission_interval: env_millis("INTAKE_ADMISSION_INTERVAL_MS", 1000)?,
            admission_timeout: env_secs("INTAKE_ADMISSION_TIMEOUT_SECS", 600)?,
        };
        if config.max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "INTAKE_MAX_WORKERS".into(),
                message: "at least one worker is required".into(),
            });
        }
        Ok(config)
    }
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Committed { location: String },
    Failed { class: ErrorClass, reason: String },
}

/// Published once per worker when it leaves the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub task_id: Uuid,
    pub bundle: PathBuf,
    pub outcome: WorkerOutcome,
}

impl WorkerReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, WorkerOutcome::Committed { .. })
    }
}

struct ActiveWorker {
    bundle: PathBuf,
    abort: AbortHandle,
}

type ActiveSet = Arc<Mutex<HashMap<Uuid, ActiveWorker>>>;

pub struct WorkerCoordinator {
    config: WorkerPoolConfig,
    deps: WorkerDeps,
    active: ActiveSet,
    reports: broadcast::Sender<WorkerReport>,
    shutdown: watch::Sender<bool>,
}

impl WorkerCoordinator {
    pub fn new(config: WorkerPoolConfig, deps: WorkerDeps) -> Self {
        let (reports, _) = broadcast::channel(64);
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            deps,
            active: Arc::new(Mutex::new(HashMap::new())),
            reports,
            shutdown,
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Receive a report for every worker that finishes from now on.
    pub fn reports(&self) -> broadcast::Receiver<WorkerReport> {
        self.reports.subscribe()
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Bundles currently being worked on.
    pub async fn active_bundles(&self) -> Vec<PathBuf> {
        self.active
            .lock()
            .await
            .values()
            .map(|w| w.bundle.clone())
            .collect()
    }

    /// Admit `task` as soon as a slot is free.
    pub async fn submit(&self, task: WorkerTask) -> Result<(), WorkerError> {
        let started = Instant::now();
        let mut shutdown = self.shutdown.subscribe();
        let mut attempts = 0u32;

        loop {
            if *shutdown.borrow() {
                return Err(WorkerError::ShuttingDown);
            }

            attempts += 1;
            {
                // Check and insert under one lock so the ceiling holds for
                // concurrent submitters.
                let mut active = self.active.lock().await;
                if active.len() < self.config.max_workers {
                    let abort = self.spawn_worker(task.clone());
                    active.insert(
                        task.id,
                        ActiveWorker {
                            bundle: task.bundle.clone(),
                            abort,
                        },
                    );
                    info!(
                        worker = %task.id,
                        bundle = %task.bundle.display(),
                        active = active.len(),
                        attempts,
                        "Worker admitted"
                    );
                    return Ok(());
                }
            }

            let now = Instant::now();
            if now >= task.deadline {
                warn!(worker = %task.id, bundle = %task.bundle.display(), "Admission deadline passed");
                return Err(WorkerError::AdmissionTimeout {
                    task_id: task.id,
                    waited: now - started,
                });
            }
            if attempts == 1 {
                debug!(worker = %task.id, "Pool full, waiting for a free slot");
            }

            let delay = self.config.admission_interval.min(task.deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Spawn the worker and its supervisor. The caller holds the active-set
    /// lock, so the supervisor's removal always happens after the insert.
    fn spawn_worker(&self, task: WorkerTask) -> AbortHandle {
        let deps = self.deps.clone();
        let worker_task = task.clone();
        let worker = tokio::spawn(async move { run_task(&worker_task, &deps).await });
        let abort = worker.abort_handle();

        let active = Arc::clone(&self.active);
        let reports = self.reports.clone();
        tokio::spawn(async move {
            let outcome = match worker.await {
                Ok(Ok(ack)) => WorkerOutcome::Committed {
                    location: ack.location,
                },
                Ok(Err(e)) => {
                    error!(worker = %task.id, bundle = %task.bundle.display(), class = %e.class(), error = %e, "Worker failed");
                    WorkerOutcome::Failed {
                        class: e.class(),
                        reason: e.to_string(),
                    }
                }
                Err(join) if join.is_panic() => {
                    let e = WorkerError::Panicked {
                        task_id: task.id,
                        reason: panic_message(join.into_panic()),
                    };
                    error!(worker = %task.id, bundle = %task.bundle.display(), error = %e, "Worker panicked");
                    WorkerOutcome::Failed {
                        class: e.class(),
                        reason: e.to_string(),
                    }
                }
                Err(_) => {
                    warn!(worker = %task.id, "Worker aborted");
                    WorkerOutcome::Failed {
                        class: WorkerError::ShuttingDown.class(),
                        reason: WorkerError::ShuttingDown.to_string(),
                    }
                }
            };

            let remaining = {
                let mut active = active.lock().await;
                active.remove(&task.id);
                active.len()
            };
            debug!(worker = %task.id, active = remaining, "Worker slot freed");

            // No subscribers is fine.
            let _ = reports.send(WorkerReport {
                task_id: task.id,
                bundle: task.bundle,
                outcome,
            });
        });

        abort
    }

    /// Refuse new admissions, fail pending ones, and abort running workers.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let active = self.active.lock().await;
        for (id, worker) in active.iter() {
            info!(worker = %id, bundle = %worker.bundle.display(), "Aborting worker");
            worker.abort.abort();
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
impl TaskSubmitter for WorkerCoordinator {
    async fn submit(&self, task: WorkerTask) -> Result<(), WorkerError> {
        WorkerCoordinator::submit(self, task).await
    }

    fn accepting(&self) -> bool {
        !*self.shutdown.borrow()
    }
}
