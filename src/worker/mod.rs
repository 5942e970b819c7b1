//! Worker offload.
//!
//! - `task`: [`WorkerTask`] and the worker entry point [`run_task`]
//! - `coordinator`: the bounded pool that admits tasks
//!
//! Producers only see [`TaskSubmitter`]; workers only see a bundle directory.

pub mod coordinator;
pub mod task;

use async_trait::async_trait;

pub use coordinator::{WorkerCoordinator, WorkerOutcome, WorkerPoolConfig, WorkerReport};
pub use task::{WorkerDeps, WorkerTask, run_task};

use crate::error::WorkerError;

/// Hands a finished bundle to the worker side.
#[async_trait]
pub trait TaskSubmitter: Send + Sync {
    /// Resolves once the task is admitted (not when it finishes).
    async fn submit(&self, task: WorkerTask) -> Result<(), WorkerError>;

    /// False once the worker side refuses new work for good.
    fn accepting(&self) -> bool {
        true
    }
}
