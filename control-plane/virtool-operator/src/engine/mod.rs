//! The reconciliation engine: snapshot, plan, advance, aggregate, persist.

pub mod accessor;
pub mod admission;
pub mod aggregator;
pub mod backoff;
pub mod clock;
pub mod driver;
pub mod error;
pub mod job_gate;
pub mod locks;
pub mod model;
pub mod planner;
pub mod reconciler;

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::collaborators::CollaboratorError;
pub use backoff::Backoff;
pub use error::{EngineError, SpecError};
pub use model::{AppId, Application, ComponentKey};
pub use reconciler::{ReconcileReport, Reconciler, Transition};

#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// Requeue while anything is mid-update or waiting on order
    pub progress_requeue: Duration,
    /// Requeue after a collaborator call failed
    pub transient_requeue: Duration,
    /// Periodic requeue once converged; `None` waits for a change
    pub resync: Option<Duration>,
    pub backoff: Backoff,
    /// Status write attempts per reconcile before giving up on conflicts
    pub status_write_attempts: u32,
    pub job_deadline: Duration,
    pub rollout_deadline: Duration,
    pub max_concurrent_reconciles: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            progress_requeue: Duration::from_secs(5),
            transient_requeue: Duration::from_secs(10),
            resync: None,
            backoff: Backoff::default(),
            status_write_attempts: 3,
            job_deadline: Duration::from_secs(1800),
            rollout_deadline: Duration::from_secs(600),
            max_concurrent_reconciles: 4,
        }
    }
}

/// Run a collaborator call unless `cancel` fires first.
pub(crate) async fn guarded<T, F>(
    cancel: &CancellationToken,
    call: F,
) -> Result<Result<T, CollaboratorError>, EngineError>
where
    F: Future<Output = Result<T, CollaboratorError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        res = call => Ok(res),
    }
}
