use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::EngineSettings;
use super::accessor::{Desired, Observation, Snapshot, load_snapshot};
use super::aggregator::{aggregate, invalid_spec, same_ignoring_timestamps};
use super::clock::{Clock, SystemClock};
use super::driver::Driver;
use super::error::EngineError;
use super::guarded;
use super::locks::KeyedLocks;
use super::model::{AppId, Application, ComponentKey};
use super::planner::plan;
use crate::collaborators::{AppStore, CollaboratorError, JobBackend, WorkloadBackend};
use crate::crd::virtool_app::{ComponentStatus, VirtoolAppStatus};

pub use super::driver::Transition;

/// What one reconcile did and when it wants to run again.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// `None` means wait for the next external change
    pub requeue: Option<Duration>,
    pub transitions: Vec<Transition>,
    pub status_written: bool,
}

enum Cycle {
    Done(ReconcileReport),
    Conflict(String),
}

/// Level-triggered reconciler for `VirtoolApp`s. Holds no per-application
/// state between calls; everything needed to resume lives in the persisted
/// status and the collaborators.
pub struct Reconciler<S, W, J> {
    store: Arc<S>,
    workloads: Arc<W>,
    jobs: Arc<J>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    locks: KeyedLocks,
    limiter: Semaphore,
}

impl<S, W, J> Reconciler<S, W, J>
where
    S: AppStore,
    W: WorkloadBackend,
    J: JobBackend,
{
    pub fn new(store: Arc<S>, workloads: Arc<W>, jobs: Arc<J>, settings: EngineSettings) -> Self {
        let permits = settings.max_concurrent_reconciles.max(1);
        Self {
            store,
            workloads,
            jobs,
            clock: Arc::new(SystemClock),
            settings,
            locks: KeyedLocks::new(),
            limiter: Semaphore::new(permits),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Run one full snapshot, plan, drive, aggregate and persist cycle for
    /// `id`. Safe to call any number of times, concurrently too: calls for
    /// the same application are serialized.
    #[instrument(skip_all, fields(app = %id))]
    pub async fn reconcile(
        &self,
        id: &AppId,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport, EngineError> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            permit = self.limiter.acquire() => permit.map_err(|_| EngineError::Cancelled)?,
        };
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            guard = self.locks.lock(id) => guard,
        };

        let attempts = self.settings.status_write_attempts.max(1);
        for attempt in 1..=attempts {
            match self.cycle(id, cancel).await? {
                Cycle::Done(report) => return Ok(report),
                Cycle::Conflict(msg) => {
                    debug!(attempt, %msg, "status write lost a race; re-reading");
                }
            }
        }
        warn!(attempts, "giving up on status write for this cycle");
        Err(EngineError::ConflictRetriesExhausted { attempts })
    }

    async fn cycle(&self, id: &AppId, cancel: &CancellationToken) -> Result<Cycle, EngineError> {
        let now = self.clock.now();
        let Some(snap) = load_snapshot(&*self.store, &*self.workloads, id, cancel).await? else {
            return Ok(Cycle::Done(ReconcileReport::default()));
        };

        let (next, transitions, requeue) = match &snap.desired {
            Desired::Invalid(err) => {
                warn!(error = %err, "reconciliation halted until the spec changes");
                (invalid_spec(&snap.status, err, snap.generation, now), Vec::new(), None)
            }
            Desired::Valid(app) => self.advance(app, &snap, now, cancel).await?,
        };
        let requeue = requeue.or(self.settings.resync);

        if same_ignoring_timestamps(&snap.status, &next) {
            debug!("status unchanged; skipping write");
            return Ok(Cycle::Done(ReconcileReport {
                requeue,
                transitions,
                status_written: false,
            }));
        }

        match guarded(cancel, self.store.update_status(id, &next, &snap.token)).await? {
            Ok(_) => {
                if !transitions.is_empty() {
                    info!(count = transitions.len(), "status written");
                }
                Ok(Cycle::Done(ReconcileReport {
                    requeue,
                    transitions,
                    status_written: true,
                }))
            }
            Err(CollaboratorError::Conflict(msg)) => Ok(Cycle::Conflict(msg)),
            Err(CollaboratorError::NotFound(_)) => {
                debug!("application deleted mid-cycle");
                Ok(Cycle::Done(ReconcileReport::default()))
            }
            Err(e) => Err(EngineError::Transient(e)),
        }
    }

    async fn advance(
        &self,
        app: &Application,
        snap: &Snapshot,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<(VirtoolAppStatus, Vec<Transition>, Option<Duration>), EngineError> {
        let (retained, mut requeue) = self.collect_garbage(app, &snap.status, cancel).await?;

        let plan = plan(app, &snap.status.component_status, &snap.observed, now);
        let driver = Driver {
            workloads: &*self.workloads,
            jobs: &*self.jobs,
            app,
            settings: &self.settings,
            now,
            cancel,
        };
        let unobserved = Observation::Unreadable("not observed".into());
        let mut components = BTreeMap::new();
        let mut transitions = Vec::new();
        for entry in &plan.entries {
            let Some(desired) = app.component(&entry.component) else {
                continue;
            };
            let observation = snap.observed.get(&entry.component).unwrap_or(&unobserved);
            let prev = snap.status.component_status.get(&entry.component);
            let driven = driver.drive(desired, prev, observation, &entry.decision).await?;
            requeue = sooner(requeue, driven.requeue);
            transitions.extend(driven.transition);
            components.insert(entry.component.clone(), driven.status);
        }

        let mut next = aggregate(&snap.status, app, components, now);
        next.component_status.extend(retained);
        Ok((next, transitions, requeue))
    }

    /// Delete workloads of components no longer declared. Entries whose
    /// delete failed are handed back so their status survives until a later
    /// cycle succeeds.
    async fn collect_garbage(
        &self,
        app: &Application,
        status: &VirtoolAppStatus,
        cancel: &CancellationToken,
    ) -> Result<(BTreeMap<String, ComponentStatus>, Option<Duration>), EngineError> {
        let mut retained = BTreeMap::new();
        let mut requeue = None;
        for (name, st) in &status.component_status {
            if app.component(name).is_some() {
                continue;
            }
            let key = ComponentKey::new(&app.id, name);
            match guarded(cancel, self.workloads.delete(&key)).await? {
                Ok(()) => info!(component = %name, "component removed; workload deleted"),
                Err(e) => {
                    warn!(component = %name, error = %e, "could not delete workload of removed component");
                    retained.insert(name.clone(), st.clone());
                    requeue = Some(self.settings.transient_requeue);
                }
            }
        }
        Ok((retained, requeue))
    }
}

fn sooner(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
