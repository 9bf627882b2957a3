use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::EngineSettings;
use super::accessor::Observation;
use super::admission::{RolloutPlan, next_target_replicas};
use super::clock::{format_time, parse_time};
use super::error::EngineError;
use super::guarded;
use super::job_gate::{GateOutcome, JobGate};
use super::model::{Application, ComponentDesired, ComponentKey, ComponentObserved, JobPhase};
use super::planner::{Decision, Hold, Step};
use crate::collaborators::{JobBackend, WorkloadBackend, WorkloadTarget};
use crate::crd::virtool_app::{ComponentPhase, ComponentStatus, UpdateStep};

/// A component phase change made during one cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub component: String,
    /// `None` when the component had no status before
    pub from: Option<ComponentPhase>,
    pub to: ComponentPhase,
    pub message: Option<String>,
}

/// New status for one component plus when it wants to be looked at again.
#[derive(Clone, Debug)]
pub struct Driven {
    pub status: ComponentStatus,
    pub transition: Option<Transition>,
    pub requeue: Option<Duration>,
}

/// Advances one component's state machine by the step the planner chose.
pub struct Driver<'a, W: ?Sized, J: ?Sized> {
    pub workloads: &'a W,
    pub jobs: &'a J,
    pub app: &'a Application,
    pub settings: &'a EngineSettings,
    pub now: DateTime<Utc>,
    pub cancel: &'a CancellationToken,
}

struct Work<'d> {
    desired: &'d ComponentDesired,
    status: ComponentStatus,
    requeue: Option<Duration>,
}

impl<W, J> Driver<'_, W, J>
where
    W: WorkloadBackend + ?Sized,
    J: JobBackend + ?Sized,
{
    /// Apply `decision` to a copy of the previous status. A collaborator
    /// failure keeps the previous status apart from its message; only
    /// cancellation is returned as an error.
    pub async fn drive(
        &self,
        desired: &ComponentDesired,
        prev: Option<&ComponentStatus>,
        observation: &Observation,
        decision: &Decision,
    ) -> Result<Driven, EngineError> {
        let mut base = prev.cloned().unwrap_or_else(|| ComponentStatus {
            desired_version: desired.version.clone(),
            ..Default::default()
        });
        if let Observation::Seen(o) = observation {
            base.ready_replicas = o.ready_replicas;
            base.updated_replicas = o.updated_replicas;
        }
        let mut work = Work {
            desired,
            status: base.clone(),
            requeue: None,
        };

        match decision {
            Decision::Settled => {
                work.enter(ComponentPhase::Converged, self.now);
                work.status.message = None;
            }
            Decision::Hold(hold) => self.hold(&mut work, hold),
            Decision::Advance(step) => {
                let o = match observation {
                    Observation::Seen(o) => o.clone(),
                    Observation::Unreadable(_) => ComponentObserved::absent(),
                };
                match self.step(&mut work, step, &o).await {
                    Ok(()) => {}
                    Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                    // repeating the same request fails the same way
                    Err(EngineError::Transient(e)) if !e.is_transient() => {
                        let failed = match work.status.phase {
                            ComponentPhase::PreJob => UpdateStep::PreJob,
                            ComponentPhase::PostJob => UpdateStep::PostJob,
                            _ => UpdateStep::Updating,
                        };
                        self.fail(&mut work, failed, e.to_string());
                    }
                    Err(e) => {
                        warn!(component = %desired.name, step = ?step, error = %e, "step failed; will retry");
                        work.status = base;
                        work.status.message = Some(e.to_string());
                        work.requeue = Some(self.settings.transient_requeue);
                    }
                }
            }
        }

        let from = prev.map(|p| p.phase);
        let transition = (from != Some(work.status.phase)).then(|| Transition {
            component: desired.name.clone(),
            from,
            to: work.status.phase,
            message: work.status.message.clone(),
        });
        if let Some(t) = &transition {
            info!(component = %t.component, from = ?t.from, to = %t.to, "phase transition");
        }
        Ok(Driven {
            status: work.status,
            transition,
            requeue: work.requeue,
        })
    }

    fn hold(&self, work: &mut Work<'_>, hold: &Hold) {
        match hold {
            Hold::Unobservable(msg) => {
                work.requeue = Some(self.settings.transient_requeue);
                work.status.message = Some(format!("workload unobservable: {}", msg));
                work.enter(ComponentPhase::Unknown, self.now);
            }
            Hold::Backoff { remaining } => {
                work.requeue = Some(*remaining);
                if work.refail(self.now) {
                    work.status.message = Some("retry pending after failure".to_string());
                }
            }
            Hold::OrderBlocked { waiting_on } => {
                debug!(component = %work.desired.name, ?waiting_on, "held by update order");
                work.status.message = Some(format!("waiting for {}", waiting_on.join(", ")));
                work.requeue = Some(self.settings.progress_requeue);
                work.park(self.now);
            }
            Hold::Admission(msg) => {
                debug!(component = %work.desired.name, %msg, "held by rollout bounds");
                work.status.message = Some(msg.clone());
                work.requeue = Some(self.settings.progress_requeue);
                work.park(self.now);
            }
        }
    }

    async fn step(
        &self,
        work: &mut Work<'_>,
        step: &Step,
        o: &ComponentObserved,
    ) -> Result<(), EngineError> {
        let d = work.desired;
        match step {
            Step::Adopt => {
                work.converge(self.now);
                Ok(())
            }
            Step::Start => {
                work.status.desired_version = d.version.clone();
                work.status.message = None;
                if work.version_changes() && d.pre_job.is_some() {
                    work.enter(ComponentPhase::PreJob, self.now);
                    self.run_job(work, JobPhase::Pre).await
                } else {
                    work.enter(ComponentPhase::Updating, self.now);
                    self.rollout(work, o).await
                }
            }
            Step::RunPreJob => self.run_job(work, JobPhase::Pre).await,
            Step::Rollout => self.rollout(work, o).await,
            Step::RunPostJob => self.run_job(work, JobPhase::Post).await,
            Step::Retry(failed) => {
                let st = &mut work.status;
                st.attempt += 1;
                st.failed_step = None;
                st.next_retry_time = None;
                st.message = None;
                info!(component = %d.name, attempt = st.attempt, step = ?failed, "retrying");
                work.enter((*failed).into(), self.now);
                match failed {
                    UpdateStep::PreJob => self.run_job(work, JobPhase::Pre).await,
                    UpdateStep::Updating => self.rollout(work, o).await,
                    UpdateStep::PostJob => self.run_job(work, JobPhase::Post).await,
                }
            }
            Step::Restart => {
                let st = &mut work.status;
                st.desired_version = d.version.clone();
                st.attempt = 0;
                st.failed_step = None;
                st.next_retry_time = None;
                st.message = Some(format!("desired version changed to {}", d.version));
                work.enter(ComponentPhase::Pending, self.now);
                work.requeue = Some(self.settings.progress_requeue);
                Ok(())
            }
        }
    }

    async fn run_job(&self, work: &mut Work<'_>, phase: JobPhase) -> Result<(), EngineError> {
        let gate = JobGate::new(self.jobs, self.cancel);
        let outcome = gate
            .advance(self.app, work.desired, phase, work.status.attempt)
            .await?;
        let step = match phase {
            JobPhase::Pre => UpdateStep::PreJob,
            JobPhase::Post => UpdateStep::PostJob,
        };
        match outcome {
            GateOutcome::Running => {
                if work.overdue(self.now, self.settings.job_deadline) {
                    let msg = format!(
                        "{} job exceeded its {}s deadline",
                        phase.as_str(),
                        self.settings.job_deadline.as_secs()
                    );
                    self.fail(work, step, msg);
                } else {
                    work.requeue = Some(self.settings.progress_requeue);
                }
            }
            GateOutcome::Succeeded => match phase {
                JobPhase::Pre => {
                    work.enter(ComponentPhase::Updating, self.now);
                    work.requeue = Some(self.settings.progress_requeue);
                }
                JobPhase::Post => work.converge(self.now),
            },
            GateOutcome::Failed(msg) => {
                self.fail(work, step, format!("{} job failed: {}", phase.as_str(), msg));
            }
        }
        Ok(())
    }

    async fn rollout(&self, work: &mut Work<'_>, o: &ComponentObserved) -> Result<(), EngineError> {
        let d = work.desired;
        let plan = RolloutPlan::for_replicas(&self.app.strategy, d.replicas);
        if let Some(replicas) = next_target_replicas(&plan, d, o) {
            let key = ComponentKey::new(&self.app.id, &d.name);
            let target = WorkloadTarget {
                version: d.version.clone(),
                image: d.image.clone(),
                replicas,
                resources: d.resources.clone(),
                rollout: plan,
                placement: self.app.placement.clone(),
                owner_uid: self.app.uid.clone(),
            };
            guarded(self.cancel, self.workloads.apply(&key, &target)).await??;
            info!(component = %d.name, version = %d.version, replicas, "workload applied");
            work.requeue = Some(self.settings.progress_requeue);
            return Ok(());
        }
        if o.is_rolled_out(d) {
            if work.version_changes() && d.post_job.is_some() {
                work.enter(ComponentPhase::PostJob, self.now);
                return self.run_job(work, JobPhase::Post).await;
            }
            work.converge(self.now);
            return Ok(());
        }
        if work.overdue(self.now, self.settings.rollout_deadline) {
            let msg = format!(
                "rollout incomplete after {}s ({}/{} ready, {} updated)",
                self.settings.rollout_deadline.as_secs(),
                o.ready_replicas,
                d.replicas,
                o.updated_replicas
            );
            self.fail(work, UpdateStep::Updating, msg);
        } else {
            work.requeue = Some(self.settings.progress_requeue);
        }
        Ok(())
    }

    fn fail(&self, work: &mut Work<'_>, step: UpdateStep, msg: String) {
        let delay = self.settings.backoff.delay(work.status.attempt);
        warn!(component = %work.desired.name, step = ?step, attempt = work.status.attempt, %msg, "update step failed");
        work.enter(ComponentPhase::Failed, self.now);
        let st = &mut work.status;
        st.failed_step = Some(step);
        st.message = Some(msg);
        st.next_retry_time = chrono::Duration::from_std(delay)
            .ok()
            .map(|delay| format_time(self.now + delay));
        work.requeue = Some(delay);
    }
}

impl Work<'_> {
    /// Jobs only run when the version itself moves, not on drift or scaling.
    fn version_changes(&self) -> bool {
        self.status.current_version != self.desired.version
    }

    fn enter(&mut self, phase: ComponentPhase, now: DateTime<Utc>) {
        if self.status.phase != phase || self.status.last_transition_time.is_none() {
            self.status.phase = phase;
            self.status.last_transition_time = Some(format_time(now));
        }
    }

    /// Not allowed to proceed: in-flight and failed components keep their
    /// phase, everything else waits as `Pending`.
    fn park(&mut self, now: DateTime<Utc>) {
        if self.status.awaits_retry() {
            self.refail(now);
            return;
        }
        if !self.status.phase.is_in_flight() {
            self.status.desired_version = self.desired.version.clone();
            self.enter(ComponentPhase::Pending, now);
        }
    }

    /// Observable again after failing: back to `Failed` with the retry
    /// bookkeeping untouched.
    fn refail(&mut self, now: DateTime<Utc>) -> bool {
        let refailed = self.status.phase == ComponentPhase::Unknown && self.status.failed_step.is_some();
        if refailed {
            self.enter(ComponentPhase::Failed, now);
        }
        refailed
    }

    fn converge(&mut self, now: DateTime<Utc>) {
        let st = &mut self.status;
        st.current_version = self.desired.version.clone();
        st.desired_version = self.desired.version.clone();
        st.attempt = 0;
        st.failed_step = None;
        st.next_retry_time = None;
        st.message = None;
        self.enter(ComponentPhase::Converged, now);
    }

    fn overdue(&self, now: DateTime<Utc>, limit: Duration) -> bool {
        let Some(since) = self.status.last_transition_time.as_deref().and_then(parse_time) else {
            return false;
        };
        (now - since).to_std().map(|e| e > limit).unwrap_or(false)
    }
}
