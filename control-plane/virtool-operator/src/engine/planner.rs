use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::accessor::Observation;
use super::admission::{Admission, RolloutPlan, admit_apply, next_target_replicas};
use super::clock::parse_time;
use super::model::{Application, ComponentDesired, ComponentObserved};
use crate::crd::virtool_app::{ComponentPhase, ComponentStatus, UpdateStep};

/// One micro-step of a component's update the planner authorises.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// Record an already converged workload without touching it
    Adopt,
    /// Begin an update toward the desired version
    Start,
    RunPreJob,
    Rollout,
    RunPostJob,
    /// Resume a failed update at the step that failed
    Retry(UpdateStep),
    /// Desired version moved under an unfinished update
    Restart,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Hold {
    OrderBlocked { waiting_on: Vec<String> },
    Admission(String),
    Backoff { remaining: Duration },
    Unobservable(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Converged and still matching the workload
    Settled,
    Advance(Step),
    Hold(Hold),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanEntry {
    pub component: String,
    pub decision: Decision,
}

/// Decisions in update order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    pub entries: Vec<PlanEntry>,
}

impl Plan {
    pub fn decision(&self, component: &str) -> Option<&Decision> {
        self.entries
            .iter()
            .find(|e| e.component == component)
            .map(|e| &e.decision)
    }

    /// Components allowed to change their workload or jobs this cycle.
    pub fn advancing(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|e| match e.decision {
            Decision::Advance(_) => Some(e.component.as_str()),
            _ => None,
        })
    }
}

/// Decide what each component may do this cycle. Pure: reads the snapshot,
/// touches nothing.
pub fn plan(
    app: &Application,
    statuses: &BTreeMap<String, ComponentStatus>,
    observed: &BTreeMap<String, Observation>,
    now: DateTime<Utc>,
) -> Plan {
    let unknown = Observation::Unreadable("not observed".into());
    let blockers: Vec<(&ComponentDesired, bool)> = app
        .components
        .iter()
        .map(|d| {
            let obs = observed.get(&d.name).unwrap_or(&unknown);
            (d, clears_order(d, statuses.get(&d.name), obs))
        })
        .collect();

    let entries = app
        .components
        .iter()
        .map(|d| {
            let waiting_on: Vec<String> = blockers
                .iter()
                .filter(|(b, cleared)| b.update_order < d.update_order && !cleared)
                .map(|(b, _)| b.name.clone())
                .collect();
            let obs = observed.get(&d.name).unwrap_or(&unknown);
            let ctx = Candidate {
                app,
                desired: d,
                status: statuses.get(&d.name),
                waiting_on,
                now,
            };
            PlanEntry {
                component: d.name.clone(),
                decision: ctx.decide(obs),
            }
        })
        .collect();
    Plan { entries }
}

/// Whether `d` no longer holds back components ordered after it: its
/// workload is converged and no update of it is in flight, or it failed at
/// the current desired version.
fn clears_order(d: &ComponentDesired, status: Option<&ComponentStatus>, obs: &Observation) -> bool {
    if let Some(s) = status {
        if s.awaits_retry() && s.desired_version == d.version {
            return true;
        }
        if s.phase.is_in_flight() || s.awaits_retry() {
            return false;
        }
    }
    matches!(obs, Observation::Seen(o) if o.is_converged(d))
}

struct Candidate<'a> {
    app: &'a Application,
    desired: &'a ComponentDesired,
    status: Option<&'a ComponentStatus>,
    waiting_on: Vec<String>,
    now: DateTime<Utc>,
}

impl Candidate<'_> {
    fn decide(self, obs: &Observation) -> Decision {
        let o = match obs {
            Observation::Seen(o) => o,
            Observation::Unreadable(msg) => {
                return Decision::Hold(Hold::Unobservable(msg.clone()));
            }
        };
        let d = self.desired;
        let Some(status) = self.status else {
            if o.is_converged(d) && o.runs(d) {
                return Decision::Advance(Step::Adopt);
            }
            return self.start(o);
        };
        let target_moved = status.desired_version != d.version;
        match status.phase {
            ComponentPhase::Converged => {
                if status.current_version == d.version && o.runs(d) {
                    Decision::Settled
                } else {
                    self.start(o)
                }
            }
            // failed before the workload became unreadable
            ComponentPhase::Unknown if status.awaits_retry() => self.resume(status, o, target_moved),
            ComponentPhase::Pending | ComponentPhase::Unknown => self.start(o),
            ComponentPhase::PreJob | ComponentPhase::Updating | ComponentPhase::PostJob
                if target_moved =>
            {
                Decision::Advance(Step::Restart)
            }
            ComponentPhase::PreJob => self.continue_with(Step::RunPreJob),
            ComponentPhase::PostJob => self.continue_with(Step::RunPostJob),
            ComponentPhase::Updating => match self.blocked() {
                Some(hold) => hold,
                None => self.admit(o, Step::Rollout),
            },
            ComponentPhase::Failed => self.resume(status, o, target_moved),
        }
    }

    fn blocked(&self) -> Option<Decision> {
        if self.waiting_on.is_empty() {
            None
        } else {
            Some(Decision::Hold(Hold::OrderBlocked {
                waiting_on: self.waiting_on.clone(),
            }))
        }
    }

    fn continue_with(&self, step: Step) -> Decision {
        self.blocked().unwrap_or(Decision::Advance(step))
    }

    fn start(&self, o: &ComponentObserved) -> Decision {
        match self.blocked() {
            Some(hold) => hold,
            None => self.admit(o, Step::Start),
        }
    }

    /// Gate a step that may push a new template at the workload.
    fn admit(&self, o: &ComponentObserved, step: Step) -> Decision {
        let plan = RolloutPlan::for_replicas(&self.app.strategy, self.desired.replicas);
        if next_target_replicas(&plan, self.desired, o).is_none() {
            return Decision::Advance(step);
        }
        match admit_apply(&plan, self.desired, o) {
            Admission::Admitted => Decision::Advance(step),
            Admission::Violation(msg) => Decision::Hold(Hold::Admission(msg)),
        }
    }

    fn resume(&self, status: &ComponentStatus, o: &ComponentObserved, target_moved: bool) -> Decision {
        if target_moved {
            Decision::Advance(Step::Restart)
        } else {
            self.retry(status, o)
        }
    }

    fn retry(&self, status: &ComponentStatus, o: &ComponentObserved) -> Decision {
        let due = status.next_retry_time.as_deref().and_then(parse_time);
        if let Some(due) = due {
            if due > self.now {
                let remaining = (due - self.now).to_std().unwrap_or_default();
                return Decision::Hold(Hold::Backoff { remaining });
            }
        }
        if let Some(hold) = self.blocked() {
            return hold;
        }
        let step = status.failed_step.unwrap_or(UpdateStep::Updating);
        match step {
            UpdateStep::Updating => self.admit(o, Step::Retry(step)),
            _ => Decision::Advance(Step::Retry(step)),
        }
    }
}
