use super::model::{ComponentDesired, ComponentObserved, Strategy};

/// Absolute disruption bounds for one component's rollout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RolloutBounds {
    pub max_unavailable: i32,
    pub max_surge: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RolloutPlan {
    Rolling(RolloutBounds),
    Recreate,
}

impl RolloutPlan {
    /// Resolve the strategy against `replicas`: max-unavailable rounds down,
    /// max-surge rounds up. Both zero would stall a rollout, so
    /// max-unavailable is raised to 1 in that case.
    pub fn for_replicas(strategy: &Strategy, replicas: i32) -> Self {
        match strategy {
            Strategy::Recreate => RolloutPlan::Recreate,
            Strategy::RollingUpdate {
                max_unavailable,
                max_surge,
            } => {
                let mut max_unavailable = max_unavailable.resolve(replicas, false);
                let max_surge = max_surge.resolve(replicas, true);
                if max_unavailable == 0 && max_surge == 0 {
                    max_unavailable = 1;
                }
                RolloutPlan::Rolling(RolloutBounds {
                    max_unavailable,
                    max_surge,
                })
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Violation(String),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// What the workload should be told next to move toward `desired`,
/// `None` when the current template is already the right one.
pub fn next_target_replicas(
    plan: &RolloutPlan,
    desired: &ComponentDesired,
    observed: &ComponentObserved,
) -> Option<i32> {
    if observed.runs(desired) {
        return None;
    }
    match plan {
        RolloutPlan::Rolling(_) => Some(desired.replicas),
        RolloutPlan::Recreate => {
            if !observed.exists || observed.replicas == 0 {
                return Some(desired.replicas);
            }
            let draining = observed.current_version.as_deref() == Some(desired.version.as_str())
                && observed.image.as_deref() == Some(desired.image.as_str())
                && observed.spec_replicas == 0;
            if draining { None } else { Some(0) }
        }
    }
}

/// Decide whether applying a new template now keeps disruption within
/// bounds. A missing workload, or one with nothing ready, has nothing left
/// to protect and is always admitted. Unavailability is measured against the
/// size the workload currently targets, so a scale change alone never holds
/// itself back.
pub fn admit_apply(
    plan: &RolloutPlan,
    desired: &ComponentDesired,
    observed: &ComponentObserved,
) -> Admission {
    if !observed.exists || observed.ready_replicas == 0 {
        return Admission::Admitted;
    }
    match plan {
        RolloutPlan::Recreate => Admission::Admitted,
        RolloutPlan::Rolling(bounds) => {
            let baseline = observed.spec_replicas.min(desired.replicas);
            let unavailable = (baseline - observed.ready_replicas).max(0);
            let surge =
                (observed.replicas - observed.spec_replicas.max(desired.replicas)).max(0);
            if unavailable > bounds.max_unavailable {
                Admission::Violation(format!(
                    "{} unavailable replicas exceed maxUnavailable {}",
                    unavailable, bounds.max_unavailable
                ))
            } else if surge > bounds.max_surge {
                Admission::Violation(format!(
                    "{} surge replicas exceed maxSurge {}",
                    surge, bounds.max_surge
                ))
            } else {
                Admission::Admitted
            }
        }
    }
}
