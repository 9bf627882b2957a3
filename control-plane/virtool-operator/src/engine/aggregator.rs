use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::clock::{format_time, parse_time};
use super::error::SpecError;
use super::model::Application;
use crate::crd::virtool_app::{
    ComponentPhase, ComponentStatus, Condition, ConditionStatus, ConditionType, VirtoolAppStatus,
};

pub const REASON_CONVERGED: &str = "AllComponentsConverged";
pub const REASON_NOT_READY: &str = "ComponentsNotReady";
pub const REASON_UPDATING: &str = "UpdateInProgress";
pub const REASON_STABLE: &str = "Stable";
pub const REASON_FAILED: &str = "ComponentsFailing";
pub const REASON_HEALTHY: &str = "AsExpected";
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";

/// Fold per-component statuses into the application status. `components`
/// holds exactly the desired set, so removed components drop out here.
pub fn aggregate(
    prev: &VirtoolAppStatus,
    app: &Application,
    components: BTreeMap<String, ComponentStatus>,
    now: DateTime<Utc>,
) -> VirtoolAppStatus {
    let mut failing = Vec::new();
    let mut moving = Vec::new();
    let mut not_ready = Vec::new();
    for d in &app.components {
        let Some(st) = components.get(&d.name) else {
            not_ready.push(d.name.as_str());
            continue;
        };
        match st.phase {
            ComponentPhase::Failed | ComponentPhase::Unknown => failing.push(d.name.as_str()),
            ComponentPhase::Pending => moving.push(d.name.as_str()),
            p if p.is_in_flight() => moving.push(d.name.as_str()),
            _ => {}
        }
        if st.phase != ComponentPhase::Converged || st.ready_replicas != d.replicas {
            not_ready.push(d.name.as_str());
        }
    }

    let incoming = vec![
        condition(
            ConditionType::Available,
            not_ready.is_empty(),
            if not_ready.is_empty() { REASON_CONVERGED } else { REASON_NOT_READY },
            listing("not ready", &not_ready),
        ),
        condition(
            ConditionType::Progressing,
            !moving.is_empty(),
            if moving.is_empty() { REASON_STABLE } else { REASON_UPDATING },
            listing("updating", &moving),
        ),
        condition(
            ConditionType::Degraded,
            !failing.is_empty(),
            if failing.is_empty() { REASON_HEALTHY } else { REASON_FAILED },
            listing("failing", &failing),
        ),
    ];

    finish(prev, components, incoming, app.generation, now)
}

/// Status for a spec the engine refuses to act on. Component records are
/// left as they were.
pub fn invalid_spec(
    prev: &VirtoolAppStatus,
    err: &SpecError,
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> VirtoolAppStatus {
    let msg = Some(err.to_string());
    let incoming = vec![
        Condition {
            type_: ConditionType::Available,
            status: ConditionStatus::False,
            reason: Some(REASON_INVALID_SPEC.into()),
            message: msg.clone(),
            last_transition_time: None,
        },
        Condition {
            type_: ConditionType::Progressing,
            status: ConditionStatus::False,
            reason: Some(REASON_INVALID_SPEC.into()),
            message: msg.clone(),
            last_transition_time: None,
        },
        Condition {
            type_: ConditionType::Degraded,
            status: ConditionStatus::True,
            reason: Some(REASON_INVALID_SPEC.into()),
            message: msg,
            last_transition_time: None,
        },
    ];
    finish(prev, prev.component_status.clone(), incoming, generation, now)
}

fn finish(
    prev: &VirtoolAppStatus,
    components: BTreeMap<String, ComponentStatus>,
    incoming: Vec<Condition>,
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> VirtoolAppStatus {
    let mut next = VirtoolAppStatus {
        component_status: components,
        conditions: upsert_conditions(&prev.conditions, incoming, now),
        last_update_time: prev.last_update_time.clone(),
        observed_generation: generation.or(prev.observed_generation),
    };
    if !same_ignoring_timestamps(prev, &next) {
        next.last_update_time = Some(format_time(now));
    }
    next
}

fn condition(
    type_: ConditionType,
    holds: bool,
    reason: &str,
    message: Option<String>,
) -> Condition {
    Condition {
        type_,
        status: if holds { ConditionStatus::True } else { ConditionStatus::False },
        reason: Some(reason.into()),
        message,
        last_transition_time: None,
    }
}

fn listing(what: &str, names: &[&str]) -> Option<String> {
    (!names.is_empty()).then(|| format!("{}: {}", what, names.join(", ")))
}

/// Upsert by type. A condition keeps its timestamp unless its status or
/// reason changed, and a new timestamp never precedes the previous one.
fn upsert_conditions(
    existing: &[Condition],
    incoming: Vec<Condition>,
    now: DateTime<Utc>,
) -> Vec<Condition> {
    let mut out: Vec<Condition> = existing.to_vec();
    for mut inc in incoming {
        match out.iter().position(|c| c.type_ == inc.type_) {
            Some(idx) => {
                let old = &out[idx];
                inc.last_transition_time = if old.status == inc.status && old.reason == inc.reason {
                    old.last_transition_time.clone()
                } else {
                    Some(format_time(not_before(now, old.last_transition_time.as_deref())))
                };
                out[idx] = inc;
            }
            None => {
                inc.last_transition_time = Some(format_time(now));
                out.push(inc);
            }
        }
    }
    out.sort_by_key(|c| cond_rank(c.type_));
    out
}

fn not_before(now: DateTime<Utc>, previous: Option<&str>) -> DateTime<Utc> {
    match previous.and_then(parse_time) {
        Some(prev) if prev > now => prev,
        _ => now,
    }
}

fn cond_rank(t: ConditionType) -> u8 {
    match t {
        ConditionType::Available => 0,
        ConditionType::Progressing => 1,
        ConditionType::Degraded => 2,
        ConditionType::Unknown => 250,
    }
}

/// Equality with every timestamp blanked out; the basis for skipping
/// no-op status writes.
pub fn same_ignoring_timestamps(a: &VirtoolAppStatus, b: &VirtoolAppStatus) -> bool {
    normalize(a) == normalize(b)
}

fn normalize(s: &VirtoolAppStatus) -> VirtoolAppStatus {
    let mut s = s.clone();
    s.last_update_time = None;
    for c in &mut s.conditions {
        c.last_transition_time = None;
    }
    for st in s.component_status.values_mut() {
        st.last_transition_time = None;
    }
    s
}
