use kube::Resource;
use kube::runtime::events::{Event, EventType, Recorder};
use tracing::warn;

use crate::crd::virtool_app::{ComponentPhase, VirtoolApp};
use crate::engine::Transition;

pub const ACTION_RECONCILE: &str = "Reconcile";

/// The Kubernetes event describing one component phase change.
pub fn transition_event(t: &Transition) -> Event {
    let (type_, reason) = match t.to {
        ComponentPhase::Pending => (EventType::Normal, "UpdatePending"),
        ComponentPhase::PreJob => (EventType::Normal, "PreUpdateJobStarted"),
        ComponentPhase::Updating => (EventType::Normal, "RolloutStarted"),
        ComponentPhase::PostJob => (EventType::Normal, "PostUpdateJobStarted"),
        ComponentPhase::Converged => (EventType::Normal, "Converged"),
        ComponentPhase::Failed => (EventType::Warning, "UpdateFailed"),
        ComponentPhase::Unknown => (EventType::Warning, "ComponentUnobservable"),
    };
    let from = t.from.map(|p| p.to_string()).unwrap_or_else(|| "new".into());
    let mut note = format!("component {}: {} -> {}", t.component, from, t.to);
    if let Some(msg) = &t.message {
        note.push_str(": ");
        note.push_str(msg);
    }
    Event {
        type_,
        reason: reason.into(),
        note: Some(note),
        action: ACTION_RECONCILE.into(),
        secondary: None,
    }
}

pub async fn emit_transition(recorder: &Recorder, app: &VirtoolApp, t: &Transition) {
    let event = transition_event(t);
    if let Err(e) = recorder.publish(&event, &app.object_ref(&())).await {
        warn!(error = %e, component = %t.component, "failed to publish event");
    }
}
