use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::error::EngineError;
use super::guarded;
use super::model::{Application, ComponentDesired, ComponentKey, JobPhase, unique_dns_label};
use crate::collaborators::{CollaboratorError, JobBackend, JobOutcome, JobRequest};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateOutcome {
    Running,
    Succeeded,
    Failed(String),
}

/// Deterministic job name for one attempt of one phase of one version.
/// Versions are free-form, so names are hash-suffixed whenever they had to
/// be rewritten into a DNS label.
pub fn job_key(app: &str, component: &str, phase: JobPhase, version: &str, attempt: u32) -> String {
    unique_dns_label(&format!(
        "{}-{}-{}-{}-{}",
        app,
        component,
        phase.as_str(),
        version,
        attempt
    ))
}

/// Drives pre/post update jobs as blocking gates. Holds no state between
/// calls; the job collaborator is the record of what was dispatched.
pub struct JobGate<'a, J: ?Sized> {
    jobs: &'a J,
    cancel: &'a CancellationToken,
}

impl<'a, J: JobBackend + ?Sized> JobGate<'a, J> {
    pub fn new(jobs: &'a J, cancel: &'a CancellationToken) -> Self {
        Self { jobs, cancel }
    }

    /// Dispatch the job for `phase` once, then report its outcome on every
    /// later call. Succeeds immediately when no job is declared.
    pub async fn advance(
        &self,
        app: &Application,
        desired: &ComponentDesired,
        phase: JobPhase,
        attempt: u32,
    ) -> Result<GateOutcome, EngineError> {
        let Some(spec) = desired.job(phase) else {
            trace!(component = %desired.name, phase = phase.as_str(), "no job declared");
            return Ok(GateOutcome::Succeeded);
        };
        let key = ComponentKey::new(&app.id, &desired.name);
        let name = job_key(&app.id.name, &desired.name, phase, &desired.version, attempt);

        match guarded(self.cancel, self.jobs.status(&key, &name)).await?? {
            Some(JobOutcome::Running) => {
                debug!(job = %name, "job still running");
                Ok(GateOutcome::Running)
            }
            Some(JobOutcome::Succeeded) => Ok(GateOutcome::Succeeded),
            Some(JobOutcome::Failed(msg)) => Ok(GateOutcome::Failed(msg)),
            None => {
                let request = JobRequest {
                    name: name.clone(),
                    component: key,
                    phase,
                    version: desired.version.clone(),
                    spec: spec.clone(),
                    placement: app.placement.clone(),
                    owner_uid: app.uid.clone(),
                };
                match guarded(self.cancel, self.jobs.dispatch(&request)).await? {
                    Ok(()) => info!(job = %name, "job dispatched"),
                    Err(CollaboratorError::AlreadyDispatched(_)) => {
                        debug!(job = %name, "job already dispatched")
                    }
                    Err(e) => return Err(e.into()),
                }
                Ok(GateOutcome::Running)
            }
        }
    }
}
