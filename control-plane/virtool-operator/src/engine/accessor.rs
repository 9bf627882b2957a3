use std::collections::BTreeMap;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::error::{EngineError, SpecError};
use super::guarded;
use super::model::{AppId, Application, ComponentKey, ComponentObserved};
use crate::collaborators::{AppStore, CollaboratorError, WorkloadBackend};
use crate::crd::virtool_app::VirtoolAppStatus;

#[derive(Clone, Debug, PartialEq)]
pub enum Observation {
    Seen(ComponentObserved),
    /// The workload could not be read this cycle
    Unreadable(String),
}

#[derive(Clone, Debug)]
pub enum Desired {
    Valid(Application),
    Invalid(SpecError),
}

/// Everything one reconcile cycle plans against. Built fresh every cycle.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub id: AppId,
    pub token: String,
    pub generation: Option<i64>,
    pub desired: Desired,
    pub status: VirtoolAppStatus,
    pub observed: BTreeMap<String, Observation>,
}

/// Read the application and observe each declared component. Returns `None`
/// when the application no longer exists. Nothing is written.
#[instrument(skip_all, fields(app = %id))]
pub async fn load_snapshot<S, W>(
    store: &S,
    workloads: &W,
    id: &AppId,
    cancel: &CancellationToken,
) -> Result<Option<Snapshot>, EngineError>
where
    S: AppStore + ?Sized,
    W: WorkloadBackend + ?Sized,
{
    let read = match guarded(cancel, store.get(id)).await? {
        Ok(v) => v,
        Err(CollaboratorError::NotFound(_)) => {
            debug!("application not found; nothing to reconcile");
            return Ok(None);
        }
        Err(e) => return Err(EngineError::Transient(e)),
    };
    let resource = read.value;
    let status = resource.status.clone().unwrap_or_default();
    let generation = resource.metadata.generation;

    let app = match Application::from_resource(&resource) {
        Ok(app) => app,
        Err(e) => {
            warn!(error = %e, "spec rejected");
            return Ok(Some(Snapshot {
                id: id.clone(),
                token: read.token,
                generation,
                desired: Desired::Invalid(e),
                status,
                observed: BTreeMap::new(),
            }));
        }
    };

    let keys: Vec<ComponentKey> = app
        .components
        .iter()
        .map(|c| ComponentKey::new(id, &c.name))
        .collect();
    let reads = guarded(cancel, async {
        Ok(join_all(keys.iter().map(|k| workloads.observe(k))).await)
    })
    .await??;
    let mut observed = BTreeMap::new();
    for (key, res) in keys.into_iter().zip(reads) {
        let obs = match res {
            Ok(Some(o)) => Observation::Seen(o),
            Ok(None) => Observation::Seen(ComponentObserved::absent()),
            Err(e) => {
                warn!(component = %key.component, error = %e, "workload unreadable");
                Observation::Unreadable(e.to_string())
            }
        };
        observed.insert(key.component, obs);
    }

    Ok(Some(Snapshot {
        id: id.clone(),
        token: read.token,
        generation,
        desired: Desired::Valid(app),
        status,
        observed,
    }))
}
