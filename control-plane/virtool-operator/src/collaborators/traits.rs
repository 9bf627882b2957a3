use async_trait::async_trait;
use k8s_openapi::api::core::v1::ResourceRequirements;

use super::error::CollaboratorError;
use crate::crd::virtool_app::{JobSpec, VirtoolApp, VirtoolAppStatus};
use crate::engine::admission::RolloutPlan;
use crate::engine::model::{AppId, ComponentKey, ComponentObserved, JobPhase, Placement};

pub type CollabResult<T> = Result<T, CollaboratorError>;

/// A value read together with the token guarding its next write.
#[derive(Clone, Debug)]
pub struct Versioned<T> {
    pub value: T,
    pub token: String,
}

/// Holds the declared application and its status.
#[async_trait]
pub trait AppStore: Send + Sync {
    async fn get(&self, id: &AppId) -> CollabResult<Versioned<VirtoolApp>>;

    /// Replace the whole status if `token` is still current. Returns the new
    /// token, or `Conflict` when another write got there first.
    async fn update_status(
        &self,
        id: &AppId,
        status: &VirtoolAppStatus,
        token: &str,
    ) -> CollabResult<String>;
}

/// Template the workload collaborator is told to run.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkloadTarget {
    pub version: String,
    pub image: String,
    pub replicas: i32,
    pub resources: Option<ResourceRequirements>,
    pub rollout: RolloutPlan,
    pub placement: Placement,
    pub owner_uid: Option<String>,
}

#[async_trait]
pub trait WorkloadBackend: Send + Sync {
    /// Idempotent upsert; re-applying the same target is a no-op.
    async fn apply(&self, key: &ComponentKey, target: &WorkloadTarget) -> CollabResult<()>;

    /// `None` when the workload has not been created yet.
    async fn observe(&self, key: &ComponentKey) -> CollabResult<Option<ComponentObserved>>;

    /// Idempotent; deleting a missing workload succeeds.
    async fn delete(&self, key: &ComponentKey) -> CollabResult<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Running,
    Succeeded,
    Failed(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobRequest {
    pub name: String,
    pub component: ComponentKey,
    pub phase: JobPhase,
    pub version: String,
    pub spec: JobSpec,
    pub placement: Placement,
    pub owner_uid: Option<String>,
}

#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Start the job once. A second dispatch under the same name returns
    /// `AlreadyDispatched`.
    async fn dispatch(&self, request: &JobRequest) -> CollabResult<()>;

    /// `None` when no job with that name exists.
    async fn status(&self, key: &ComponentKey, job_name: &str) -> CollabResult<Option<JobOutcome>>;
}
