use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ResourceRequirements, Toleration};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(
    CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq,
)]
#[kube(
    group = "virtool.virtool.ca",
    version = "v1alpha1",
    kind = "VirtoolApp",
    plural = "virtoolapps",
    shortname = "vapp",
    namespaced,
    status = "VirtoolAppStatus",
    printcolumn = r#"{"name":"Available", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Available\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtoolAppSpec {
    /// Component name to desired component state
    pub components: BTreeMap<String, ComponentSpec>,
    /// How component workloads are rolled (defaults to RollingUpdate 25%/25%)
    #[serde(default)]
    pub update_strategy: UpdateStrategy,
    /// Settings applied to every component workload and job
    #[serde(default)]
    pub global_config: GlobalConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    pub version: String,
    pub image: String,
    /// Desired replica count (default 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    /// Components update in ascending order; equal values may update together
    #[serde(default)]
    pub update_order: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_update_job: Option<JobSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_update_job: Option<JobSpec>,
}

/// One-shot task run before or after a component update.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct JobSpec {
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStrategy {
    /// RollingUpdate | Recreate
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<IntOrString>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    /// Registry prefixed onto images that do not name one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtoolAppStatus {
    #[serde(default)]
    pub component_status: BTreeMap<String, ComponentStatus>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    #[serde(default)]
    pub current_version: String,
    #[serde(default)]
    pub desired_version: String,
    #[serde(default)]
    pub phase: ComponentPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub updated_replicas: i32,
    /// When the component entered its current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    /// Retry counter for the current desired version; part of job names
    #[serde(default)]
    pub attempt: u32,
    /// Step that failed; a retry resumes here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<UpdateStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_time: Option<String>,
}

impl ComponentStatus {
    /// `Failed`, or `Unknown` after having failed: the retry bookkeeping is
    /// kept while the workload cannot be observed.
    pub fn awaits_retry(&self) -> bool {
        match self.phase {
            ComponentPhase::Failed => true,
            ComponentPhase::Unknown => self.failed_step.is_some(),
            _ => false,
        }
    }
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash,
)]
pub enum ComponentPhase {
    #[default]
    Pending,
    PreJob,
    Updating,
    PostJob,
    Converged,
    Failed,
    Unknown,
}

impl ComponentPhase {
    /// Pre-job, rollout or post-job in flight.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            ComponentPhase::PreJob | ComponentPhase::Updating | ComponentPhase::PostJob
        )
    }
}

impl std::fmt::Display for ComponentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ComponentPhase::Pending => "Pending",
            ComponentPhase::PreJob => "PreJob",
            ComponentPhase::Updating => "Updating",
            ComponentPhase::PostJob => "PostJob",
            ComponentPhase::Converged => "Converged",
            ComponentPhase::Failed => "Failed",
            ComponentPhase::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// The resumable steps of a component update.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum UpdateStep {
    PreJob,
    Updating,
    PostJob,
}

impl From<UpdateStep> for ComponentPhase {
    fn from(step: UpdateStep) -> Self {
        match step {
            UpdateStep::PreJob => ComponentPhase::PreJob,
            UpdateStep::Updating => ComponentPhase::Updating,
            UpdateStep::PostJob => ComponentPhase::PostJob,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(
        rename = "lastTransitionTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_transition_time: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionType {
    Available,
    Progressing,
    Degraded,
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}
