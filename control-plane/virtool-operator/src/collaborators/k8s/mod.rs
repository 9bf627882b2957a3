//! Collaborators backed by the Kubernetes API: the `VirtoolApp` resource is
//! the store, `Deployment`s are workloads and batch `Job`s run the gates.

mod job;
mod store;
mod workload;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{LocalObjectReference, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;

use crate::crd::virtool_app::VirtoolApp;
use crate::engine::model::{ComponentKey, MAX_LABEL, Placement, unique_dns_label};

pub use job::KubeJobs;
pub use store::KubeAppStore;
pub use workload::KubeWorkloads;

pub const LABEL_APP: &str = "virtool.ca/app";
pub const LABEL_COMPONENT: &str = "virtool.ca/component";
/// Versions are free-form, so they live in an annotation rather than a label.
pub const ANNOTATION_VERSION: &str = "virtool.ca/version";
pub const LABEL_JOB_PHASE: &str = "virtool.ca/job-phase";
pub const MANAGED_BY: &str = "virtool-operator";

/// Labels shared by every object created for a component.
pub(crate) fn component_labels(key: &ComponentKey) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), key.component.clone()),
        ("app.kubernetes.io/instance".to_string(), key.workload_name()),
        ("app.kubernetes.io/part-of".to_string(), label_value(&key.app.name)),
        ("app.kubernetes.io/managed-by".to_string(), MANAGED_BY.to_string()),
        (LABEL_APP.to_string(), label_value(&key.app.name)),
        (LABEL_COMPONENT.to_string(), key.component.clone()),
    ])
}

/// Object names may be longer than a label value allows.
fn label_value(name: &str) -> String {
    if name.len() <= MAX_LABEL {
        name.to_string()
    } else {
        unique_dns_label(name)
    }
}

/// Annotations carrying the version a workload or job was rendered for.
pub(crate) fn version_annotations(version: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(ANNOTATION_VERSION.to_string(), version.to_string())])
}

pub(crate) fn owner_ref(uid: Option<&str>, owner_name: &str) -> Option<Vec<OwnerReference>> {
    uid.map(|u| {
        vec![OwnerReference {
            api_version: VirtoolApp::api_version(&()).to_string(),
            kind: VirtoolApp::kind(&()).to_string(),
            name: owner_name.to_string(),
            uid: u.to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]
    })
}

/// Apply the application's global placement to a pod spec.
pub(crate) fn place(spec: &mut PodSpec, placement: &Placement) {
    if let Some(secret) = &placement.image_pull_secret {
        spec.image_pull_secrets = Some(vec![LocalObjectReference {
            name: secret.clone(),
        }]);
    }
    if !placement.tolerations.is_empty() {
        spec.tolerations = Some(placement.tolerations.clone());
    }
    if !placement.node_selector.is_empty() {
        spec.node_selector = Some(placement.node_selector.clone());
    }
}
