use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Client;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use tracing::{debug, instrument, trace};

use super::{
    ANNOTATION_VERSION, LABEL_APP, LABEL_COMPONENT, component_labels, owner_ref, place,
    version_annotations,
};
use crate::collaborators::error::CollaboratorError;
use crate::collaborators::traits::{CollabResult, WorkloadBackend, WorkloadTarget};
use crate::engine::admission::RolloutPlan;
use crate::engine::model::{ComponentKey, ComponentObserved};

/// One `Deployment` per component, applied with server-side apply.
#[derive(Clone)]
pub struct KubeWorkloads {
    client: Client,
    field_manager: String,
}

impl KubeWorkloads {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

pub(crate) fn render_deployment(key: &ComponentKey, target: &WorkloadTarget) -> Deployment {
    let labels = component_labels(key);
    let selector = LabelSelector {
        match_labels: Some(
            [LABEL_APP, LABEL_COMPONENT]
                .iter()
                .filter_map(|k| labels.get(*k).map(|v| (k.to_string(), v.clone())))
                .collect(),
        ),
        ..Default::default()
    };
    let mut pod = PodSpec {
        containers: vec![Container {
            name: key.component.clone(),
            image: Some(target.image.clone()),
            resources: target.resources.clone(),
            ..Default::default()
        }],
        ..Default::default()
    };
    place(&mut pod, &target.placement);

    let strategy = match target.rollout {
        RolloutPlan::Recreate => DeploymentStrategy {
            type_: Some("Recreate".into()),
            rolling_update: None,
        },
        RolloutPlan::Rolling(bounds) => DeploymentStrategy {
            type_: Some("RollingUpdate".into()),
            rolling_update: Some(RollingUpdateDeployment {
                max_unavailable: Some(IntOrString::Int(bounds.max_unavailable)),
                max_surge: Some(IntOrString::Int(bounds.max_surge)),
            }),
        },
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(key.workload_name()),
            namespace: Some(key.app.namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: owner_ref(target.owner_uid.as_deref(), &key.app.name),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(target.replicas),
            selector,
            strategy: Some(strategy),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    annotations: Some(version_annotations(&target.version)),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn observe_deployment(dep: &Deployment) -> ComponentObserved {
    let spec = dep.spec.as_ref();
    let template = spec.map(|s| &s.template);
    let status = dep.status.clone().unwrap_or_default();
    // counts from a status that has not caught up with the spec are stale
    let caught_up = match (status.observed_generation, dep.metadata.generation) {
        (Some(seen), Some(current)) => seen >= current,
        _ => false,
    };
    ComponentObserved {
        exists: true,
        current_version: template
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.annotations.as_ref())
            .and_then(|a| a.get(ANNOTATION_VERSION).cloned()),
        image: template
            .and_then(|t| t.spec.as_ref())
            .and_then(|p| p.containers.first())
            .and_then(|c| c.image.clone()),
        spec_replicas: spec.and_then(|s| s.replicas).unwrap_or(1),
        replicas: status.replicas.unwrap_or(0),
        ready_replicas: status.ready_replicas.unwrap_or(0),
        updated_replicas: if caught_up {
            status.updated_replicas.unwrap_or(0)
        } else {
            0
        },
    }
}

#[async_trait]
impl WorkloadBackend for KubeWorkloads {
    #[instrument(skip_all, fields(workload = %key.workload_name()))]
    async fn apply(&self, key: &ComponentKey, target: &WorkloadTarget) -> CollabResult<()> {
        let dep = render_deployment(key, target);
        let body = serde_json::to_value(&dep)?;
        trace!(body = %body, "applying deployment");
        let pp = PatchParams::apply(&self.field_manager).force();
        self.api(&key.app.namespace)
            .patch(&key.workload_name(), &pp, &Patch::Apply(&body))
            .await?;
        Ok(())
    }

    async fn observe(&self, key: &ComponentKey) -> CollabResult<Option<ComponentObserved>> {
        let dep = self
            .api(&key.app.namespace)
            .get_opt(&key.workload_name())
            .await?;
        Ok(dep.as_ref().map(observe_deployment))
    }

    #[instrument(skip_all, fields(workload = %key.workload_name()))]
    async fn delete(&self, key: &ComponentKey) -> CollabResult<()> {
        match self
            .api(&key.app.namespace)
            .delete(&key.workload_name(), &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => match CollaboratorError::from(e) {
                CollaboratorError::NotFound(_) => {
                    debug!("workload already gone");
                    Ok(())
                }
                other => Err(other),
            },
        }
    }
}
