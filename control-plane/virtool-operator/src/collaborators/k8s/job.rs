use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec as BatchJobSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, PostParams};
use tracing::{info, instrument};

use super::{LABEL_JOB_PHASE, component_labels, owner_ref, place, version_annotations};
use crate::collaborators::error::CollaboratorError;
use crate::collaborators::traits::{CollabResult, JobBackend, JobOutcome, JobRequest};
use crate::engine::model::ComponentKey;

/// Finished jobs are kept a day for inspection.
const TTL_AFTER_FINISHED_SECS: i32 = 86_400;

/// Pre/post update gates as batch `Job`s. The job name is the dispatch key,
/// so a repeated create is rejected by the API server.
#[derive(Clone)]
pub struct KubeJobs {
    client: Client,
}

impl KubeJobs {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

pub(crate) fn render_job(request: &JobRequest) -> Job {
    let key = &request.component;
    let mut labels = component_labels(key);
    labels.insert(LABEL_JOB_PHASE.to_string(), request.phase.as_str().to_string());

    let non_empty = |v: &Vec<String>| (!v.is_empty()).then(|| v.clone());
    let mut pod = PodSpec {
        restart_policy: Some("Never".into()),
        containers: vec![Container {
            name: format!("{}-job", request.phase.as_str()),
            image: Some(request.spec.image.clone()),
            command: non_empty(&request.spec.command),
            args: non_empty(&request.spec.args),
            ..Default::default()
        }],
        ..Default::default()
    };
    place(&mut pod, &request.placement);

    Job {
        metadata: ObjectMeta {
            name: Some(request.name.clone()),
            namespace: Some(key.app.namespace.clone()),
            labels: Some(labels.clone()),
            annotations: Some(version_annotations(&request.version)),
            owner_references: owner_ref(request.owner_uid.as_deref(), &key.app.name),
            ..Default::default()
        },
        spec: Some(BatchJobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(TTL_AFTER_FINISHED_SECS),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn job_outcome(job: &Job) -> JobOutcome {
    let Some(status) = job.status.as_ref() else {
        return JobOutcome::Running;
    };
    let failed_condition = status.conditions.iter().flatten().find(|c| {
        (c.type_ == "Failed" || c.type_ == "FailureTarget") && c.status == "True"
    });
    if let Some(c) = failed_condition {
        let msg = c
            .message
            .clone()
            .or_else(|| c.reason.clone())
            .unwrap_or_else(|| "job failed".into());
        return JobOutcome::Failed(msg);
    }
    if status.succeeded.unwrap_or(0) > 0 {
        JobOutcome::Succeeded
    } else if status.failed.unwrap_or(0) > 0 {
        JobOutcome::Failed(format!("{} pod(s) failed", status.failed.unwrap_or(0)))
    } else {
        JobOutcome::Running
    }
}

#[async_trait]
impl JobBackend for KubeJobs {
    #[instrument(skip_all, fields(job = %request.name))]
    async fn dispatch(&self, request: &JobRequest) -> CollabResult<()> {
        let job = render_job(request);
        match self
            .api(&request.component.app.namespace)
            .create(&PostParams::default(), &job)
            .await
        {
            Ok(_) => {
                info!("job created");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                Err(CollaboratorError::AlreadyDispatched(request.name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn status(&self, key: &ComponentKey, job_name: &str) -> CollabResult<Option<JobOutcome>> {
        let job = self.api(&key.app.namespace).get_opt(job_name).await?;
        Ok(job.as_ref().map(job_outcome))
    }
}
