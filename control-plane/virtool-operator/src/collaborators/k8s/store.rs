use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource};
use serde_json::json;
use tracing::{instrument, trace};

use crate::collaborators::traits::{AppStore, CollabResult, Versioned};
use crate::crd::virtool_app::{VirtoolApp, VirtoolAppStatus};
use crate::engine::model::AppId;

/// `VirtoolApp` resources as the spec/status store. The resourceVersion is
/// the write token.
#[derive(Clone)]
pub struct KubeAppStore {
    client: Client,
    field_manager: String,
}

impl KubeAppStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api(&self, namespace: &str) -> Api<VirtoolApp> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Server-side apply body for the status subresource. Carrying the
/// resourceVersion makes the apply fail with 409 once someone else wrote.
fn status_body(id: &AppId, status: &VirtoolAppStatus, token: &str) -> serde_json::Value {
    json!({
        "apiVersion": VirtoolApp::api_version(&()),
        "kind": VirtoolApp::kind(&()),
        "metadata": {
            "name": id.name,
            "namespace": id.namespace,
            "resourceVersion": token,
        },
        "status": status,
    })
}

#[async_trait]
impl AppStore for KubeAppStore {
    #[instrument(skip_all, fields(app = %id))]
    async fn get(&self, id: &AppId) -> CollabResult<Versioned<VirtoolApp>> {
        let app = self.api(&id.namespace).get(&id.name).await?;
        let token = app.metadata.resource_version.clone().unwrap_or_default();
        Ok(Versioned { value: app, token })
    }

    #[instrument(skip_all, fields(app = %id))]
    async fn update_status(
        &self,
        id: &AppId,
        status: &VirtoolAppStatus,
        token: &str,
    ) -> CollabResult<String> {
        let body = status_body(id, status, token);
        trace!(body = %body, "applying status");
        let pp = PatchParams::apply(&self.field_manager).force();
        let updated = self
            .api(&id.namespace)
            .patch_status(&id.name, &pp, &Patch::Apply(&body))
            .await?;
        Ok(updated.metadata.resource_version.unwrap_or_default())
    }
}
