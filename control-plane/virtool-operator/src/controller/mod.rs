pub mod events;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::controller::{self, Action};
use kube::runtime::events::{Recorder, Reporter};
use kube::runtime::{Controller, watcher};
use kube::{Api, Client, Resource};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::collaborators::k8s::{KubeAppStore, KubeJobs, KubeWorkloads, MANAGED_BY};
use crate::config::OperatorConfig;
use crate::crd::virtool_app::VirtoolApp;
use crate::engine::{AppId, EngineError, Reconciler};

#[derive(thiserror::Error, Debug)]
pub enum ReconcileErr {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

pub type KubeReconciler = Reconciler<KubeAppStore, KubeWorkloads, KubeJobs>;

pub struct ControllerContext {
    pub reconciler: KubeReconciler,
    pub recorder: Recorder,
    pub shutdown: CancellationToken,
    pub transient_requeue: Duration,
}

fn api_for<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = kube::core::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Watch `VirtoolApp`s and the objects they own until `shutdown` fires.
pub async fn run_controller(
    client: Client,
    cfg: OperatorConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let settings = cfg.engine_settings();
    let ns = cfg.watch_namespace.as_deref();
    let apps: Api<VirtoolApp> = api_for(&client, ns);
    let deployments: Api<Deployment> = api_for(&client, ns);
    let jobs: Api<Job> = api_for(&client, ns);

    let reconciler = Reconciler::new(
        Arc::new(KubeAppStore::new(client.clone(), &cfg.field_manager)),
        Arc::new(KubeWorkloads::new(client.clone(), &cfg.field_manager)),
        Arc::new(KubeJobs::new(client.clone())),
        settings.clone(),
    );
    let recorder = Recorder::new(
        client.clone(),
        Reporter {
            controller: cfg.field_manager.clone(),
            instance: std::env::var("HOSTNAME").ok(),
        },
    );
    let ctx = Arc::new(ControllerContext {
        reconciler,
        recorder,
        shutdown: shutdown.clone(),
        transient_requeue: settings.transient_requeue,
    });

    let owned = watcher::Config::default()
        .labels(&format!("app.kubernetes.io/managed-by={}", MANAGED_BY));
    let concurrency = u16::try_from(settings.max_concurrent_reconciles).unwrap_or(u16::MAX);
    info!(namespace = ?ns, concurrency, "starting VirtoolApp controller");

    Controller::new(apps, watcher::Config::default())
        .owns(deployments, owned.clone())
        .owns(jobs, owned)
        .with_config(controller::Config::default().concurrency(concurrency))
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj_ref, action)) => debug!(app = %obj_ref.name, ?action, "reconciled"),
                Err(e) => error!(error = %e, "reconcile error"),
            }
        })
        .await;

    info!("controller stopped");
    Ok(())
}

#[instrument(skip_all, fields(app = %AppId::of(&obj)))]
async fn reconcile(
    obj: Arc<VirtoolApp>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileErr> {
    // owned workloads and jobs are collected through their owner references
    if obj.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let id = AppId::of(&obj);
    let report = ctx.reconciler.reconcile(&id, &ctx.shutdown).await?;
    for t in &report.transitions {
        events::emit_transition(&ctx.recorder, &obj, t).await;
    }
    Ok(match report.requeue {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    })
}

fn error_policy(obj: Arc<VirtoolApp>, error: &ReconcileErr, ctx: Arc<ControllerContext>) -> Action {
    match error {
        ReconcileErr::Engine(EngineError::Cancelled) => Action::await_change(),
        ReconcileErr::Engine(e) => {
            warn!(app = %AppId::of(&obj), error = %e, "reconcile failed; requeueing");
            Action::requeue(ctx.transient_requeue)
        }
    }
}
