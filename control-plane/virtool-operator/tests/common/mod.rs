#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use virtool_operator::collaborators::memory::{MemoryAppStore, MemoryJobs, MemoryWorkloads};
use virtool_operator::crd::virtool_app::{
    ComponentPhase, ComponentSpec, ComponentStatus, ConditionStatus, ConditionType, GlobalConfig, VirtoolApp,
    VirtoolAppStatus,
};
use virtool_operator::engine::clock::Clock;
use virtool_operator::engine::{
    AppId, Backoff, ComponentKey, EngineError, EngineSettings, ReconcileReport, Reconciler,
};
use virtool_operator::factory::{self, AppOption};

pub type MemoryReconciler = Reconciler<MemoryAppStore, MemoryWorkloads, MemoryJobs>;

/// Clock the test moves by hand.
pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn new() -> Self {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        Self(Mutex::new(start))
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.0.lock().unwrap();
        *now += chrono::Duration::from_std(by).unwrap();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

/// Deterministic settings: no jitter, short deadlines.
pub fn settings() -> EngineSettings {
    EngineSettings {
        backoff: Backoff {
            base: Duration::from_secs(10),
            max: Duration::from_secs(80),
            jitter_pct: 0,
        },
        job_deadline: Duration::from_secs(120),
        rollout_deadline: Duration::from_secs(120),
        ..EngineSettings::default()
    }
}

pub struct Harness {
    pub store: Arc<MemoryAppStore>,
    pub workloads: Arc<MemoryWorkloads>,
    pub jobs: Arc<MemoryJobs>,
    pub clock: Arc<ManualClock>,
    pub reconciler: Arc<MemoryReconciler>,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(settings())
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        let store = Arc::new(MemoryAppStore::new());
        let workloads = Arc::new(MemoryWorkloads::new());
        let jobs = Arc::new(MemoryJobs::new());
        let clock = Arc::new(ManualClock::new());
        let reconciler = Reconciler::new(store.clone(), workloads.clone(), jobs.clone(), settings)
            .with_clock(clock.clone());
        Self {
            store,
            workloads,
            jobs,
            clock,
            reconciler: Arc::new(reconciler),
            cancel: CancellationToken::new(),
        }
    }

    /// Insert an app built from the factory defaults, with no registry so
    /// images stay as written.
    pub async fn create(&self, opts: Vec<AppOption>) -> AppId {
        let mut all: Vec<AppOption> = vec![factory::with_global_config(GlobalConfig::default())];
        all.extend(opts);
        self.store
            .insert(factory::new_virtool_app("demo", "lab", all))
            .await
    }

    pub async fn insert(&self, app: VirtoolApp) -> AppId {
        self.store.insert(app).await
    }

    pub async fn reconcile(&self, id: &AppId) -> Result<ReconcileReport, EngineError> {
        self.reconciler.reconcile(id, &self.cancel).await
    }

    /// One reconcile followed by one workload controller tick.
    pub async fn cycle(&self, id: &AppId) -> ReconcileReport {
        let report = self.reconcile(id).await.expect("reconcile");
        self.workloads.progress_all().await;
        report
    }

    /// Cycle until a reconcile neither writes nor asks to come back.
    /// Returns the number of cycles it took.
    pub async fn settle(&self, id: &AppId) -> usize {
        for n in 1..=50 {
            let report = self.cycle(id).await;
            if !report.status_written && report.requeue.is_none() {
                return n;
            }
        }
        panic!("{} did not settle: {:#?}", id, self.status(id).await);
    }

    pub async fn status(&self, id: &AppId) -> VirtoolAppStatus {
        self.store.status(id).await.unwrap_or_default()
    }

    pub async fn component(&self, id: &AppId, name: &str) -> Option<ComponentStatus> {
        self.status(id).await.component_status.get(name).cloned()
    }

    pub async fn phase(&self, id: &AppId, name: &str) -> Option<ComponentPhase> {
        self.component(id, name).await.map(|c| c.phase)
    }

    pub async fn condition(&self, id: &AppId, type_: ConditionType) -> Option<ConditionStatus> {
        self.status(id)
            .await
            .conditions
            .iter()
            .find(|c| c.type_ == type_)
            .map(|c| c.status)
    }
}

pub fn key(id: &AppId, component: &str) -> ComponentKey {
    ComponentKey::new(id, component)
}

/// Default component with the given scale and update order.
pub fn comp(replicas: i32, order: i32) -> ComponentSpec {
    let mut c = factory::default_component();
    c.replicas = Some(replicas);
    c.update_order = order;
    c
}

/// Replace the factory's component set with exactly `list`.
pub fn only(list: Vec<(&str, ComponentSpec)>) -> AppOption {
    factory::with_components(
        list.into_iter()
            .map(|(name, c)| (name.to_string(), c))
            .collect(),
    )
}
