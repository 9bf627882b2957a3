use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::error::CollaboratorError;
use super::traits::*;
use crate::crd::virtool_app::{VirtoolApp, VirtoolAppSpec, VirtoolAppStatus};
use crate::engine::admission::RolloutPlan;
use crate::engine::model::{AppId, ComponentKey, ComponentObserved, JobPhase};

struct StoredApp {
    app: VirtoolApp,
    version: u64,
}

/// Application store with resource-version style optimistic concurrency.
#[derive(Clone, Default)]
pub struct MemoryAppStore {
    store: Arc<RwLock<HashMap<AppId, StoredApp>>>,
    injected_conflicts: Arc<AtomicU32>,
    status_writes: Arc<AtomicU64>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryAppStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, mut app: VirtoolApp) -> AppId {
        if app.metadata.namespace.is_none() {
            app.metadata.namespace = Some("default".into());
        }
        if app.metadata.generation.is_none() {
            app.metadata.generation = Some(1);
        }
        app.metadata.resource_version = Some("1".into());
        let id = AppId::of(&app);
        self.store
            .write()
            .await
            .insert(id.clone(), StoredApp { app, version: 1 });
        id
    }

    /// Edit the spec as a user would; bumps generation and version.
    pub async fn update_spec<F>(&self, id: &AppId, edit: F) -> bool
    where
        F: FnOnce(&mut VirtoolAppSpec),
    {
        let mut store = self.store.write().await;
        match store.get_mut(id) {
            Some(stored) => {
                edit(&mut stored.app.spec);
                stored.version += 1;
                stored.app.metadata.generation =
                    Some(stored.app.metadata.generation.unwrap_or(0) + 1);
                stored.app.metadata.resource_version = Some(stored.version.to_string());
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, id: &AppId) {
        self.store.write().await.remove(id);
    }

    pub async fn status(&self, id: &AppId) -> Option<VirtoolAppStatus> {
        self.store
            .read()
            .await
            .get(id)
            .and_then(|s| s.app.status.clone())
    }

    /// Make the next `n` status writes lose a race against another writer.
    pub fn inject_conflicts(&self, n: u32) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn status_writes(&self) -> u64 {
        self.status_writes.load(Ordering::SeqCst)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> CollabResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AppStore for MemoryAppStore {
    async fn get(&self, id: &AppId) -> CollabResult<Versioned<VirtoolApp>> {
        self.check_available()?;
        let store = self.store.read().await;
        let stored = store
            .get(id)
            .ok_or_else(|| CollaboratorError::NotFound(id.to_string()))?;
        Ok(Versioned {
            value: stored.app.clone(),
            token: stored.version.to_string(),
        })
    }

    async fn update_status(
        &self,
        id: &AppId,
        status: &VirtoolAppStatus,
        token: &str,
    ) -> CollabResult<String> {
        self.check_available()?;
        let mut store = self.store.write().await;
        let stored = store
            .get_mut(id)
            .ok_or_else(|| CollaboratorError::NotFound(id.to_string()))?;
        let injected = self
            .injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            stored.version += 1;
            stored.app.metadata.resource_version = Some(stored.version.to_string());
        }
        if injected || stored.version.to_string() != token {
            return Err(CollaboratorError::Conflict(format!(
                "{}: token {} is stale (current {})",
                id, token, stored.version
            )));
        }
        stored.app.status = Some(status.clone());
        stored.version += 1;
        stored.app.metadata.resource_version = Some(stored.version.to_string());
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored.version.to_string())
    }
}

/// Instance counts of a simulated workload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PodCounts {
    /// Ready instances running a previous template
    pub old_ready: i32,
    /// Ready instances running the current template
    pub new_ready: i32,
    /// Current-template instances not ready yet
    pub new_pending: i32,
}

#[derive(Clone, Debug)]
struct SimWorkload {
    target: WorkloadTarget,
    pods: PodCounts,
}

impl SimWorkload {
    /// One reconcile tick of a deployment-like controller honoring the
    /// rollout plan it was given.
    fn tick(&mut self) {
        let r = self.target.replicas;
        let p = &mut self.pods;
        p.new_ready += p.new_pending;
        p.new_pending = 0;
        match self.target.rollout {
            RolloutPlan::Rolling(bounds) => {
                let min_ready = (r - bounds.max_unavailable).max(0);
                let killable = (p.old_ready + p.new_ready - min_ready)
                    .max(0)
                    .min(p.old_ready);
                p.old_ready -= killable;
                p.new_ready = p.new_ready.min(r);
                let total = p.old_ready + p.new_ready;
                let room = (r + bounds.max_surge - total).max(0);
                let need = (r - p.new_ready).max(0);
                p.new_pending = room.min(need);
            }
            RolloutPlan::Recreate => {
                p.old_ready = 0;
                p.new_ready = p.new_ready.min(r);
                p.new_pending = (r - p.new_ready).max(0);
            }
        }
    }

    fn observed(&self) -> ComponentObserved {
        let p = &self.pods;
        ComponentObserved {
            exists: true,
            current_version: Some(self.target.version.clone()),
            image: Some(self.target.image.clone()),
            spec_replicas: self.target.replicas,
            replicas: p.old_ready + p.new_ready + p.new_pending,
            ready_replicas: p.old_ready + p.new_ready,
            updated_replicas: p.new_ready + p.new_pending,
        }
    }
}

/// Workload collaborator that simulates rollouts tick by tick.
#[derive(Clone, Default)]
pub struct MemoryWorkloads {
    store: Arc<RwLock<HashMap<ComponentKey, SimWorkload>>>,
    applies: Arc<RwLock<Vec<(ComponentKey, WorkloadTarget)>>>,
    deleted: Arc<RwLock<Vec<ComponentKey>>>,
    failing: Arc<RwLock<HashSet<String>>>,
    rejected_versions: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryWorkloads {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a workload that is already fully rolled out.
    pub async fn seed(&self, key: ComponentKey, target: WorkloadTarget) {
        let pods = PodCounts {
            old_ready: 0,
            new_ready: target.replicas,
            new_pending: 0,
        };
        self.store
            .write()
            .await
            .insert(key, SimWorkload { target, pods });
    }

    /// Advance every workload by one controller tick.
    pub async fn progress_all(&self) {
        for w in self.store.write().await.values_mut() {
            w.tick();
        }
    }

    pub async fn progress(&self, key: &ComponentKey) {
        if let Some(w) = self.store.write().await.get_mut(key) {
            w.tick();
        }
    }

    /// Lose `n` ready instances, as if they crashed.
    pub async fn lose_ready(&self, key: &ComponentKey, n: i32) {
        if let Some(w) = self.store.write().await.get_mut(key) {
            let lost = n.min(w.pods.new_ready);
            w.pods.new_ready -= lost;
            w.pods.new_pending += lost;
        }
    }

    pub async fn pods(&self, key: &ComponentKey) -> Option<PodCounts> {
        self.store.read().await.get(key).map(|w| w.pods)
    }

    pub async fn target(&self, key: &ComponentKey) -> Option<WorkloadTarget> {
        self.store.read().await.get(key).map(|w| w.target.clone())
    }

    pub async fn set_observe_failure(&self, component: &str, failing: bool) {
        let mut f = self.failing.write().await;
        if failing {
            f.insert(component.to_string());
        } else {
            f.remove(component);
        }
    }

    /// Refuse every template for `version`, as an API server refuses an
    /// invalid object. `None` accepts it again.
    pub async fn reject_version(&self, version: &str, reason: Option<&str>) {
        let mut r = self.rejected_versions.write().await;
        match reason {
            Some(reason) => {
                r.insert(version.to_string(), reason.to_string());
            }
            None => {
                r.remove(version);
            }
        }
    }

    pub async fn applies(&self) -> Vec<(ComponentKey, WorkloadTarget)> {
        self.applies.read().await.clone()
    }

    pub async fn apply_count(&self) -> usize {
        self.applies.read().await.len()
    }

    pub async fn deleted(&self) -> Vec<ComponentKey> {
        self.deleted.read().await.clone()
    }
}

#[async_trait]
impl WorkloadBackend for MemoryWorkloads {
    async fn apply(&self, key: &ComponentKey, target: &WorkloadTarget) -> CollabResult<()> {
        if let Some(reason) = self.rejected_versions.read().await.get(&target.version) {
            return Err(CollaboratorError::Rejected(reason.clone()));
        }
        self.applies
            .write()
            .await
            .push((key.clone(), target.clone()));
        let mut store = self.store.write().await;
        match store.get_mut(key) {
            Some(w) => {
                let template_changed =
                    w.target.version != target.version || w.target.image != target.image;
                if template_changed {
                    w.pods.old_ready += w.pods.new_ready;
                    w.pods.new_ready = 0;
                    w.pods.new_pending = 0;
                }
                w.target = target.clone();
            }
            None => {
                store.insert(
                    key.clone(),
                    SimWorkload {
                        target: target.clone(),
                        pods: PodCounts::default(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn observe(&self, key: &ComponentKey) -> CollabResult<Option<ComponentObserved>> {
        if self.failing.read().await.contains(&key.component) {
            return Err(CollaboratorError::Unavailable(format!(
                "cannot read workload for {}",
                key
            )));
        }
        Ok(self.store.read().await.get(key).map(SimWorkload::observed))
    }

    async fn delete(&self, key: &ComponentKey) -> CollabResult<()> {
        self.store.write().await.remove(key);
        self.deleted.write().await.push(key.clone());
        Ok(())
    }
}

struct SimJob {
    request: JobRequest,
    outcome: JobOutcome,
}

/// Job collaborator whose outcomes are scripted per component and phase.
#[derive(Clone)]
pub struct MemoryJobs {
    store: Arc<RwLock<HashMap<String, SimJob>>>,
    dispatches: Arc<RwLock<Vec<JobRequest>>>,
    scripted: Arc<RwLock<HashMap<(String, JobPhase), VecDeque<JobOutcome>>>>,
    default_outcome: Arc<RwLock<JobOutcome>>,
}

impl Default for MemoryJobs {
    fn default() -> Self {
        Self {
            store: Arc::default(),
            dispatches: Arc::default(),
            scripted: Arc::default(),
            default_outcome: Arc::new(RwLock::new(JobOutcome::Succeeded)),
        }
    }
}

impl MemoryJobs {
    /// Jobs succeed as soon as they are dispatched unless scripted otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_default_outcome(&self, outcome: JobOutcome) {
        *self.default_outcome.write().await = outcome;
    }

    /// Outcomes handed, in order, to the next dispatches for that component
    /// and phase.
    pub async fn script(&self, component: &str, phase: JobPhase, outcomes: Vec<JobOutcome>) {
        self.scripted
            .write()
            .await
            .entry((component.to_string(), phase))
            .or_default()
            .extend(outcomes);
    }

    /// Settle a job that is still running.
    pub async fn finish(&self, job_name: &str, outcome: JobOutcome) -> bool {
        match self.store.write().await.get_mut(job_name) {
            Some(job) => {
                job.outcome = outcome;
                true
            }
            None => false,
        }
    }

    pub async fn dispatched(&self) -> Vec<JobRequest> {
        self.dispatches.read().await.clone()
    }

    pub async fn dispatch_count(&self) -> usize {
        self.dispatches.read().await.len()
    }

    pub async fn request(&self, job_name: &str) -> Option<JobRequest> {
        self.store
            .read()
            .await
            .get(job_name)
            .map(|j| j.request.clone())
    }
}

#[async_trait]
impl JobBackend for MemoryJobs {
    async fn dispatch(&self, request: &JobRequest) -> CollabResult<()> {
        let mut store = self.store.write().await;
        if store.contains_key(&request.name) {
            return Err(CollaboratorError::AlreadyDispatched(request.name.clone()));
        }
        let scripted = self
            .scripted
            .write()
            .await
            .get_mut(&(request.component.component.clone(), request.phase))
            .and_then(VecDeque::pop_front);
        let outcome = match scripted {
            Some(o) => o,
            None => self.default_outcome.read().await.clone(),
        };
        store.insert(
            request.name.clone(),
            SimJob {
                request: request.clone(),
                outcome,
            },
        );
        self.dispatches.write().await.push(request.clone());
        Ok(())
    }

    async fn status(&self, _key: &ComponentKey, job_name: &str) -> CollabResult<Option<JobOutcome>> {
        Ok(self
            .store
            .read()
            .await
            .get(job_name)
            .map(|j| j.outcome.clone()))
    }
}
