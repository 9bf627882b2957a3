use std::time::Duration;

use envconfig::Envconfig;

use crate::engine::{Backoff, EngineSettings};

#[derive(Envconfig, Clone, Debug)]
pub struct OperatorConfig {
    /// Only watch this namespace; all namespaces when unset.
    /// Env: VTO_WATCH_NAMESPACE
    #[envconfig(from = "VTO_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Server-side apply field manager and event reporter name
    #[envconfig(from = "VTO_FIELD_MANAGER", default = "virtool-operator")]
    pub field_manager: String,

    #[envconfig(from = "VTO_MAX_CONCURRENT_RECONCILES", default = "4")]
    pub max_concurrent_reconciles: usize,

    /// Status write attempts per reconcile when writes keep conflicting
    #[envconfig(from = "VTO_STATUS_WRITE_ATTEMPTS", default = "3")]
    pub status_write_attempts: u32,

    #[envconfig(nested)]
    pub requeue: RequeueConfig,

    #[envconfig(nested)]
    pub backoff: BackoffConfig,

    #[envconfig(nested)]
    pub deadlines: DeadlineConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct RequeueConfig {
    #[envconfig(from = "VTO_REQUEUE_PROGRESS_SECS", default = "5")]
    pub progress_secs: u64,
    #[envconfig(from = "VTO_REQUEUE_TRANSIENT_SECS", default = "10")]
    pub transient_secs: u64,
    /// Periodic re-check of converged applications. Off when unset.
    /// Env: VTO_REQUEUE_RESYNC_SECS
    #[envconfig(from = "VTO_REQUEUE_RESYNC_SECS")]
    pub resync_secs: Option<u64>,
}

/// Retry delay for failed update steps: base doubling per attempt, capped.
#[derive(Envconfig, Clone, Debug)]
pub struct BackoffConfig {
    #[envconfig(from = "VTO_BACKOFF_BASE_SECS", default = "10")]
    pub base_secs: u64,
    #[envconfig(from = "VTO_BACKOFF_MAX_SECS", default = "300")]
    pub max_secs: u64,
    #[envconfig(from = "VTO_BACKOFF_JITTER_PCT", default = "20")]
    pub jitter_pct: u32,
}

#[derive(Envconfig, Clone, Debug)]
pub struct DeadlineConfig {
    #[envconfig(from = "VTO_JOB_DEADLINE_SECS", default = "1800")]
    pub job_secs: u64,
    #[envconfig(from = "VTO_ROLLOUT_DEADLINE_SECS", default = "600")]
    pub rollout_secs: u64,
}

impl OperatorConfig {
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            progress_requeue: Duration::from_secs(self.requeue.progress_secs.max(1)),
            transient_requeue: Duration::from_secs(self.requeue.transient_secs.max(1)),
            resync: self
                .requeue
                .resync_secs
                .filter(|s| *s > 0)
                .map(Duration::from_secs),
            backoff: Backoff {
                base: Duration::from_secs(self.backoff.base_secs),
                max: Duration::from_secs(self.backoff.max_secs.max(self.backoff.base_secs)),
                jitter_pct: self.backoff.jitter_pct.min(100),
            },
            status_write_attempts: self.status_write_attempts.max(1),
            job_deadline: Duration::from_secs(self.deadlines.job_secs),
            rollout_deadline: Duration::from_secs(self.deadlines.rollout_secs),
            max_concurrent_reconciles: self.max_concurrent_reconciles.max(1),
        }
    }
}
