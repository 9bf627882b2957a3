mod common;

use std::time::Duration;

use common::{Harness, comp, key, only};
use virtool_operator::collaborators::JobOutcome;
use virtool_operator::crd::virtool_app::{ComponentPhase, ComponentSpec, UpdateStep};
use virtool_operator::engine::job_gate::job_key;
use virtool_operator::engine::model::JobPhase;
use virtool_operator::factory;

fn with_jobs(pre: bool, post: bool) -> ComponentSpec {
    let mut c = comp(1, 0);
    if pre {
        c.pre_update_job = Some(factory::job("migrate:1", &["migrate", "--up"]));
    }
    if post {
        c.post_update_job = Some(factory::job("smoke:1", &["smoke"]));
    }
    c
}

#[test_log::test(tokio::test)]
async fn failed_pre_job_blocks_rollout_until_backoff_elapses() {
    let h = Harness::new();
    let id = h.create(vec![only(vec![("api", with_jobs(true, false))])]).await;
    h.jobs
        .script("api", JobPhase::Pre, vec![JobOutcome::Failed("exit 1".into())])
        .await;

    h.reconcile(&id).await.unwrap();
    assert_eq!(h.phase(&id, "api").await, Some(ComponentPhase::PreJob));
    assert_eq!(h.jobs.dispatch_count().await, 1);

    let report = h.reconcile(&id).await.unwrap();
    let st = h.component(&id, "api").await.unwrap();
    assert_eq!(st.phase, ComponentPhase::Failed);
    assert_eq!(st.failed_step, Some(UpdateStep::PreJob));
    assert_eq!(st.message.as_deref(), Some("pre job failed: exit 1"));
    assert!(st.next_retry_time.is_some());
    assert_eq!(report.requeue, Some(Duration::from_secs(10)));

    // still backing off
    h.clock.advance(Duration::from_secs(4));
    let report = h.reconcile(&id).await.unwrap();
    assert_eq!(report.requeue, Some(Duration::from_secs(6)));
    assert!(!report.status_written);
    assert_eq!(h.jobs.dispatch_count().await, 1);
    assert_eq!(h.workloads.apply_count().await, 0);

    h.clock.advance(Duration::from_secs(6));
    h.reconcile(&id).await.unwrap();
    let st = h.component(&id, "api").await.unwrap();
    assert_eq!(st.phase, ComponentPhase::PreJob);
    assert_eq!(st.attempt, 1);
    let dispatched = h.jobs.dispatched().await;
    assert_eq!(dispatched.len(), 2);
    assert_eq!(dispatched[0].spec, dispatched[1].spec);
    assert_ne!(dispatched[0].name, dispatched[1].name);
    assert_eq!(h.workloads.apply_count().await, 0);

    h.settle(&id).await;
    let st = h.component(&id, "api").await.unwrap();
    assert_eq!(st.phase, ComponentPhase::Converged);
    assert_eq!(st.attempt, 0);
    assert_eq!(h.workloads.apply_count().await, 1);
}

#[test_log::test(tokio::test)]
async fn outstanding_job_is_dispatched_once() {
    let h = Harness::new();
    h.jobs.set_default_outcome(JobOutcome::Running).await;
    let id = h.create(vec![only(vec![("api", with_jobs(true, false))])]).await;

    for _ in 0..4 {
        h.cycle(&id).await;
    }
    assert_eq!(h.jobs.dispatch_count().await, 1);
    assert_eq!(h.phase(&id, "api").await, Some(ComponentPhase::PreJob));
    assert!(h.workloads.target(&key(&id, "api")).await.is_none());

    let name = job_key("demo", "api", JobPhase::Pre, "1.0.0", 0);
    assert_eq!(h.jobs.dispatched().await[0].name, name);
    assert!(h.jobs.finish(&name, JobOutcome::Succeeded).await);

    h.reconcile(&id).await.unwrap();
    assert_eq!(h.phase(&id, "api").await, Some(ComponentPhase::Updating));
    // the rollout itself waits for the next cycle's admission check
    assert!(h.workloads.target(&key(&id, "api")).await.is_none());
    h.reconcile(&id).await.unwrap();
    assert!(h.workloads.target(&key(&id, "api")).await.is_some());
}

#[test_log::test(tokio::test)]
async fn post_job_runs_after_rollout_before_convergence() {
    let h = Harness::new();
    h.jobs.set_default_outcome(JobOutcome::Running).await;
    let id = h.create(vec![only(vec![("api", with_jobs(false, true))])]).await;

    for _ in 0..6 {
        h.cycle(&id).await;
    }
    assert_eq!(h.phase(&id, "api").await, Some(ComponentPhase::PostJob));
    let dispatched = h.jobs.dispatched().await;
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].phase, JobPhase::Post);
    let st = h.component(&id, "api").await.unwrap();
    assert_eq!(st.ready_replicas, 1);
    assert_eq!(st.current_version, "");

    h.jobs
        .finish(&dispatched[0].name, JobOutcome::Succeeded)
        .await;
    h.reconcile(&id).await.unwrap();
    let st = h.component(&id, "api").await.unwrap();
    assert_eq!(st.phase, ComponentPhase::Converged);
    assert_eq!(st.current_version, "1.0.0");
}

#[test_log::test(tokio::test)]
async fn failed_post_job_resumes_at_post_job() {
    let h = Harness::new();
    let id = h.create(vec![only(vec![("api", with_jobs(true, true))])]).await;
    h.jobs
        .script("api", JobPhase::Post, vec![JobOutcome::Failed("smoke test red".into())])
        .await;

    for _ in 0..10 {
        h.cycle(&id).await;
        if h.phase(&id, "api").await == Some(ComponentPhase::Failed) {
            break;
        }
    }
    let st = h.component(&id, "api").await.unwrap();
    assert_eq!(st.failed_step, Some(UpdateStep::PostJob));
    let applies = h.workloads.apply_count().await;

    h.clock.advance(Duration::from_secs(10));
    h.settle(&id).await;
    let phases: Vec<JobPhase> = h.jobs.dispatched().await.iter().map(|r| r.phase).collect();
    assert_eq!(phases, vec![JobPhase::Pre, JobPhase::Post, JobPhase::Post]);
    assert_eq!(h.workloads.apply_count().await, applies);
    assert_eq!(h.phase(&id, "api").await, Some(ComponentPhase::Converged));
}

#[test_log::test(tokio::test)]
async fn hung_job_fails_after_deadline() {
    let h = Harness::new();
    h.jobs.set_default_outcome(JobOutcome::Running).await;
    let id = h.create(vec![only(vec![("api", with_jobs(true, false))])]).await;

    h.reconcile(&id).await.unwrap();
    h.clock.advance(Duration::from_secs(60));
    h.reconcile(&id).await.unwrap();
    assert_eq!(h.phase(&id, "api").await, Some(ComponentPhase::PreJob));

    h.clock.advance(Duration::from_secs(61));
    h.reconcile(&id).await.unwrap();
    let st = h.component(&id, "api").await.unwrap();
    assert_eq!(st.phase, ComponentPhase::Failed);
    assert!(st.message.unwrap().contains("deadline"));
}

#[test_log::test(tokio::test)]
async fn repeated_failures_back_off_exponentially() {
    let h = Harness::new();
    h.jobs.set_default_outcome(JobOutcome::Failed("boom".into())).await;
    let id = h.create(vec![only(vec![("api", with_jobs(true, false))])]).await;

    h.reconcile(&id).await.unwrap();
    let mut delays = Vec::new();
    for _ in 0..5 {
        let report = h.reconcile(&id).await.unwrap();
        assert_eq!(h.phase(&id, "api").await, Some(ComponentPhase::Failed));
        let delay = report.requeue.unwrap();
        delays.push(delay.as_secs());
        h.clock.advance(delay);
        // retry dispatches; the job fails on the following cycle
        h.reconcile(&id).await.unwrap();
        assert_eq!(h.phase(&id, "api").await, Some(ComponentPhase::PreJob));
    }
    assert_eq!(delays, vec![10, 20, 40, 80, 80]);
    assert_eq!(h.jobs.dispatch_count().await, 6);
}
