mod common;

use std::time::Duration;

use common::{Harness, comp, key, only};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use virtool_operator::crd::virtool_app::{
    ComponentPhase, ConditionStatus, ConditionType, UpdateStep,
};
use virtool_operator::factory;

/// Bump `component` to 2.0.0 and cycle until it converges, checking the
/// workload's instance counts after every reconcile and every tick.
async fn roll_to_v2<F>(h: &Harness, id: &virtool_operator::engine::AppId, component: &str, check: F)
where
    F: Fn(virtool_operator::collaborators::memory::PodCounts),
{
    h.store
        .update_spec(id, |spec| {
            spec.components.get_mut(component).unwrap().version = "2.0.0".into();
        })
        .await;
    let k = key(id, component);
    for _ in 0..30 {
        h.reconcile(id).await.unwrap();
        check(h.workloads.pods(&k).await.unwrap());
        if h.phase(id, component).await == Some(ComponentPhase::Converged) {
            let st = h.component(id, component).await.unwrap();
            if st.current_version == "2.0.0" {
                return;
            }
        }
        h.workloads.progress(&k).await;
        check(h.workloads.pods(&k).await.unwrap());
    }
    panic!("{} never converged on 2.0.0", component);
}

#[test_log::test(tokio::test)]
async fn rolling_update_stays_within_bounds() {
    let h = Harness::new();
    let id = h.create(vec![only(vec![("api", comp(4, 0))])]).await;
    h.settle(&id).await;

    // 25% of 4: one unavailable, one surge
    roll_to_v2(&h, &id, "api", |p| {
        assert!(p.old_ready + p.new_ready >= 3, "{:?}", p);
        assert!(p.old_ready + p.new_ready + p.new_pending <= 5, "{:?}", p);
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn surge_only_strategy_never_drops_below_desired() {
    let h = Harness::new();
    let id = h
        .create(vec![
            only(vec![("api", comp(3, 0))]),
            factory::with_strategy(
                "RollingUpdate",
                Some(IntOrString::Int(0)),
                Some(IntOrString::Int(1)),
            ),
        ])
        .await;
    h.settle(&id).await;

    roll_to_v2(&h, &id, "api", |p| {
        assert!(p.old_ready + p.new_ready >= 3, "{:?}", p);
        assert!(p.old_ready + p.new_ready + p.new_pending <= 4, "{:?}", p);
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn recreate_never_mixes_ready_versions() {
    let h = Harness::new();
    let id = h
        .create(vec![
            only(vec![("api", comp(2, 0))]),
            factory::with_strategy("Recreate", None, None),
        ])
        .await;
    h.settle(&id).await;

    roll_to_v2(&h, &id, "api", |p| {
        assert!(!(p.old_ready > 0 && p.new_ready > 0), "{:?}", p);
    })
    .await;
    let scales: Vec<i32> = h
        .workloads
        .applies()
        .await
        .into_iter()
        .filter(|(_, t)| t.version == "2.0.0")
        .map(|(_, t)| t.replicas)
        .collect();
    assert_eq!(scales, vec![0, 2]);
}

#[test_log::test(tokio::test)]
async fn scaling_without_version_change_skips_jobs() {
    let h = Harness::new();
    let mut api = comp(2, 0);
    api.pre_update_job = Some(factory::job("migrate:1", &["migrate"]));
    api.post_update_job = Some(factory::job("smoke:1", &["smoke"]));
    let id = h.create(vec![only(vec![("api", api)])]).await;
    h.settle(&id).await;
    assert_eq!(h.jobs.dispatch_count().await, 2);

    h.store
        .update_spec(&id, |spec| {
            spec.components.get_mut("api").unwrap().replicas = Some(3);
        })
        .await;
    h.reconcile(&id).await.unwrap();
    assert_eq!(h.phase(&id, "api").await, Some(ComponentPhase::Updating));
    h.settle(&id).await;

    assert_eq!(h.jobs.dispatch_count().await, 2);
    let target = h.workloads.target(&key(&id, "api")).await.unwrap();
    assert_eq!(target.replicas, 3);
    let st = h.component(&id, "api").await.unwrap();
    assert_eq!(st.phase, ComponentPhase::Converged);
    assert_eq!(st.ready_replicas, 3);
}

#[test_log::test(tokio::test)]
async fn lost_replicas_are_recovered() {
    let h = Harness::new();
    let id = h.create(vec![only(vec![("api", comp(2, 0))])]).await;
    h.settle(&id).await;

    h.workloads.lose_ready(&key(&id, "api"), 1).await;
    h.reconcile(&id).await.unwrap();
    let st = h.component(&id, "api").await.unwrap();
    assert_eq!(st.phase, ComponentPhase::Converged);
    assert_eq!(st.ready_replicas, 1);
    assert_eq!(
        h.condition(&id, ConditionType::Available).await,
        Some(ConditionStatus::False)
    );

    h.workloads.progress_all().await;
    h.settle(&id).await;
    assert_eq!(h.component(&id, "api").await.unwrap().ready_replicas, 2);
}

#[test_log::test(tokio::test)]
async fn stalled_rollout_fails_after_deadline() {
    let h = Harness::new();
    let id = h.create(vec![only(vec![("api", comp(1, 0))])]).await;

    // the workload never makes progress
    h.reconcile(&id).await.unwrap();
    h.reconcile(&id).await.unwrap();
    assert_eq!(h.phase(&id, "api").await, Some(ComponentPhase::Updating));

    h.clock.advance(Duration::from_secs(121));
    let report = h.reconcile(&id).await.unwrap();
    let st = h.component(&id, "api").await.unwrap();
    assert_eq!(st.phase, ComponentPhase::Failed);
    assert_eq!(st.failed_step, Some(UpdateStep::Updating));
    assert!(st.message.unwrap().contains("rollout incomplete"));
    assert_eq!(report.requeue, Some(Duration::from_secs(10)));

    // retry after backoff; the workload recovers this time
    h.clock.advance(Duration::from_secs(10));
    h.settle(&id).await;
    let st = h.component(&id, "api").await.unwrap();
    assert_eq!(st.phase, ComponentPhase::Converged);
    assert_eq!(st.attempt, 0);
}

#[test_log::test(tokio::test)]
async fn rejected_template_fails_with_growing_backoff() {
    let h = Harness::new();
    h.workloads
        .reject_version("1.0.0", Some("spec.template: Invalid value"))
        .await;
    let id = h.create(vec![only(vec![("api", comp(1, 0))])]).await;

    let report = h.reconcile(&id).await.unwrap();
    let st = h.component(&id, "api").await.unwrap();
    assert_eq!(st.phase, ComponentPhase::Failed);
    assert_eq!(st.failed_step, Some(UpdateStep::Updating));
    assert!(st.message.unwrap().contains("Invalid value"));
    assert_eq!(report.requeue, Some(Duration::from_secs(10)));

    h.clock.advance(Duration::from_secs(10));
    let report = h.reconcile(&id).await.unwrap();
    let st = h.component(&id, "api").await.unwrap();
    assert_eq!(st.phase, ComponentPhase::Failed);
    assert_eq!(st.attempt, 1);
    assert_eq!(report.requeue, Some(Duration::from_secs(20)));
    assert_eq!(h.workloads.apply_count().await, 0);

    h.workloads.reject_version("1.0.0", None).await;
    h.clock.advance(Duration::from_secs(20));
    h.settle(&id).await;
    let st = h.component(&id, "api").await.unwrap();
    assert_eq!(st.phase, ComponentPhase::Converged);
    assert_eq!(st.attempt, 0);
}
