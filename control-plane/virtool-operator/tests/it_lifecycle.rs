mod common;

use std::time::Duration;

use common::{Harness, comp, key, only};
use virtool_operator::collaborators::{CollaboratorError, JobOutcome, WorkloadTarget};
use virtool_operator::crd::virtool_app::{
    ComponentPhase, ConditionStatus, ConditionType, UpdateStep,
};
use virtool_operator::engine::EngineError;
use virtool_operator::engine::admission::{RolloutBounds, RolloutPlan};
use virtool_operator::engine::aggregator::REASON_INVALID_SPEC;
use virtool_operator::engine::model::Placement;
use virtool_operator::factory;

#[test_log::test(tokio::test)]
async fn converged_app_reconciles_without_side_effects() {
    let h = Harness::new();
    let mut api = comp(2, 0);
    api.pre_update_job = Some(factory::job("migrate:1", &["migrate"]));
    let id = h
        .create(vec![only(vec![("api", api), ("web", comp(1, 1))])])
        .await;
    h.settle(&id).await;

    let status = h.status(&id).await;
    let writes = h.store.status_writes();
    let applies = h.workloads.apply_count().await;
    let dispatches = h.jobs.dispatch_count().await;

    for _ in 0..2 {
        let report = h.reconcile(&id).await.unwrap();
        assert!(!report.status_written);
        assert!(report.transitions.is_empty());
        assert_eq!(report.requeue, None);
    }
    assert_eq!(h.status(&id).await, status);
    assert_eq!(h.store.status_writes(), writes);
    assert_eq!(h.workloads.apply_count().await, applies);
    assert_eq!(h.jobs.dispatch_count().await, dispatches);
    assert_eq!(
        h.condition(&id, ConditionType::Available).await,
        Some(ConditionStatus::True)
    );
    assert_eq!(
        h.condition(&id, ConditionType::Progressing).await,
        Some(ConditionStatus::False)
    );
}

#[test_log::test(tokio::test)]
async fn running_workload_is_adopted_without_jobs() {
    let h = Harness::new();
    let mut api = comp(2, 0);
    api.pre_update_job = Some(factory::job("migrate:1", &["migrate"]));
    let id = h.create(vec![only(vec![("api", api)])]).await;
    h.workloads
        .seed(
            key(&id, "api"),
            WorkloadTarget {
                version: factory::DEFAULT_VERSION.into(),
                image: factory::DEFAULT_IMAGE.into(),
                replicas: 2,
                resources: None,
                rollout: RolloutPlan::Rolling(RolloutBounds {
                    max_unavailable: 0,
                    max_surge: 1,
                }),
                placement: Placement::default(),
                owner_uid: None,
            },
        )
        .await;

    let report = h.reconcile(&id).await.unwrap();
    assert_eq!(report.transitions.len(), 1);
    assert_eq!(report.transitions[0].from, None);
    assert_eq!(report.transitions[0].to, ComponentPhase::Converged);
    let st = h.component(&id, "api").await.unwrap();
    assert_eq!(st.current_version, factory::DEFAULT_VERSION);
    assert_eq!(st.ready_replicas, 2);
    assert_eq!(h.jobs.dispatch_count().await, 0);
    assert_eq!(h.workloads.apply_count().await, 0);
}

#[test_log::test(tokio::test)]
async fn removed_component_is_pruned_and_its_workload_deleted() {
    let h = Harness::new();
    let id = h
        .create(vec![only(vec![("api", comp(1, 0)), ("worker", comp(1, 0))])])
        .await;
    h.settle(&id).await;
    let api_before = h.component(&id, "api").await.unwrap();

    h.store
        .update_spec(&id, |spec| {
            spec.components.remove("worker");
        })
        .await;
    let report = h.reconcile(&id).await.unwrap();
    assert!(report.status_written);

    let status = h.status(&id).await;
    assert!(!status.component_status.contains_key("worker"));
    assert_eq!(status.component_status["api"], api_before);
    assert_eq!(h.workloads.deleted().await, vec![key(&id, "worker")]);
    assert!(h.workloads.target(&key(&id, "worker")).await.is_none());
}

#[test_log::test(tokio::test)]
async fn invalid_spec_halts_until_fixed() {
    let h = Harness::new();
    let id = h
        .create(vec![
            only(vec![("api", comp(1, 0))]),
            factory::with_strategy("BlueGreen", None, None),
        ])
        .await;

    let report = h.reconcile(&id).await.unwrap();
    assert_eq!(report.requeue, None);
    assert_eq!(h.workloads.apply_count().await, 0);
    let status = h.status(&id).await;
    let degraded = status
        .conditions
        .iter()
        .find(|c| c.type_ == ConditionType::Degraded)
        .unwrap();
    assert_eq!(degraded.status, ConditionStatus::True);
    assert_eq!(degraded.reason.as_deref(), Some(REASON_INVALID_SPEC));
    assert!(degraded.message.as_deref().unwrap().contains("BlueGreen"));

    // nothing changes on repeat
    let report = h.reconcile(&id).await.unwrap();
    assert!(!report.status_written);

    h.store
        .update_spec(&id, |spec| {
            spec.update_strategy.type_ = Some("Recreate".into());
        })
        .await;
    h.settle(&id).await;
    assert_eq!(h.phase(&id, "api").await, Some(ComponentPhase::Converged));
    assert_eq!(
        h.condition(&id, ConditionType::Degraded).await,
        Some(ConditionStatus::False)
    );
}

#[test_log::test(tokio::test)]
async fn one_invalid_app_does_not_affect_another() {
    let h = Harness::new();
    let bad = h
        .insert(factory::new_virtool_app(
            "bad",
            "lab",
            [factory::with_component("Not_A_Label", |_| {})],
        ))
        .await;
    let good = h.create(vec![only(vec![("api", comp(1, 0))])]).await;

    h.reconcile(&bad).await.unwrap();
    h.settle(&good).await;
    assert_eq!(h.phase(&good, "api").await, Some(ComponentPhase::Converged));
    assert_eq!(
        h.condition(&bad, ConditionType::Degraded).await,
        Some(ConditionStatus::True)
    );
}

#[test_log::test(tokio::test)]
async fn unreadable_workload_marks_only_that_component_unknown() {
    let h = Harness::new();
    let id = h
        .create(vec![only(vec![("api", comp(1, 0)), ("web", comp(1, 0))])])
        .await;
    h.workloads.set_observe_failure("api", true).await;

    let report = h.reconcile(&id).await.unwrap();
    assert!(report.requeue.is_some());
    let api = h.component(&id, "api").await.unwrap();
    assert_eq!(api.phase, ComponentPhase::Unknown);
    assert!(api.message.unwrap().contains("unobservable"));
    assert_eq!(h.phase(&id, "web").await, Some(ComponentPhase::Updating));
    assert_eq!(
        h.condition(&id, ConditionType::Degraded).await,
        Some(ConditionStatus::True)
    );

    h.workloads.set_observe_failure("api", false).await;
    h.settle(&id).await;
    assert_eq!(h.phase(&id, "api").await, Some(ComponentPhase::Converged));
    assert_eq!(h.phase(&id, "web").await, Some(ComponentPhase::Converged));
}

#[test_log::test(tokio::test)]
async fn failed_component_waits_out_backoff_across_unobservable_spell() {
    let h = Harness::new();
    let id = h.create(vec![only(vec![("api", comp(1, 0))])]).await;
    h.reconcile(&id).await.unwrap();
    h.reconcile(&id).await.unwrap();
    h.clock.advance(Duration::from_secs(121));
    h.reconcile(&id).await.unwrap();
    let failed = h.component(&id, "api").await.unwrap();
    assert_eq!(failed.phase, ComponentPhase::Failed);
    let applies = h.workloads.apply_count().await;

    h.workloads.set_observe_failure("api", true).await;
    h.reconcile(&id).await.unwrap();
    let st = h.component(&id, "api").await.unwrap();
    assert_eq!(st.phase, ComponentPhase::Unknown);
    assert_eq!(st.failed_step, Some(UpdateStep::Updating));
    assert_eq!(st.next_retry_time, failed.next_retry_time);

    h.workloads.set_observe_failure("api", false).await;
    h.clock.advance(Duration::from_secs(1));
    let report = h.reconcile(&id).await.unwrap();
    let st = h.component(&id, "api").await.unwrap();
    assert_eq!(st.phase, ComponentPhase::Failed);
    assert_eq!(st.attempt, 0);
    assert_eq!(st.next_retry_time, failed.next_retry_time);
    assert_eq!(report.requeue, Some(Duration::from_secs(9)));
    assert_eq!(h.workloads.apply_count().await, applies);

    h.clock.advance(Duration::from_secs(9));
    h.reconcile(&id).await.unwrap();
    let st = h.component(&id, "api").await.unwrap();
    assert_eq!(st.phase, ComponentPhase::Updating);
    assert_eq!(st.attempt, 1);
    h.settle(&id).await;
    assert_eq!(h.phase(&id, "api").await, Some(ComponentPhase::Converged));
}

#[test_log::test(tokio::test)]
async fn version_change_mid_update_restarts_cleanly() {
    let h = Harness::new();
    h.jobs.set_default_outcome(JobOutcome::Running).await;
    let mut api = comp(1, 0);
    api.pre_update_job = Some(factory::job("migrate:1", &["migrate"]));
    let id = h.create(vec![only(vec![("api", api)])]).await;
    h.reconcile(&id).await.unwrap();
    assert_eq!(h.phase(&id, "api").await, Some(ComponentPhase::PreJob));

    h.store
        .update_spec(&id, |spec| {
            spec.components.get_mut("api").unwrap().version = "3.0.0".into();
        })
        .await;
    h.reconcile(&id).await.unwrap();
    let st = h.component(&id, "api").await.unwrap();
    assert_eq!(st.phase, ComponentPhase::Pending);
    assert_eq!(st.desired_version, "3.0.0");
    assert_eq!(st.attempt, 0);

    h.jobs.set_default_outcome(JobOutcome::Succeeded).await;
    h.settle(&id).await;
    let st = h.component(&id, "api").await.unwrap();
    assert_eq!(st.phase, ComponentPhase::Converged);
    assert_eq!(st.current_version, "3.0.0");
    let versions: Vec<String> = h
        .jobs
        .dispatched()
        .await
        .into_iter()
        .map(|r| r.version)
        .collect();
    assert_eq!(versions, vec!["1.0.0", "3.0.0"]);
    let target = h.workloads.target(&key(&id, "api")).await.unwrap();
    assert_eq!(target.version, "3.0.0");
}

#[test_log::test(tokio::test)]
async fn unavailable_store_is_transient() {
    let h = Harness::new();
    let id = h.create(vec![only(vec![("api", comp(1, 0))])]).await;
    h.store.set_unavailable(true);

    let err = h.reconcile(&id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Transient(CollaboratorError::Unavailable(_))
    ));
    assert_eq!(h.workloads.apply_count().await, 0);

    h.store.set_unavailable(false);
    h.settle(&id).await;
    assert_eq!(h.phase(&id, "api").await, Some(ComponentPhase::Converged));
}

#[test_log::test(tokio::test)]
async fn deleted_app_is_a_no_op() {
    let h = Harness::new();
    let id = h.create(vec![only(vec![("api", comp(1, 0))])]).await;
    h.store.remove(&id).await;

    let report = h.reconcile(&id).await.unwrap();
    assert_eq!(report.requeue, None);
    assert!(!report.status_written);
    assert_eq!(h.workloads.apply_count().await, 0);
}
