//! Drives full reconcile passes against the simulated providers.

use std::collections::HashMap;
use std::sync::Arc;

use fleet_lifecycle::{LifecycleConfig, NodeLifecycle};
use fleet_provider::sim::{SimCloud, SimCluster};
use fleet_rebalance::{ExecutorConfig, ScoreWeights};
use fleet_state::{
    ANNOTATION_PAUSED, ConditionKind, EventReason, ExecutionStatus, NodeGroup, NodeGroupSpec,
    NodePhase, Opportunity, RebalancePolicy, ScaleDownPolicy, ScaleUpPolicy, StateStore,
};
use fleetd::reconciler::Reconciler;

const T0: u64 = 1_000_000;

struct Harness {
    store: StateStore,
    cloud: Arc<SimCloud>,
    reconciler: Reconciler,
}

fn harness() -> Harness {
    let store = StateStore::open_in_memory().unwrap();
    let cloud = Arc::new(SimCloud::new("dc-1", &["small", "large"]));
    let cluster = Arc::new(SimCluster::new());
    let lifecycle = Arc::new(NodeLifecycle::new(
        cloud.clone(),
        cluster,
        store.clone(),
        LifecycleConfig::default(),
    ));
    let reconciler = Reconciler::new(lifecycle, ScoreWeights::default(), ExecutorConfig::default(), 30);
    Harness {
        store,
        cloud,
        reconciler,
    }
}

fn spec(min: u32, rebalancing: bool) -> NodeGroupSpec {
    NodeGroupSpec {
        name: "web".into(),
        datacenter_id: "dc-1".into(),
        image_id: "img-1".into(),
        offering_ids: vec!["small".into(), "large".into()],
        min_nodes: min,
        max_nodes: 10,
        scale_up: ScaleUpPolicy::default(),
        scale_down: ScaleDownPolicy::default(),
        rebalancing: RebalancePolicy {
            enabled: rebalancing,
            min_healthy_percent: 50,
            ..RebalancePolicy::default()
        },
        labels: HashMap::new(),
        annotations: HashMap::new(),
    }
}

fn opportunity(id: &str, target: &str, expires_at: Option<u64>) -> Opportunity {
    Opportunity {
        id: id.into(),
        group: "web".into(),
        target_offering_id: target.into(),
        node_names: Vec::new(),
        estimated_savings_percent: 25.0,
        estimated_monthly_savings: 40.0,
        performance_delta_percent: 0.0,
        created_at: T0,
        expires_at,
        version: 0,
    }
}

fn ready_nodes(h: &Harness) -> Vec<String> {
    h.store
        .list_nodes("web")
        .unwrap()
        .into_iter()
        .filter(|n| n.phase == NodePhase::Ready)
        .map(|n| n.offering_id)
        .collect()
}

/// Run passes until the group has `count` Ready nodes. Returns the clock.
async fn settle(h: &Harness, count: usize, mut now: u64) -> u64 {
    for _ in 0..20 {
        h.reconciler.reconcile("web", now).await.unwrap();
        if ready_nodes(h).len() == count {
            return now;
        }
        now += 5;
    }
    panic!("group never reached {count} ready nodes: {:?}", h.store.list_nodes("web"));
}

fn group(h: &Harness) -> NodeGroup {
    h.store.get_group("web").unwrap().unwrap()
}

#[tokio::test]
async fn scales_new_group_up_to_min_nodes() {
    let h = harness();
    h.store.apply_group_spec(spec(2, false), T0).unwrap();

    let first = h.reconciler.reconcile("web", T0).await.unwrap().unwrap();
    let scaling = first.scaling.unwrap();
    assert_eq!(scaling.created.len(), 2);
    assert!(first.requeue_after_secs.unwrap() <= 1);

    settle(&h, 2, T0 + 5).await;
    assert_eq!(ready_nodes(&h), vec!["small", "small"]);
    assert_eq!(h.cloud.created_count(), 2);
    assert_eq!(group(&h).status.current_nodes, 2);
}

#[tokio::test]
async fn deleted_group_is_a_no_op() {
    let h = harness();
    assert_eq!(h.reconciler.reconcile("web", T0).await.unwrap(), None);

    h.store.apply_group_spec(spec(1, false), T0).unwrap();
    h.store.delete_group("web").unwrap();
    assert_eq!(h.reconciler.reconcile("web", T0).await.unwrap(), None);
}

#[tokio::test]
async fn invalid_stored_spec_is_flagged_and_not_reconciled() {
    let h = harness();
    let mut bad = spec(3, false);
    bad.max_nodes = 2;
    let mut g = NodeGroup::new(bad, T0);
    h.store.create_group(&mut g).unwrap();

    let outcome = h.reconciler.reconcile("web", T0).await.unwrap().unwrap();
    assert!(outcome.scaling.is_none());
    assert!(h.store.list_nodes("web").unwrap().is_empty());

    let stored = group(&h);
    let cond = stored
        .status
        .condition(ConditionKind::InvalidConfiguration)
        .unwrap();
    assert!(cond.status);
    assert_eq!(cond.reason, "InvalidSpec");
    let events = h.store.list_events("nodegroup/web", 100).unwrap();
    assert!(events.iter().any(|e| e.reason == EventReason::InvalidConfiguration));

    // Fixing the spec clears the flag on the next pass.
    h.store.apply_group_spec(spec(1, false), T0 + 10).unwrap();
    let outcome = h.reconciler.reconcile("web", T0 + 10).await.unwrap().unwrap();
    assert_eq!(outcome.scaling.unwrap().created.len(), 1);
    assert!(!group(&h).status.has_condition(ConditionKind::InvalidConfiguration));
}

#[tokio::test]
async fn paused_group_creates_nothing() {
    let h = harness();
    let mut paused = spec(2, true);
    paused.annotations.insert(ANNOTATION_PAUSED.into(), "true".into());
    h.store.apply_group_spec(paused, T0).unwrap();
    let mut opp = opportunity("opp-1", "large", None);
    h.store.create_opportunity(&mut opp).unwrap();

    let outcome = h.reconciler.reconcile("web", T0).await.unwrap().unwrap();
    assert!(outcome.scaling.unwrap().created.is_empty());
    assert!(outcome.started_plan.is_none());
    assert!(h.store.list_nodes("web").unwrap().is_empty());
    assert_eq!(h.store.list_opportunities("web").unwrap().len(), 1);
    assert!(group(&h).status.has_condition(ConditionKind::Paused));
}

#[tokio::test]
async fn expired_opportunity_is_discarded() {
    let h = harness();
    h.store.apply_group_spec(spec(3, true), T0).unwrap();
    let now = settle(&h, 3, T0).await;

    let mut opp = opportunity("opp-old", "large", Some(now - 1));
    h.store.create_opportunity(&mut opp).unwrap();

    let outcome = h.reconciler.reconcile("web", now).await.unwrap().unwrap();
    assert_eq!(outcome.discarded_opportunities, vec!["opp-old"]);
    assert!(outcome.started_plan.is_none());
    assert!(h.store.list_opportunities("web").unwrap().is_empty());
}

#[tokio::test]
async fn opportunity_during_cooldown_is_deferred() {
    let h = harness();
    h.store.apply_group_spec(spec(3, true), T0).unwrap();
    let now = settle(&h, 3, T0).await;

    let mut g = group(&h);
    g.status.last_rebalance_time = now - 60;
    h.store.update_group(&mut g).unwrap();
    let mut opp = opportunity("opp-1", "large", None);
    h.store.create_opportunity(&mut opp).unwrap();

    let outcome = h.reconciler.reconcile("web", now).await.unwrap().unwrap();
    assert!(outcome.started_plan.is_none());
    assert!(outcome.discarded_opportunities.is_empty());
    assert!(outcome.requeue_after_secs.unwrap() <= 30);
    assert_eq!(h.store.list_opportunities("web").unwrap().len(), 1);

    let blocked = group(&h);
    let cond = blocked.status.condition(ConditionKind::RebalanceBlocked).unwrap();
    assert!(cond.status);
    assert_eq!(cond.reason, "OpportunityDeferred");
}

#[tokio::test]
async fn opportunity_without_headroom_is_discarded() {
    let h = harness();
    let mut tight = spec(3, true);
    tight.rebalancing.min_healthy_percent = 100;
    h.store.apply_group_spec(tight, T0).unwrap();
    let now = settle(&h, 3, T0).await;

    let mut opp = opportunity("opp-1", "large", None);
    h.store.create_opportunity(&mut opp).unwrap();

    let outcome = h.reconciler.reconcile("web", now).await.unwrap().unwrap();
    assert!(outcome.started_plan.is_none());
    assert_eq!(outcome.discarded_opportunities, vec!["opp-1"]);
    let events = h.store.list_events("nodegroup/web", 100).unwrap();
    assert!(events.iter().any(|e| e.reason == EventReason::SafetyCheckFailed));
}

#[tokio::test]
async fn opportunity_rebalances_group_onto_target_offering() {
    let h = harness();
    h.store.apply_group_spec(spec(3, true), T0).unwrap();
    let mut now = settle(&h, 3, T0).await;
    assert!(ready_nodes(&h).iter().all(|o| o == "small"));

    let mut opp = opportunity("opp-1", "large", None);
    h.store.create_opportunity(&mut opp).unwrap();

    now += 5;
    let outcome = h.reconciler.reconcile("web", now).await.unwrap().unwrap();
    let plan_id = outcome.started_plan.expect("plan should start");
    assert_eq!(outcome.discarded_opportunities, vec!["opp-1"]);
    assert!(h.store.list_opportunities("web").unwrap().is_empty());
    assert_eq!(group(&h).status.active_plan.as_deref(), Some(plan_id.as_str()));

    let mut finished = false;
    for _ in 0..100 {
        now += 5;
        h.reconciler.reconcile("web", now).await.unwrap();
        if h.store.active_execution("web").unwrap().is_none() {
            finished = true;
            break;
        }
    }
    assert!(finished, "rebalance never finished");

    let exec = h.store.get_execution(&plan_id).unwrap().unwrap();
    assert_eq!(exec.status, ExecutionStatus::Succeeded);

    let live: Vec<_> = h
        .store
        .list_nodes("web")
        .unwrap()
        .into_iter()
        .filter(|n| n.phase.is_live())
        .collect();
    assert_eq!(live.len(), 3);
    assert!(live.iter().all(|n| n.offering_id == "large"));

    let stored = group(&h);
    assert!(stored.status.last_rebalance_time > 0);
    assert_eq!(stored.status.active_plan, None);
}
