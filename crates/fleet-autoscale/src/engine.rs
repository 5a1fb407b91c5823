//! Applying scaling decisions to a group.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use fleet_lifecycle::NodeLifecycle;
use fleet_provider::{NodeUtilization, Offering, Quota};
use fleet_safety::{SafetyContext, SafetySignals, evaluate_scale_down};
use fleet_state::{
    ConditionKind, Event, EventReason, ManagedNode, NodeGroup, NodeOwner, NodePhase, StateError,
    effective_bounds,
};
use tracing::{debug, info, warn};

use crate::decision::{ScaleDecision, ScaleDirection, aggregate, evaluate};
use crate::error::ScaleResult;

/// Condition reason used when override annotations are ignored.
const OVERRIDE_IGNORED: &str = "OverrideIgnored";

/// What one scaling pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleOutcome {
    pub decision: Option<ScaleDecision>,
    pub created: Vec<String>,
    pub terminated: Vec<String>,
    pub requeue_after_secs: Option<u64>,
}

impl ScaleOutcome {
    fn idle() -> Self {
        Self {
            decision: None,
            created: Vec::new(),
            terminated: Vec::new(),
            requeue_after_secs: None,
        }
    }
}

/// The scaling decision engine for node groups.
pub struct Autoscaler {
    lifecycle: Arc<NodeLifecycle>,
}

impl Autoscaler {
    pub fn new(lifecycle: Arc<NodeLifecycle>) -> Self {
        Self { lifecycle }
    }

    /// Run one scaling pass for `group` and persist its status.
    ///
    /// `protected` lists nodes touched by an in-progress rebalance; they are
    /// never chosen for scale-down. Nodes owned by a rebalance are not
    /// counted towards the group's current size.
    pub async fn reconcile_group(
        &self,
        group: &mut NodeGroup,
        protected: &[String],
        now: u64,
    ) -> ScaleResult<ScaleOutcome> {
        let store = self.lifecycle.store();
        let name = group.name().to_string();
        let mut outcome = ScaleOutcome::idle();

        if group.is_paused() {
            if group
                .status
                .set_condition(ConditionKind::Paused, true, "Annotated", "scaling suspended", now)
            {
                info!(group = %name, "group paused, scaling suspended");
                store.update_group(group)?;
            }
            return Ok(outcome);
        }
        group
            .status
            .set_condition(ConditionKind::Paused, false, "NotPaused", "", now);

        let bounds = effective_bounds(&group.spec);
        if bounds.ignored.is_empty() {
            if group
                .status
                .condition(ConditionKind::InvalidConfiguration)
                .is_some_and(|c| c.reason == OVERRIDE_IGNORED)
            {
                group
                    .status
                    .set_condition(ConditionKind::InvalidConfiguration, false, "Valid", "", now);
            }
        } else {
            let msg = bounds.ignored.join("; ");
            if group.status.set_condition(
                ConditionKind::InvalidConfiguration,
                true,
                OVERRIDE_IGNORED,
                &msg,
                now,
            ) {
                store.emit(Event::new(
                    group.object_ref(),
                    EventReason::InvalidConfiguration,
                    format!("ignoring override annotations: {msg}"),
                    now,
                ));
            }
        }

        let nodes: Vec<ManagedNode> = store
            .list_nodes(&name)?
            .into_iter()
            .filter(|n| n.owner == NodeOwner::Scaling)
            .collect();
        let current = nodes.iter().filter(|n| n.phase.is_live()).count() as u32;
        let ready: Vec<&ManagedNode> = nodes.iter().filter(|n| n.phase == NodePhase::Ready).collect();

        // Failed nodes are removed only once capacity without them suffices.
        if current >= bounds.min_nodes {
            for node in nodes.iter().filter(|n| n.phase == NodePhase::Failed) {
                let mut node = node.clone();
                self.lifecycle
                    .request_termination(&mut node, "replacing failed node", now)?;
                outcome.terminated.push(node.name.clone());
            }
        }

        let names: Vec<String> = ready.iter().map(|n| n.kube_name().to_string()).collect();
        let samples: Vec<NodeUtilization> = if names.is_empty() {
            Vec::new()
        } else {
            match self.lifecycle.cluster().node_utilization(&names).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(group = %name, error = %e, "utilization unavailable");
                    Vec::new()
                }
            }
        };
        let cpu_by_node: HashMap<String, f64> =
            samples.iter().map(|s| (s.node.clone(), s.cpu_percent)).collect();

        let decision = evaluate(
            &group.spec,
            &bounds,
            &group.status,
            current,
            aggregate(&samples),
            now,
        );
        debug!(
            group = %name,
            current = decision.current,
            desired = decision.desired,
            reason = %decision.reason,
            "scaling decision"
        );

        group.status.below_threshold_since = decision.below_threshold_since;
        group.status.current_nodes = current;
        group.status.ready_nodes = ready.len() as u32;
        group.status.desired_nodes = decision.desired;
        outcome.requeue_after_secs = decision.recheck_after_secs;

        let limit_changed = group.status.set_condition(
            ConditionKind::ScaleLimitReached,
            decision.limit_reached,
            if decision.limit_reached { "MaxNodes" } else { "WithinLimits" },
            &decision.reason,
            now,
        );
        if decision.limit_reached && limit_changed {
            store.emit(Event::new(
                group.object_ref(),
                EventReason::ScaleLimitReached,
                format!(
                    "demand exceeds maxNodes {}: {}",
                    bounds.max_nodes, decision.reason
                ),
                now,
            ));
        }

        match decision.direction {
            Some(ScaleDirection::Up) => {
                self.scale_up(group, &decision, now, &mut outcome).await?;
            }
            Some(ScaleDirection::Down) => {
                self.scale_down(group, &decision, &nodes, &cpu_by_node, protected, bounds.min_nodes, now, &mut outcome)
                    .await?;
            }
            None => {}
        }
        if decision.direction != Some(ScaleDirection::Down) {
            group
                .status
                .set_condition(ConditionKind::ScaleDownBlocked, false, "NotScalingDown", "", now);
        }

        outcome.decision = Some(decision);
        store.update_group(group)?;
        Ok(outcome)
    }

    async fn scale_up(
        &self,
        group: &mut NodeGroup,
        decision: &ScaleDecision,
        now: u64,
        outcome: &mut ScaleOutcome,
    ) -> ScaleResult<()> {
        let store = self.lifecycle.store();
        let backoff = self.lifecycle.config().backoff;

        if let Some(wait) = backoff.wait_remaining(&group.status.provisioning_retry, now) {
            debug!(group = %group.name(), wait, "provisioning backing off");
            outcome.requeue_after_secs = Some(wait);
            return Ok(());
        }

        let wanted = decision.desired - decision.current;
        let selection = self.select_offering(group).await;
        let (offering, allowed) = match selection {
            Ok(Some((offering, quota))) => {
                let allowed = quota.instances_remaining.map_or(wanted, |r| r.min(wanted));
                (offering, allowed)
            }
            Ok(None) => {
                let msg = format!(
                    "none of [{}] available with quota in {}",
                    group.spec.offering_ids.join(", "),
                    group.spec.datacenter_id
                );
                self.provisioning_blocked(group, &msg, now, outcome);
                return Ok(());
            }
            Err(msg) => {
                self.provisioning_blocked(group, &msg, now, outcome);
                return Ok(());
            }
        };

        let prefix = format!("{}-{now:x}", group.name());
        for i in 0..allowed {
            let node_name = format!("{prefix}{i}");
            let mut node = ManagedNode::pending(&node_name, group.name(), &offering.id, NodeOwner::Scaling, now);
            node.resources = offering.resources.clone();
            match store.create_node(&mut node) {
                Ok(()) => outcome.created.push(node_name),
                Err(StateError::AlreadyExists(key)) => {
                    debug!(%key, "node record already exists");
                }
                Err(e) => return Err(e.into()),
            }
        }

        backoff.reset(&mut group.status.provisioning_retry);
        group
            .status
            .set_condition(ConditionKind::ProvisioningBlocked, false, "OfferingAvailable", "", now);
        group.status.last_scale_up_time = now;
        group.status.last_scale_time = now;
        store.emit(Event::new(
            group.object_ref(),
            EventReason::ScalingUp,
            format!(
                "scaling from {} to {} nodes with offering {} ({})",
                decision.current,
                decision.current + outcome.created.len() as u32,
                offering.id,
                decision.reason
            ),
            now,
        ));
        Ok(())
    }

    /// First acceptable offering that is available and has quota left.
    async fn select_offering(&self, group: &NodeGroup) -> Result<Option<(Offering, Quota)>, String> {
        let cloud = self.lifecycle.cloud();
        let dc = &group.spec.datacenter_id;
        let offerings = cloud.list_offerings(dc).await.map_err(|e| e.to_string())?;
        let quota = cloud.quota(dc).await.map_err(|e| e.to_string())?;
        if !quota.allows(1) {
            return Ok(None);
        }
        Ok(group.spec.offering_ids.iter().find_map(|id| {
            offerings
                .iter()
                .find(|o| &o.id == id && o.available)
                .map(|o| (o.clone(), quota.clone()))
        }))
    }

    fn provisioning_blocked(&self, group: &mut NodeGroup, msg: &str, now: u64, outcome: &mut ScaleOutcome) {
        let backoff = self.lifecycle.config().backoff;
        let delay = backoff.record_failure(&mut group.status.provisioning_retry, now);
        group
            .status
            .set_condition(ConditionKind::ProvisioningBlocked, true, "NoOfferingAvailable", msg, now);
        self.lifecycle.store().emit(Event::new(
            group.object_ref(),
            EventReason::ProvisioningFailed,
            format!("{msg}; retrying in {delay}s"),
            now,
        ));
        outcome.requeue_after_secs = Some(delay);
    }

    #[allow(clippy::too_many_arguments)]
    async fn scale_down(
        &self,
        group: &mut NodeGroup,
        decision: &ScaleDecision,
        nodes: &[ManagedNode],
        cpu_by_node: &HashMap<String, f64>,
        protected: &[String],
        min_nodes: u32,
        now: u64,
        outcome: &mut ScaleOutcome,
    ) -> ScaleResult<()> {
        let store = self.lifecycle.store();
        let removing = decision.current - decision.desired;

        let control_plane = match self.lifecycle.cluster().control_plane_health().await {
            Ok(h) => h,
            Err(e) => {
                warn!(group = %group.name(), error = %e, "control-plane health unavailable, skipping scale-down");
                return Ok(());
            }
        };
        let mut signals = SafetySignals::healthy(Vec::new());
        signals.control_plane = control_plane;
        let ctx = SafetyContext {
            group: &*group,
            min_nodes,
            nodes,
            signals: &signals,
            exclude: protected,
            now,
        };
        let verdict = evaluate_scale_down(&ctx, removing);
        if !verdict.passed() {
            let summary = verdict.summary();
            if group
                .status
                .set_condition(ConditionKind::ScaleDownBlocked, true, "SafetyCheckFailed", &summary, now)
            {
                store.emit(Event::new(
                    group.object_ref(),
                    EventReason::SafetyCheckFailed,
                    format!("scale-down blocked: {summary}"),
                    now,
                ));
            }
            return Ok(());
        }
        group
            .status
            .set_condition(ConditionKind::ScaleDownBlocked, false, "Clear", "", now);

        let victims = select_victims(nodes, cpu_by_node, protected, removing as usize);
        if victims.len() < removing as usize {
            warn!(
                group = %group.name(),
                wanted = removing,
                eligible = victims.len(),
                "not enough nodes eligible for scale-down"
            );
        }
        if victims.is_empty() {
            return Ok(());
        }

        for victim in &victims {
            let mut node = (*victim).clone();
            self.lifecycle
                .request_termination(&mut node, "scale down", now)?;
            outcome.terminated.push(node.name.clone());
        }

        group.status.last_scale_down_time = now;
        group.status.last_scale_time = now;
        group.status.below_threshold_since = None;
        store.emit(Event::new(
            group.object_ref(),
            EventReason::ScalingDown,
            format!(
                "scaling from {} to {} nodes, removing {} ({})",
                decision.current,
                decision.current - victims.len() as u32,
                victims
                    .iter()
                    .map(|n| n.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                decision.reason
            ),
            now,
        ));
        Ok(())
    }
}

/// Choose up to `count` live nodes to remove: never-ready nodes first, then
/// lowest CPU, then newest, then by name. `do-not-delete` and `protected`
/// nodes are never chosen.
pub fn select_victims<'a>(
    nodes: &'a [ManagedNode],
    cpu_by_node: &HashMap<String, f64>,
    protected: &[String],
    count: usize,
) -> Vec<&'a ManagedNode> {
    let mut eligible: Vec<&ManagedNode> = nodes
        .iter()
        .filter(|n| n.phase.is_live())
        .filter(|n| !n.is_do_not_delete())
        .filter(|n| !protected.contains(&n.name))
        .collect();

    let cpu = |n: &ManagedNode| cpu_by_node.get(n.kube_name()).copied().unwrap_or(0.0);
    eligible.sort_by(|a, b| {
        let a_ready = a.phase == NodePhase::Ready;
        let b_ready = b.phase == NodePhase::Ready;
        a_ready
            .cmp(&b_ready)
            .then_with(|| cpu(*a).partial_cmp(&cpu(*b)).unwrap_or(Ordering::Equal))
            .then_with(|| b.timestamps.created_at.cmp(&a.timestamps.created_at))
            .then_with(|| a.name.cmp(&b.name))
    });
    eligible.truncate(count);
    eligible
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_lifecycle::LifecycleConfig;
    use fleet_provider::sim::{SimCloud, SimCluster};
    use fleet_state::{
        ANNOTATION_DO_NOT_DELETE, ANNOTATION_MAX_OVERRIDE, ANNOTATION_PAUSED, NodeGroupSpec,
        RebalancePolicy, ScaleDownPolicy, ScaleUpPolicy, StateStore,
    };

    struct Fixture {
        cloud: Arc<SimCloud>,
        cluster: Arc<SimCluster>,
        store: StateStore,
        autoscaler: Autoscaler,
    }

    fn fixture() -> Fixture {
        let cloud = Arc::new(SimCloud::new("dc-1", &["small", "medium"]));
        let cluster = Arc::new(SimCluster::new());
        let store = StateStore::open_in_memory().unwrap();
        let lifecycle = Arc::new(NodeLifecycle::new(
            cloud.clone(),
            cluster.clone(),
            store.clone(),
            LifecycleConfig::default(),
        ));
        Fixture {
            cloud,
            cluster,
            store,
            autoscaler: Autoscaler::new(lifecycle),
        }
    }

    fn group(f: &Fixture, min: u32, max: u32) -> NodeGroup {
        let spec = NodeGroupSpec {
            name: "web".into(),
            datacenter_id: "dc-1".into(),
            image_id: "img".into(),
            offering_ids: vec!["small".into(), "medium".into()],
            min_nodes: min,
            max_nodes: max,
            scale_up: ScaleUpPolicy::default(),
            scale_down: ScaleDownPolicy::default(),
            rebalancing: RebalancePolicy::default(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
        };
        let mut g = NodeGroup::new(spec, 0);
        f.store.create_group(&mut g).unwrap();
        g
    }

    fn ready_node(f: &Fixture, name: &str, created_at: u64) -> ManagedNode {
        let mut n = ManagedNode::pending(name, "web", "small", NodeOwner::Scaling, created_at);
        n.phase = NodePhase::Ready;
        n.kube_node_name = Some(name.to_string());
        f.store.create_node(&mut n).unwrap();
        f.cluster.add_ready_node(name);
        n
    }

    fn events(f: &Fixture) -> Vec<EventReason> {
        f.store
            .list_events("nodegroup/web", 100)
            .unwrap()
            .into_iter()
            .map(|e| e.reason)
            .collect()
    }

    #[tokio::test]
    async fn empty_group_scales_to_min() {
        let f = fixture();
        let mut g = group(&f, 3, 10);

        let out = f.autoscaler.reconcile_group(&mut g, &[], 1000).await.unwrap();
        assert_eq!(out.created.len(), 3);
        assert_eq!(g.status.desired_nodes, 3);
        assert_eq!(g.status.last_scale_up_time, 1000);

        let nodes = f.store.list_nodes("web").unwrap();
        assert_eq!(nodes.len(), 3);
        assert!(nodes.iter().all(|n| n.phase == NodePhase::Pending && n.offering_id == "small"));
        assert_eq!(events(&f), vec![EventReason::ScalingUp]);

        let stored = f.store.get_group("web").unwrap().unwrap();
        assert_eq!(stored.status.desired_nodes, 3);
    }

    #[tokio::test]
    async fn high_utilization_adds_increment() {
        let f = fixture();
        let mut g = group(&f, 1, 10);
        ready_node(&f, "web-a", 10);
        ready_node(&f, "web-b", 20);
        f.cluster.set_default_utilization(90.0, 40.0);

        let out = f.autoscaler.reconcile_group(&mut g, &[], 1000).await.unwrap();
        assert_eq!(out.created.len(), 1);

        // Within the stabilization window: no second scale-up.
        let out = f.autoscaler.reconcile_group(&mut g, &[], 1030).await.unwrap();
        assert!(out.created.is_empty());
        assert_eq!(f.store.list_nodes("web").unwrap().len(), 3);
    }

    #[tokio::test]
    async fn falls_back_to_next_offering() {
        let f = fixture();
        f.cloud.set_offering_available("small", false);
        let mut g = group(&f, 1, 10);

        f.autoscaler.reconcile_group(&mut g, &[], 1000).await.unwrap();
        let nodes = f.store.list_nodes("web").unwrap();
        assert_eq!(nodes[0].offering_id, "medium");
    }

    #[tokio::test]
    async fn blocked_provisioning_backs_off() {
        let f = fixture();
        f.cloud.set_quota(Some(0));
        let mut g = group(&f, 2, 10);

        let out = f.autoscaler.reconcile_group(&mut g, &[], 1000).await.unwrap();
        assert!(out.created.is_empty());
        assert_eq!(out.requeue_after_secs, Some(5));
        assert!(g.status.has_condition(ConditionKind::ProvisioningBlocked));
        assert_eq!(events(&f), vec![EventReason::ProvisioningFailed]);

        // Inside the backoff nothing is retried.
        let out = f.autoscaler.reconcile_group(&mut g, &[], 1002).await.unwrap();
        assert_eq!(out.requeue_after_secs, Some(3));
        assert_eq!(events(&f).len(), 1);

        f.cloud.set_quota(None);
        let out = f.autoscaler.reconcile_group(&mut g, &[], 1005).await.unwrap();
        assert_eq!(out.created.len(), 2);
        assert!(!g.status.has_condition(ConditionKind::ProvisioningBlocked));
    }

    #[tokio::test]
    async fn scale_down_picks_idle_unprotected_node() {
        let f = fixture();
        let mut g = group(&f, 1, 10);
        ready_node(&f, "web-a", 10);
        ready_node(&f, "web-b", 20);
        ready_node(&f, "web-c", 30);
        f.cluster.set_default_utilization(10.0, 10.0);
        f.cluster.set_node_utilization("web-a", 1.0, 10.0);
        f.cluster.set_node_utilization("web-b", 2.0, 10.0);

        let out = f.autoscaler.reconcile_group(&mut g, &[], 1000).await.unwrap();
        assert!(out.terminated.is_empty());
        assert_eq!(g.status.below_threshold_since, Some(1000));

        let protected = vec!["web-a".to_string()];
        let out = f
            .autoscaler
            .reconcile_group(&mut g, &protected, 1600)
            .await
            .unwrap();
        assert_eq!(out.terminated, vec!["web-b".to_string()]);
        let b = f.store.get_node("web", "web-b").unwrap().unwrap();
        assert_eq!(b.phase, NodePhase::Terminating);
        assert!(events(&f).contains(&EventReason::ScalingDown));
    }

    #[tokio::test]
    async fn max_override_forces_scale_down() {
        let f = fixture();
        let mut g = group(&f, 1, 10);
        g.spec
            .annotations
            .insert(ANNOTATION_MAX_OVERRIDE.into(), "2".into());
        ready_node(&f, "web-a", 10);
        ready_node(&f, "web-b", 20);
        let mut c = ready_node(&f, "web-c", 30);
        c.annotations.insert(ANNOTATION_DO_NOT_DELETE.into(), "true".into());
        f.store.update_node(&mut c).unwrap();

        let out = f.autoscaler.reconcile_group(&mut g, &[], 1000).await.unwrap();
        // Newest non-protected node goes first at equal CPU.
        assert_eq!(out.terminated, vec!["web-b".to_string()]);
        assert_eq!(g.spec.max_nodes, 10);
    }

    #[tokio::test]
    async fn blocked_scale_down_is_reported_once() {
        let f = fixture();
        let mut g = group(&f, 1, 10);
        g.spec
            .annotations
            .insert(ANNOTATION_MAX_OVERRIDE.into(), "2".into());
        ready_node(&f, "web-a", 10);
        ready_node(&f, "web-b", 20);
        ready_node(&f, "web-c", 30);
        f.cluster.set_control_plane_healthy(false);

        for now in [1000, 1010, 1020] {
            let out = f.autoscaler.reconcile_group(&mut g, &[], now).await.unwrap();
            assert!(out.terminated.is_empty());
        }
        let blocked = events(&f)
            .into_iter()
            .filter(|r| *r == EventReason::SafetyCheckFailed)
            .count();
        assert_eq!(blocked, 1);
        assert!(g.status.has_condition(ConditionKind::ScaleDownBlocked));

        f.cluster.set_control_plane_healthy(true);
        let out = f.autoscaler.reconcile_group(&mut g, &[], 1030).await.unwrap();
        assert_eq!(out.terminated.len(), 1);
        assert!(!g.status.has_condition(ConditionKind::ScaleDownBlocked));
    }

    #[tokio::test]
    async fn invalid_override_is_reported_once() {
        let f = fixture();
        let mut g = group(&f, 1, 10);
        ready_node(&f, "web-a", 10);
        g.spec
            .annotations
            .insert(ANNOTATION_MAX_OVERRIDE.into(), "many".into());

        f.autoscaler.reconcile_group(&mut g, &[], 1000).await.unwrap();
        f.autoscaler.reconcile_group(&mut g, &[], 1010).await.unwrap();
        let invalid = events(&f)
            .into_iter()
            .filter(|r| *r == EventReason::InvalidConfiguration)
            .count();
        assert_eq!(invalid, 1);
        assert!(g.status.has_condition(ConditionKind::InvalidConfiguration));
    }

    #[tokio::test]
    async fn paused_group_is_left_alone() {
        let f = fixture();
        let mut g = group(&f, 3, 10);
        g.spec.annotations.insert(ANNOTATION_PAUSED.into(), "true".into());

        let out = f.autoscaler.reconcile_group(&mut g, &[], 1000).await.unwrap();
        assert!(out.created.is_empty());
        assert!(g.status.has_condition(ConditionKind::Paused));
        assert!(f.store.list_nodes("web").unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_node_torn_down_only_with_enough_capacity() {
        let f = fixture();
        let mut g = group(&f, 2, 10);
        ready_node(&f, "web-a", 10);
        let mut broken = ready_node(&f, "web-b", 20);
        broken.phase = NodePhase::Failed;
        f.store.update_node(&mut broken).unwrap();

        // One live node, min 2: the failed node stays, a replacement is created.
        let out = f.autoscaler.reconcile_group(&mut g, &[], 1000).await.unwrap();
        assert!(out.terminated.is_empty());
        assert_eq!(out.created.len(), 1);

        // With the replacement counted, the failed node is torn down.
        let out = f.autoscaler.reconcile_group(&mut g, &[], 1100).await.unwrap();
        assert_eq!(out.terminated, vec!["web-b".to_string()]);
    }

    #[test]
    fn victim_order() {
        let mk = |name: &str, phase: NodePhase, created: u64| {
            let mut n = ManagedNode::pending(name, "web", "small", NodeOwner::Scaling, created);
            n.phase = phase;
            n
        };
        let nodes = vec![
            mk("a", NodePhase::Ready, 10),
            mk("b", NodePhase::Ready, 20),
            mk("c", NodePhase::Joining, 5),
            mk("d", NodePhase::Ready, 20),
            mk("e", NodePhase::Terminating, 1),
        ];
        let cpu: HashMap<String, f64> = [("a".to_string(), 5.0), ("b".to_string(), 50.0), ("d".to_string(), 50.0)]
            .into_iter()
            .collect();
        let order: Vec<&str> = select_victims(&nodes, &cpu, &[], 10)
            .into_iter()
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(order, vec!["c", "a", "b", "d"]);
    }
}
