//! The per-node state machine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_provider::{
    CloudProvider, ClusterClient, DrainOptions, DrainStatus, InstanceSpec, InstanceState,
    NodeCondition, ProviderError,
};
use fleet_state::{Event, EventReason, ManagedNode, NodeGroupSpec, NodePhase, StateStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::error::{LifecycleError, LifecycleResult};

/// Instance label carrying the owning group's name.
pub const GROUP_LABEL: &str = "fleet.io/group";

/// Upper bound on phase transitions taken in one reconcile call.
const MAX_STEPS_PER_PASS: usize = 8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LifecycleConfig {
    /// From the create request until the instance is running.
    pub provision_timeout_secs: u64,
    /// From the join request until the node reports Ready.
    pub join_timeout_secs: u64,
    /// Requeue delay while waiting on the remote side.
    pub poll_interval_secs: u64,
    pub backoff: Backoff,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            provision_timeout_secs: 600,
            join_timeout_secs: 600,
            poll_interval_secs: 10,
            backoff: Backoff::default(),
        }
    }
}

/// Result of reconciling one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeProgress {
    /// Waiting on the provider, the cluster, or a backoff.
    Waiting { requeue_after_secs: u64 },
    /// Ready or Failed; nothing to do until an engine acts on it.
    Settled,
    /// Instance and node record are gone.
    Removed,
}

impl NodeProgress {
    pub fn requeue_after(self) -> Option<u64> {
        match self {
            NodeProgress::Waiting { requeue_after_secs } => Some(requeue_after_secs),
            _ => None,
        }
    }
}

enum Step {
    Advanced,
    Done(NodeProgress),
}

/// Drives managed nodes through their lifecycle.
pub struct NodeLifecycle {
    cloud: Arc<dyn CloudProvider>,
    cluster: Arc<dyn ClusterClient>,
    store: StateStore,
    config: LifecycleConfig,
}

impl NodeLifecycle {
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        cluster: Arc<dyn ClusterClient>,
        store: StateStore,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            cloud,
            cluster,
            store,
            config,
        }
    }

    pub fn cloud(&self) -> &dyn CloudProvider {
        self.cloud.as_ref()
    }

    pub fn cluster(&self) -> &dyn ClusterClient {
        self.cluster.as_ref()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Reconcile every node of a group. Per-node errors are logged and turn
    /// into a requeue; returns the smallest requested delay.
    pub async fn reconcile_group(&self, spec: &NodeGroupSpec, now: u64) -> LifecycleResult<Option<u64>> {
        let mut requeue: Option<u64> = None;
        let mut merge = |secs: u64| requeue = Some(requeue.map_or(secs, |r| r.min(secs)));

        for mut node in self.store.list_nodes(&spec.name)? {
            match self.reconcile_node(spec, &mut node, now).await {
                Ok(progress) => {
                    if let Some(secs) = progress.requeue_after() {
                        merge(secs);
                    }
                }
                Err(e) if e.is_conflict() => {
                    debug!(node = %node.name, "node changed concurrently, requeueing");
                    merge(1);
                }
                Err(e) => {
                    warn!(node = %node.name, error = %e, "node reconcile failed");
                    merge(self.config.poll_interval_secs);
                }
            }
        }
        Ok(requeue)
    }

    /// Advance one node as far as it can go without waiting.
    pub async fn reconcile_node(
        &self,
        spec: &NodeGroupSpec,
        node: &mut ManagedNode,
        now: u64,
    ) -> LifecycleResult<NodeProgress> {
        for _ in 0..MAX_STEPS_PER_PASS {
            if let Some(wait) = self.config.backoff.wait_remaining(&node.retry, now) {
                return Ok(NodeProgress::Waiting {
                    requeue_after_secs: wait,
                });
            }
            let step = match node.phase {
                NodePhase::Pending => self.step_pending(spec, node, now).await?,
                NodePhase::Provisioning => self.step_provisioning(node, now).await?,
                NodePhase::Provisioned => self.step_provisioned(node, now).await?,
                NodePhase::Joining => self.step_joining(node, now).await?,
                NodePhase::Ready | NodePhase::Failed => Step::Done(NodeProgress::Settled),
                NodePhase::Terminating => self.step_terminating(spec, node, now).await?,
                NodePhase::Deleting => self.step_deleting(node, now).await?,
            };
            if let Step::Done(progress) = step {
                return Ok(progress);
            }
        }
        Ok(self.wait())
    }

    /// Move a node to `Terminating`. A node that never joined, or that the
    /// caller already drained, skips the drain.
    pub fn request_termination(&self, node: &mut ManagedNode, reason: &str, now: u64) -> LifecycleResult<()> {
        if matches!(node.phase, NodePhase::Terminating | NodePhase::Deleting) {
            return Ok(());
        }
        let was_ready = node.phase == NodePhase::Ready;
        self.advance(node, NodePhase::Terminating)?;
        node.timestamps.terminating_at = Some(now);
        self.config.backoff.reset(&mut node.retry);
        if node.kube_node_name.is_none() && !was_ready {
            node.drained = true;
        }
        self.store.update_node(node)?;
        self.store.emit(Event::new(
            node.object_ref(),
            EventReason::Terminating,
            format!("terminating node: {reason}"),
            now,
        ));
        Ok(())
    }

    /// The explicit rollback transition `Terminating → Ready`, allowed only
    /// before the node has been drained.
    pub async fn rollback_termination(&self, node: &mut ManagedNode, now: u64) -> LifecycleResult<()> {
        if node.phase != NodePhase::Terminating || node.drained {
            return Err(LifecycleError::InvalidTransition {
                node: node.name.clone(),
                from: node.phase,
                to: NodePhase::Ready,
            });
        }
        if node.cordoned {
            self.cluster.uncordon_node(node.kube_name()).await?;
        }
        node.phase = NodePhase::Ready;
        node.cordoned = false;
        node.timestamps.terminating_at = None;
        self.config.backoff.reset(&mut node.retry);
        self.store.update_node(node)?;
        info!(node = %node.name, at = now, "termination rolled back");
        Ok(())
    }

    // ── Phase steps ────────────────────────────────────────────────

    async fn step_pending(&self, spec: &NodeGroupSpec, node: &mut ManagedNode, now: u64) -> LifecycleResult<Step> {
        if self.provision_expired(node, now) {
            let msg = format!(
                "instance not running within {}s",
                self.config.provision_timeout_secs
            );
            return self.fail(node, EventReason::ProvisioningFailed, msg, now);
        }
        if node.instance_id.is_some() {
            self.advance(node, NodePhase::Provisioning)?;
            self.store.update_node(node)?;
            return Ok(Step::Advanced);
        }

        // Persisted before the call so a restart re-issues the same token.
        if node.timestamps.create_requested_at.is_none() {
            node.timestamps.create_requested_at = Some(now);
            self.store.update_node(node)?;
        }

        let mut labels: HashMap<String, String> = spec.labels.clone();
        labels.insert(GROUP_LABEL.to_string(), spec.name.clone());
        let request = InstanceSpec {
            name: node.name.clone(),
            datacenter_id: spec.datacenter_id.clone(),
            image_id: spec.image_id.clone(),
            offering_id: node.offering_id.clone(),
            labels,
        };

        match self.cloud.create_instance(&request).await {
            Ok(handle) => {
                self.advance(node, NodePhase::Provisioning)?;
                node.instance_id = Some(handle.instance_id.clone());
                node.last_error = None;
                self.config.backoff.reset(&mut node.retry);
                self.store.update_node(node)?;
                self.store.emit(Event::new(
                    node.object_ref(),
                    EventReason::VpsCreated,
                    format!(
                        "instance {} requested with offering {}",
                        handle.instance_id, node.offering_id
                    ),
                    now,
                ));
                Ok(Step::Advanced)
            }
            Err(e) => self.provider_failure(node, e, EventReason::ProvisioningFailed, now),
        }
    }

    async fn step_provisioning(&self, node: &mut ManagedNode, now: u64) -> LifecycleResult<Step> {
        let Some(instance_id) = node.instance_id.clone() else {
            return self.fail(
                node,
                EventReason::ProvisioningFailed,
                "provisioning without an instance id".to_string(),
                now,
            );
        };

        match self.cloud.instance_status(&instance_id).await {
            Ok(InstanceState::Running) => {
                self.advance(node, NodePhase::Provisioned)?;
                node.timestamps.provisioned_at = Some(now);
                node.last_error = None;
                self.config.backoff.reset(&mut node.retry);
                self.store.update_node(node)?;
                self.store.emit(Event::new(
                    node.object_ref(),
                    EventReason::VpsReady,
                    format!("instance {instance_id} is running"),
                    now,
                ));
                Ok(Step::Advanced)
            }
            Ok(InstanceState::Creating) => {
                if self.provision_expired(node, now) {
                    let msg = format!(
                        "instance {instance_id} not running within {}s",
                        self.config.provision_timeout_secs
                    );
                    return self.fail(node, EventReason::ProvisioningFailed, msg, now);
                }
                Ok(Step::Done(self.wait()))
            }
            Ok(InstanceState::Error(msg)) => self.fail(
                node,
                EventReason::ProvisioningFailed,
                format!("instance {instance_id} failed: {msg}"),
                now,
            ),
            Ok(InstanceState::NotFound) => self.fail(
                node,
                EventReason::ProvisioningFailed,
                format!("instance {instance_id} disappeared"),
                now,
            ),
            Ok(state) => self.fail(
                node,
                EventReason::ProvisioningFailed,
                format!("instance {instance_id} unexpectedly {state:?}"),
                now,
            ),
            Err(e) => self.provider_failure(node, e, EventReason::ProvisioningFailed, now),
        }
    }

    async fn step_provisioned(&self, node: &mut ManagedNode, now: u64) -> LifecycleResult<Step> {
        let Some(instance_id) = node.instance_id.clone() else {
            return self.fail(
                node,
                EventReason::JoinFailed,
                "provisioned without an instance id".to_string(),
                now,
            );
        };

        match self.cluster.join_cluster(&instance_id, &node.name).await {
            Ok(kube_name) => {
                self.advance(node, NodePhase::Joining)?;
                node.kube_node_name = Some(kube_name.clone());
                node.timestamps.join_started_at = Some(now);
                self.config.backoff.reset(&mut node.retry);
                self.store.update_node(node)?;
                self.store.emit(Event::new(
                    node.object_ref(),
                    EventReason::NodeJoined,
                    format!("join issued, registering as {kube_name}"),
                    now,
                ));
                Ok(Step::Advanced)
            }
            Err(e) => self.provider_failure(node, e, EventReason::JoinFailed, now),
        }
    }

    async fn step_joining(&self, node: &mut ManagedNode, now: u64) -> LifecycleResult<Step> {
        let condition = match self.cluster.node_condition(node.kube_name()).await {
            Ok(c) => c,
            Err(e) => return self.provider_failure(node, e, EventReason::JoinFailed, now),
        };

        if condition == NodeCondition::Ready {
            self.advance(node, NodePhase::Ready)?;
            node.timestamps.joined_at.get_or_insert(now);
            node.timestamps.ready_at = Some(now);
            node.last_error = None;
            self.store.update_node(node)?;
            self.store.emit(Event::new(
                node.object_ref(),
                EventReason::NodeReady,
                format!("node {} is Ready", node.kube_name()),
                now,
            ));
            return Ok(Step::Done(NodeProgress::Settled));
        }

        let started = node.timestamps.join_started_at.unwrap_or(now);
        if now >= started + self.config.join_timeout_secs {
            let msg = format!(
                "node not Ready within {}s of join ({condition:?})",
                self.config.join_timeout_secs
            );
            return self.fail(node, EventReason::JoinFailed, msg, now);
        }

        if condition == NodeCondition::NotReady && node.timestamps.joined_at.is_none() {
            node.timestamps.joined_at = Some(now);
            self.store.update_node(node)?;
        }
        Ok(Step::Done(self.wait()))
    }

    async fn step_terminating(
        &self,
        spec: &NodeGroupSpec,
        node: &mut ManagedNode,
        now: u64,
    ) -> LifecycleResult<Step> {
        if !node.drained {
            let policy = &spec.rebalancing;
            let kube_name = node.kube_name().to_string();

            if !node.cordoned {
                if let Err(e) = self.cluster.cordon_node(&kube_name).await {
                    return self.provider_failure(node, e, EventReason::DrainFailed, now);
                }
                node.cordoned = true;
                self.store.update_node(node)?;
            }

            let started = node.timestamps.terminating_at.unwrap_or(now);
            let expired = now >= started + policy.drain_timeout_secs;
            // A node that already failed is torn down regardless of budgets.
            let was_failed = node.timestamps.failed_at.is_some();
            let force = was_failed || (expired && policy.force_drain);
            if expired && !force {
                let msg = format!("drain did not complete within {}s", policy.drain_timeout_secs);
                return self.fail(node, EventReason::DrainFailed, msg, now);
            }

            let options = DrainOptions {
                respect_pdbs: policy.respect_pdbs,
                force,
                timeout: Duration::from_secs(policy.drain_timeout_secs),
            };
            match self.cluster.drain_node(&kube_name, options).await {
                Ok(DrainStatus::Complete) => {}
                Ok(_) if was_failed => {}
                Ok(DrainStatus::InProgress { remaining_pods }) => {
                    debug!(node = %node.name, remaining_pods, "drain in progress");
                    return Ok(Step::Done(self.wait()));
                }
                Ok(DrainStatus::Blocked { reason }) => {
                    debug!(node = %node.name, %reason, "drain blocked");
                    return Ok(Step::Done(self.wait()));
                }
                Err(e) => return self.provider_failure(node, e, EventReason::DrainFailed, now),
            }
            node.drained = true;
        }

        self.advance(node, NodePhase::Deleting)?;
        self.store.update_node(node)?;
        Ok(Step::Advanced)
    }

    async fn step_deleting(&self, node: &mut ManagedNode, now: u64) -> LifecycleResult<Step> {
        if let Some(instance_id) = node.instance_id.clone() {
            let mut status = match self.cloud.instance_status(&instance_id).await {
                Ok(s) => s,
                Err(e) => return self.provider_failure(node, e, EventReason::DeletionFailed, now),
            };
            if !matches!(status, InstanceState::NotFound | InstanceState::Deleting) {
                if let Err(e) = self.cloud.delete_instance(&instance_id).await {
                    return self.provider_failure(node, e, EventReason::DeletionFailed, now);
                }
                status = match self.cloud.instance_status(&instance_id).await {
                    Ok(s) => s,
                    Err(e) => return self.provider_failure(node, e, EventReason::DeletionFailed, now),
                };
            }
            if status != InstanceState::NotFound {
                return Ok(Step::Done(self.wait()));
            }
        }

        if let Some(kube_name) = node.kube_node_name.clone() {
            if let Err(e) = self.cluster.delete_node_object(&kube_name).await {
                return self.provider_failure(node, e, EventReason::DeletionFailed, now);
            }
        }

        self.store.delete_node(&node.group, &node.name)?;
        self.store.emit(Event::new(
            node.object_ref(),
            EventReason::NodeDeleted,
            format!("instance and node object removed from group {}", node.group),
            now,
        ));
        Ok(Step::Done(NodeProgress::Removed))
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn wait(&self) -> NodeProgress {
        NodeProgress::Waiting {
            requeue_after_secs: self.config.poll_interval_secs,
        }
    }

    fn provision_expired(&self, node: &ManagedNode, now: u64) -> bool {
        let since = node
            .timestamps
            .create_requested_at
            .unwrap_or(node.timestamps.created_at);
        now >= since + self.config.provision_timeout_secs
    }

    fn advance(&self, node: &mut ManagedNode, next: NodePhase) -> LifecycleResult<()> {
        if !node.phase.can_transition_to(next) {
            return Err(LifecycleError::InvalidTransition {
                node: node.name.clone(),
                from: node.phase,
                to: next,
            });
        }
        info!(node = %node.name, group = %node.group, from = %node.phase, to = %next, "node phase transition");
        node.phase = next;
        Ok(())
    }

    /// Retryable errors keep the phase and back off; anything else fails
    /// the node.
    fn provider_failure(
        &self,
        node: &mut ManagedNode,
        error: ProviderError,
        reason: EventReason,
        now: u64,
    ) -> LifecycleResult<Step> {
        let terminating = matches!(node.phase, NodePhase::Terminating | NodePhase::Deleting);
        if !error.is_retryable() && !terminating {
            return self.fail(node, reason, error.to_string(), now);
        }

        let delay = self.config.backoff.record_failure(&mut node.retry, now);
        node.last_error = Some(error.to_string());
        self.store.update_node(node)?;
        warn!(
            node = %node.name,
            phase = %node.phase,
            attempts = node.retry.attempts,
            retry_in_secs = delay,
            error = %error,
            "provider call failed, backing off"
        );
        if self.config.backoff.crossed_warning(&node.retry) {
            self.store.emit(Event::new(
                node.object_ref(),
                reason,
                format!(
                    "{} consecutive failures in phase {}: {error}",
                    node.retry.attempts, node.phase
                ),
                now,
            ));
        }
        Ok(Step::Done(NodeProgress::Waiting {
            requeue_after_secs: delay,
        }))
    }

    fn fail(&self, node: &mut ManagedNode, reason: EventReason, message: String, now: u64) -> LifecycleResult<Step> {
        self.advance(node, NodePhase::Failed)?;
        node.timestamps.failed_at = Some(now);
        node.last_error = Some(message.clone());
        self.config.backoff.reset(&mut node.retry);
        self.store.update_node(node)?;
        self.store
            .emit(Event::new(node.object_ref(), reason, message, now));
        Ok(Step::Done(NodeProgress::Settled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_provider::sim::{SimCloud, SimCluster};
    use fleet_state::{NodeOwner, RebalancePolicy, ScaleDownPolicy, ScaleUpPolicy};

    struct Fixture {
        cloud: Arc<SimCloud>,
        cluster: Arc<SimCluster>,
        store: StateStore,
        lifecycle: NodeLifecycle,
        spec: NodeGroupSpec,
    }

    fn fixture() -> Fixture {
        let cloud = Arc::new(SimCloud::new("dc-1", &["small", "large"]));
        let cluster = Arc::new(SimCluster::new());
        let store = StateStore::open_in_memory().unwrap();
        let lifecycle = NodeLifecycle::new(
            cloud.clone(),
            cluster.clone(),
            store.clone(),
            LifecycleConfig::default(),
        );
        let spec = NodeGroupSpec {
            name: "web".into(),
            datacenter_id: "dc-1".into(),
            image_id: "img".into(),
            offering_ids: vec!["small".into()],
            min_nodes: 1,
            max_nodes: 5,
            scale_up: ScaleUpPolicy::default(),
            scale_down: ScaleDownPolicy::default(),
            rebalancing: RebalancePolicy::default(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
        };
        Fixture {
            cloud,
            cluster,
            store,
            lifecycle,
            spec,
        }
    }

    fn new_node(f: &Fixture, name: &str, now: u64) -> ManagedNode {
        let mut node = ManagedNode::pending(name, "web", "small", NodeOwner::Scaling, now);
        f.store.create_node(&mut node).unwrap();
        node
    }

    fn reasons(f: &Fixture, node: &ManagedNode) -> Vec<EventReason> {
        f.store
            .list_events(&node.object_ref(), 100)
            .unwrap()
            .into_iter()
            .map(|e| e.reason)
            .collect()
    }

    #[tokio::test]
    async fn pending_node_reaches_ready() {
        let f = fixture();
        let mut node = new_node(&f, "web-a", 1000);

        let progress = f.lifecycle.reconcile_node(&f.spec, &mut node, 1000).await.unwrap();
        assert_eq!(progress, NodeProgress::Settled);
        assert_eq!(node.phase, NodePhase::Ready);
        assert_eq!(node.kube_node_name.as_deref(), Some("web-a"));
        assert_eq!(node.timestamps.ready_at, Some(1000));

        let stored = f.store.get_node("web", "web-a").unwrap().unwrap();
        assert_eq!(stored.phase, NodePhase::Ready);
        assert_eq!(
            reasons(&f, &node),
            vec![
                EventReason::VpsCreated,
                EventReason::VpsReady,
                EventReason::NodeJoined,
                EventReason::NodeReady
            ]
        );

        let instance = node.instance_id.clone().unwrap();
        let labels = f.cloud.instance_spec(&instance).unwrap().labels;
        assert_eq!(labels.get(GROUP_LABEL).map(String::as_str), Some("web"));
    }

    #[tokio::test]
    async fn waits_while_instance_boots() {
        let f = fixture();
        f.cloud.set_boot_polls(2);
        let mut node = new_node(&f, "web-a", 1000);

        let progress = f.lifecycle.reconcile_node(&f.spec, &mut node, 1000).await.unwrap();
        assert_eq!(progress, NodeProgress::Waiting { requeue_after_secs: 10 });
        assert_eq!(node.phase, NodePhase::Provisioning);
        assert_eq!(node.timestamps.create_requested_at, Some(1000));
    }

    #[tokio::test]
    async fn reissued_create_reuses_instance() {
        let f = fixture();
        let mut node = new_node(&f, "web-a", 1000);
        // A previous run got as far as the provider call before crashing.
        node.timestamps.create_requested_at = Some(1000);
        f.store.update_node(&mut node).unwrap();
        let spec = InstanceSpec {
            name: "web-a".into(),
            datacenter_id: "dc-1".into(),
            image_id: "img".into(),
            offering_id: "small".into(),
            labels: HashMap::new(),
        };
        let first = f.cloud.create_instance(&spec).await.unwrap();

        f.lifecycle.reconcile_node(&f.spec, &mut node, 1010).await.unwrap();
        assert_eq!(node.instance_id, Some(first.instance_id));
        assert_eq!(f.cloud.created_count(), 1);
    }

    #[tokio::test]
    async fn retryable_errors_back_off_then_warn() {
        let f = fixture();
        f.cloud
            .fail_creates("small", ProviderError::Transient("503".into()));
        let mut node = new_node(&f, "web-a", 1000);

        let progress = f.lifecycle.reconcile_node(&f.spec, &mut node, 1000).await.unwrap();
        assert_eq!(progress, NodeProgress::Waiting { requeue_after_secs: 5 });
        assert_eq!(node.phase, NodePhase::Pending);
        assert!(node.last_error.as_deref().unwrap().contains("503"));

        // Still inside the backoff: no provider call.
        let calls = f.cloud.calls().len();
        let progress = f.lifecycle.reconcile_node(&f.spec, &mut node, 1002).await.unwrap();
        assert_eq!(progress, NodeProgress::Waiting { requeue_after_secs: 3 });
        assert_eq!(f.cloud.calls().len(), calls);

        let mut now = 1000;
        while node.retry.attempts < 5 {
            now = node.retry.next_attempt_at;
            f.lifecycle.reconcile_node(&f.spec, &mut node, now).await.unwrap();
        }
        assert!(now < 1000 + 600);
        assert_eq!(node.phase, NodePhase::Pending);
        assert_eq!(reasons(&f, &node), vec![EventReason::ProvisioningFailed]);

        f.cloud.clear_create_failures();
        now = node.retry.next_attempt_at;
        f.lifecycle.reconcile_node(&f.spec, &mut node, now).await.unwrap();
        assert_eq!(node.phase, NodePhase::Ready);
        assert_eq!(node.retry.attempts, 0);
    }

    #[tokio::test]
    async fn non_retryable_error_fails_node() {
        let f = fixture();
        f.cloud
            .fail_creates("small", ProviderError::Rejected("bad image".into()));
        let mut node = new_node(&f, "web-a", 1000);

        let progress = f.lifecycle.reconcile_node(&f.spec, &mut node, 1000).await.unwrap();
        assert_eq!(progress, NodeProgress::Settled);
        assert_eq!(node.phase, NodePhase::Failed);
        assert_eq!(node.timestamps.failed_at, Some(1000));
        assert_eq!(reasons(&f, &node), vec![EventReason::ProvisioningFailed]);
    }

    #[tokio::test]
    async fn join_timeout_fails_node() {
        let f = fixture();
        f.cluster.set_never_ready("web-a");
        let mut node = new_node(&f, "web-a", 1000);

        f.lifecycle.reconcile_node(&f.spec, &mut node, 1000).await.unwrap();
        assert_eq!(node.phase, NodePhase::Joining);
        assert_eq!(node.timestamps.joined_at, Some(1000));

        f.lifecycle.reconcile_node(&f.spec, &mut node, 1300).await.unwrap();
        assert_eq!(node.phase, NodePhase::Joining);

        f.lifecycle.reconcile_node(&f.spec, &mut node, 1601).await.unwrap();
        assert_eq!(node.phase, NodePhase::Failed);
        assert!(reasons(&f, &node).contains(&EventReason::JoinFailed));
    }

    #[tokio::test]
    async fn termination_drains_and_removes() {
        let f = fixture();
        let mut node = new_node(&f, "web-a", 1000);
        f.lifecycle.reconcile_node(&f.spec, &mut node, 1000).await.unwrap();

        f.lifecycle
            .request_termination(&mut node, "scale down", 2000)
            .unwrap();
        assert_eq!(node.phase, NodePhase::Terminating);

        let progress = f.lifecycle.reconcile_node(&f.spec, &mut node, 2000).await.unwrap();
        assert_eq!(progress, NodeProgress::Removed);
        assert!(f.store.get_node("web", "web-a").unwrap().is_none());
        assert_eq!(f.cloud.instance_count(), 0);
        assert!(!f.cluster.has_node("web-a"));
        assert_eq!(f.cluster.count_calls("cordon:web-a"), 1);
        assert_eq!(f.cluster.count_calls("drain:web-a"), 1);
        assert!(reasons(&f, &node).contains(&EventReason::NodeDeleted));
    }

    #[tokio::test]
    async fn drained_node_skips_drain() {
        let f = fixture();
        let mut node = new_node(&f, "web-a", 1000);
        f.lifecycle.reconcile_node(&f.spec, &mut node, 1000).await.unwrap();
        node.drained = true;

        f.lifecycle.request_termination(&mut node, "replaced", 2000).unwrap();
        f.lifecycle.reconcile_node(&f.spec, &mut node, 2000).await.unwrap();
        assert_eq!(f.cluster.count_calls("drain:"), 0);
        assert!(f.store.get_node("web", "web-a").unwrap().is_none());
    }

    #[tokio::test]
    async fn rollback_only_before_drain() {
        let f = fixture();
        f.cluster.set_drain_stuck("web-a", true);
        let mut node = new_node(&f, "web-a", 1000);
        f.lifecycle.reconcile_node(&f.spec, &mut node, 1000).await.unwrap();

        f.lifecycle.request_termination(&mut node, "test", 2000).unwrap();
        f.lifecycle.reconcile_node(&f.spec, &mut node, 2000).await.unwrap();
        assert!(node.cordoned);
        assert!(f.cluster.is_cordoned("web-a"));

        f.lifecycle.rollback_termination(&mut node, 2010).await.unwrap();
        assert_eq!(node.phase, NodePhase::Ready);
        assert!(!f.cluster.is_cordoned("web-a"));

        node.phase = NodePhase::Terminating;
        node.drained = true;
        let err = f.lifecycle.rollback_termination(&mut node, 2020).await;
        assert!(matches!(err, Err(LifecycleError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn drain_timeout_fails_then_teardown_forces() {
        let f = fixture();
        f.cluster.set_drain_stuck("web-a", true);
        let mut node = new_node(&f, "web-a", 1000);
        f.lifecycle.reconcile_node(&f.spec, &mut node, 1000).await.unwrap();

        f.lifecycle.request_termination(&mut node, "scale down", 2000).unwrap();
        f.lifecycle.reconcile_node(&f.spec, &mut node, 2000).await.unwrap();
        assert_eq!(node.phase, NodePhase::Terminating);

        f.lifecycle.reconcile_node(&f.spec, &mut node, 2301).await.unwrap();
        assert_eq!(node.phase, NodePhase::Failed);
        assert!(reasons(&f, &node).contains(&EventReason::DrainFailed));

        f.lifecycle.request_termination(&mut node, "teardown", 2400).unwrap();
        let progress = f.lifecycle.reconcile_node(&f.spec, &mut node, 2400).await.unwrap();
        assert_eq!(progress, NodeProgress::Removed);
        assert_eq!(f.cluster.count_calls("drain:web-a:force"), 1);
    }

    #[tokio::test]
    async fn reconcile_group_reports_smallest_requeue() {
        let f = fixture();
        f.cloud.set_boot_polls(5);
        new_node(&f, "web-a", 1000);
        new_node(&f, "web-b", 1000);

        let requeue = f.lifecycle.reconcile_group(&f.spec, 1000).await.unwrap();
        assert_eq!(requeue, Some(10));
        for n in f.store.list_nodes("web").unwrap() {
            assert_eq!(n.phase, NodePhase::Provisioning);
        }
    }
}
