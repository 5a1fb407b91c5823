//! Deterministic in-memory collaborators.
//!
//! `SimCloud` and `SimCluster` model just enough of a VM API and a cluster
//! API to drive every controller path: instances boot after a configurable
//! number of status polls, nodes turn Ready after a number of condition
//! polls, drains complete after a number of drain calls, and failures can be
//! injected per offering or per node. Every call is logged so tests can
//! assert on the exact side effects issued.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use fleet_state::NodeResources;
use tracing::debug;

use crate::cloud::{CloudProvider, InstanceHandle, InstanceSpec, InstanceState, Offering, Quota};
use crate::cluster::{
    ClusterClient, ControlPlaneHealth, DisruptionStatus, DrainOptions, DrainStatus,
    NodeCondition, NodeUtilization, WorkloadHealth,
};
use crate::error::ProviderError;
use crate::ProviderFuture;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Cloud ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SimInstance {
    spec: InstanceSpec,
    polls_until_running: u32,
    state: InstanceState,
}

#[derive(Debug, Default)]
struct CloudState {
    offerings: Vec<Offering>,
    instances: HashMap<String, SimInstance>,
    by_token: HashMap<String, String>,
    quota: Option<u32>,
    boot_polls: u32,
    create_failures: HashMap<String, ProviderError>,
    delete_failure: Option<ProviderError>,
    next_id: u64,
    calls: Vec<String>,
}

/// In-memory VM API.
#[derive(Debug, Default)]
pub struct SimCloud {
    state: Mutex<CloudState>,
}

impl SimCloud {
    /// A cloud offering `offering_ids` in `datacenter_id`, each one larger and
    /// pricier than the previous.
    pub fn new(datacenter_id: &str, offering_ids: &[&str]) -> Self {
        let offerings = offering_ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let scale = i as u32 + 1;
                Offering {
                    id: (*id).to_string(),
                    datacenter_id: datacenter_id.to_string(),
                    available: true,
                    resources: NodeResources {
                        cpu_millis: 2000 * scale,
                        memory_bytes: 4 * 1024 * 1024 * 1024 * u64::from(scale),
                        disk_bytes: 80 * 1024 * 1024 * 1024,
                        bandwidth_mbps: 1000,
                    },
                    hourly_price: 0.02 * f64::from(scale),
                }
            })
            .collect();
        Self {
            state: Mutex::new(CloudState {
                offerings,
                ..Default::default()
            }),
        }
    }

    /// Status polls an instance answers `Creating` before it is `Running`.
    pub fn set_boot_polls(&self, polls: u32) {
        lock(&self.state).boot_polls = polls;
    }

    /// Remaining instance quota; `None` is unlimited.
    pub fn set_quota(&self, remaining: Option<u32>) {
        lock(&self.state).quota = remaining;
    }

    pub fn set_offering_available(&self, offering_id: &str, available: bool) {
        let mut st = lock(&self.state);
        if let Some(o) = st.offerings.iter_mut().find(|o| o.id == offering_id) {
            o.available = available;
        }
    }

    /// Fail every create against `offering_id` with `error`.
    pub fn fail_creates(&self, offering_id: &str, error: ProviderError) {
        lock(&self.state)
            .create_failures
            .insert(offering_id.to_string(), error);
    }

    pub fn clear_create_failures(&self) {
        lock(&self.state).create_failures.clear();
    }

    pub fn fail_deletes(&self, error: Option<ProviderError>) {
        lock(&self.state).delete_failure = error;
    }

    /// Put a running instance into an error state.
    pub fn break_instance(&self, instance_id: &str, message: &str) {
        if let Some(inst) = lock(&self.state).instances.get_mut(instance_id) {
            inst.state = InstanceState::Error(message.to_string());
        }
    }

    /// Instance id created for an idempotency token, if any.
    pub fn instance_for(&self, token: &str) -> Option<String> {
        lock(&self.state).by_token.get(token).cloned()
    }

    pub fn instance_spec(&self, instance_id: &str) -> Option<InstanceSpec> {
        lock(&self.state)
            .instances
            .get(instance_id)
            .map(|i| i.spec.clone())
    }

    /// Live (not deleted) instances.
    pub fn instance_count(&self) -> usize {
        lock(&self.state).instances.len()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// Number of `create:` calls that actually created a new instance.
    pub fn created_count(&self) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| c.starts_with("created:"))
            .count()
    }
}

impl CloudProvider for SimCloud {
    fn create_instance<'a>(&'a self, spec: &'a InstanceSpec) -> ProviderFuture<'a, InstanceHandle> {
        Box::pin(async move {
            let mut st = lock(&self.state);
            st.calls.push(format!("create:{}", spec.name));

            if let Some(id) = st.by_token.get(&spec.name) {
                return Ok(InstanceHandle {
                    instance_id: id.clone(),
                });
            }
            if let Some(err) = st.create_failures.get(&spec.offering_id) {
                return Err(err.clone());
            }
            let available = st
                .offerings
                .iter()
                .any(|o| o.id == spec.offering_id && o.available);
            if !available {
                return Err(ProviderError::OfferingUnavailable(spec.offering_id.clone()));
            }
            match st.quota {
                Some(0) => {
                    return Err(ProviderError::QuotaExceeded(format!(
                        "no instance quota left in {}",
                        spec.datacenter_id
                    )));
                }
                Some(n) => st.quota = Some(n - 1),
                None => {}
            }

            st.next_id += 1;
            let instance_id = format!("i-{:06}", st.next_id);
            let polls = st.boot_polls;
            st.instances.insert(
                instance_id.clone(),
                SimInstance {
                    spec: spec.clone(),
                    polls_until_running: polls,
                    state: InstanceState::Creating,
                },
            );
            st.by_token.insert(spec.name.clone(), instance_id.clone());
            st.calls.push(format!("created:{}", spec.name));
            debug!(%instance_id, name = %spec.name, offering = %spec.offering_id, "sim instance created");
            Ok(InstanceHandle { instance_id })
        })
    }

    fn delete_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let mut st = lock(&self.state);
            st.calls.push(format!("delete:{instance_id}"));
            if let Some(err) = &st.delete_failure {
                return Err(err.clone());
            }
            if let Some(inst) = st.instances.remove(instance_id) {
                st.by_token.remove(&inst.spec.name);
            }
            Ok(())
        })
    }

    fn instance_status<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, InstanceState> {
        Box::pin(async move {
            let mut st = lock(&self.state);
            let Some(inst) = st.instances.get_mut(instance_id) else {
                return Ok(InstanceState::NotFound);
            };
            if inst.state == InstanceState::Creating {
                if inst.polls_until_running == 0 {
                    inst.state = InstanceState::Running;
                } else {
                    inst.polls_until_running -= 1;
                }
            }
            Ok(inst.state.clone())
        })
    }

    fn list_offerings<'a>(&'a self, datacenter_id: &'a str) -> ProviderFuture<'a, Vec<Offering>> {
        Box::pin(async move {
            Ok(lock(&self.state)
                .offerings
                .iter()
                .filter(|o| o.datacenter_id == datacenter_id)
                .cloned()
                .collect())
        })
    }

    fn quota<'a>(&'a self, _datacenter_id: &'a str) -> ProviderFuture<'a, Quota> {
        Box::pin(async move {
            Ok(Quota {
                instances_remaining: lock(&self.state).quota,
            })
        })
    }
}

// ── Cluster ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SimNode {
    polls_until_ready: u32,
    ready: bool,
    cordoned: bool,
    drain_calls_left: u32,
    drained: bool,
}

#[derive(Debug)]
struct ClusterState {
    nodes: HashMap<String, SimNode>,
    ready_polls: u32,
    drain_polls: u32,
    join_failure: Option<ProviderError>,
    never_ready: HashSet<String>,
    stuck_drains: HashSet<String>,
    pdb_blocked: HashSet<String>,
    workload: HashMap<String, WorkloadHealth>,
    control_plane_healthy: bool,
    default_utilization: (f64, f64),
    utilization: HashMap<String, (f64, f64)>,
    calls: Vec<String>,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self {
            nodes: HashMap::new(),
            ready_polls: 0,
            drain_polls: 0,
            join_failure: None,
            never_ready: HashSet::new(),
            stuck_drains: HashSet::new(),
            pdb_blocked: HashSet::new(),
            workload: HashMap::new(),
            control_plane_healthy: true,
            default_utilization: (50.0, 50.0),
            utilization: HashMap::new(),
            calls: Vec::new(),
        }
    }
}

/// In-memory cluster API.
#[derive(Debug, Default)]
pub struct SimCluster {
    state: Mutex<ClusterState>,
}

impl SimCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an already-Ready node, e.g. one that predates the test.
    pub fn add_ready_node(&self, name: &str) {
        lock(&self.state).nodes.insert(
            name.to_string(),
            SimNode {
                polls_until_ready: 0,
                ready: true,
                cordoned: false,
                drain_calls_left: 0,
                drained: false,
            },
        );
    }

    /// Condition polls a joined node answers `NotReady` before `Ready`.
    pub fn set_ready_polls(&self, polls: u32) {
        lock(&self.state).ready_polls = polls;
    }

    /// Drain calls answered `InProgress` before `Complete`.
    pub fn set_drain_polls(&self, polls: u32) {
        lock(&self.state).drain_polls = polls;
    }

    pub fn fail_joins(&self, error: Option<ProviderError>) {
        lock(&self.state).join_failure = error;
    }

    pub fn set_never_ready(&self, node: &str) {
        lock(&self.state).never_ready.insert(node.to_string());
    }

    /// Drains of `node` never finish unless forced.
    pub fn set_drain_stuck(&self, node: &str, stuck: bool) {
        let mut st = lock(&self.state);
        if stuck {
            st.stuck_drains.insert(node.to_string());
        } else {
            st.stuck_drains.remove(node);
        }
    }

    /// Evicting pods from `node` would violate a disruption budget.
    pub fn set_pdb_blocked(&self, node: &str, blocked: bool) {
        let mut st = lock(&self.state);
        if blocked {
            st.pdb_blocked.insert(node.to_string());
        } else {
            st.pdb_blocked.remove(node);
        }
    }

    pub fn set_workload_health(&self, node: &str, health: WorkloadHealth) {
        lock(&self.state).workload.insert(node.to_string(), health);
    }

    pub fn set_control_plane_healthy(&self, healthy: bool) {
        lock(&self.state).control_plane_healthy = healthy;
    }

    /// Utilization reported for nodes without a per-node value.
    pub fn set_default_utilization(&self, cpu_percent: f64, memory_percent: f64) {
        lock(&self.state).default_utilization = (cpu_percent, memory_percent);
    }

    pub fn set_node_utilization(&self, node: &str, cpu_percent: f64, memory_percent: f64) {
        lock(&self.state)
            .utilization
            .insert(node.to_string(), (cpu_percent, memory_percent));
    }

    /// Mark a registered node NotReady (e.g. kubelet died).
    pub fn set_node_ready(&self, node: &str, ready: bool) {
        if let Some(n) = lock(&self.state).nodes.get_mut(node) {
            n.ready = ready;
            n.polls_until_ready = 0;
        }
    }

    pub fn has_node(&self, node: &str) -> bool {
        lock(&self.state).nodes.contains_key(node)
    }

    pub fn is_cordoned(&self, node: &str) -> bool {
        lock(&self.state)
            .nodes
            .get(node)
            .is_some_and(|n| n.cordoned)
    }

    pub fn is_drained(&self, node: &str) -> bool {
        lock(&self.state).nodes.get(node).is_some_and(|n| n.drained)
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// Calls with `prefix`, e.g. `"drain:"`.
    pub fn count_calls(&self, prefix: &str) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

impl ClusterClient for SimCluster {
    fn join_cluster<'a>(&'a self, instance_id: &'a str, node_name: &'a str) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            let mut st = lock(&self.state);
            st.calls.push(format!("join:{node_name}:{instance_id}"));
            if let Some(err) = &st.join_failure {
                return Err(err.clone());
            }
            let polls = st.ready_polls;
            let drain_polls = st.drain_polls;
            st.nodes.entry(node_name.to_string()).or_insert(SimNode {
                polls_until_ready: polls,
                ready: false,
                cordoned: false,
                drain_calls_left: drain_polls,
                drained: false,
            });
            Ok(node_name.to_string())
        })
    }

    fn node_condition<'a>(&'a self, node_name: &'a str) -> ProviderFuture<'a, NodeCondition> {
        Box::pin(async move {
            let mut st = lock(&self.state);
            let never_ready = st.never_ready.contains(node_name);
            let Some(node) = st.nodes.get_mut(node_name) else {
                return Ok(NodeCondition::Absent);
            };
            if !node.ready && !never_ready {
                if node.polls_until_ready == 0 {
                    node.ready = true;
                } else {
                    node.polls_until_ready -= 1;
                }
            }
            Ok(if node.ready {
                NodeCondition::Ready
            } else {
                NodeCondition::NotReady
            })
        })
    }

    fn cordon_node<'a>(&'a self, node_name: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let mut st = lock(&self.state);
            st.calls.push(format!("cordon:{node_name}"));
            if let Some(n) = st.nodes.get_mut(node_name) {
                n.cordoned = true;
            }
            Ok(())
        })
    }

    fn uncordon_node<'a>(&'a self, node_name: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let mut st = lock(&self.state);
            st.calls.push(format!("uncordon:{node_name}"));
            if let Some(n) = st.nodes.get_mut(node_name) {
                n.cordoned = false;
            }
            Ok(())
        })
    }

    fn drain_node<'a>(&'a self, node_name: &'a str, options: DrainOptions) -> ProviderFuture<'a, DrainStatus> {
        Box::pin(async move {
            let mut st = lock(&self.state);
            st.calls.push(format!(
                "drain:{node_name}{}",
                if options.force { ":force" } else { "" }
            ));
            if !options.force {
                if options.respect_pdbs && st.pdb_blocked.contains(node_name) {
                    return Ok(DrainStatus::Blocked {
                        reason: format!("eviction of pods on {node_name} violates a disruption budget"),
                    });
                }
                if st.stuck_drains.contains(node_name) {
                    return Ok(DrainStatus::InProgress { remaining_pods: 1 });
                }
            }
            let Some(node) = st.nodes.get_mut(node_name) else {
                return Ok(DrainStatus::Complete);
            };
            if !options.force && node.drain_calls_left > 0 {
                node.drain_calls_left -= 1;
                return Ok(DrainStatus::InProgress {
                    remaining_pods: node.drain_calls_left + 1,
                });
            }
            node.drained = true;
            Ok(DrainStatus::Complete)
        })
    }

    fn delete_node_object<'a>(&'a self, node_name: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let mut st = lock(&self.state);
            st.calls.push(format!("delete-node:{node_name}"));
            st.nodes.remove(node_name);
            Ok(())
        })
    }

    fn workload_health<'a>(&'a self, node_name: &'a str) -> ProviderFuture<'a, WorkloadHealth> {
        Box::pin(async move {
            Ok(lock(&self.state)
                .workload
                .get(node_name)
                .cloned()
                .unwrap_or(WorkloadHealth::Healthy))
        })
    }

    fn disruption_status<'a>(&'a self, node_name: &'a str) -> ProviderFuture<'a, DisruptionStatus> {
        Box::pin(async move {
            let blocked = lock(&self.state).pdb_blocked.contains(node_name);
            Ok(if blocked {
                DisruptionStatus {
                    allowed: false,
                    blocking: vec![format!("pdb-{node_name}")],
                }
            } else {
                DisruptionStatus {
                    allowed: true,
                    blocking: Vec::new(),
                }
            })
        })
    }

    fn control_plane_health(&self) -> ProviderFuture<'_, ControlPlaneHealth> {
        Box::pin(async move {
            let healthy = lock(&self.state).control_plane_healthy;
            Ok(ControlPlaneHealth {
                healthy,
                message: if healthy {
                    "all components healthy".to_string()
                } else {
                    "control plane degraded".to_string()
                },
            })
        })
    }

    fn node_utilization<'a>(&'a self, node_names: &'a [String]) -> ProviderFuture<'a, Vec<NodeUtilization>> {
        Box::pin(async move {
            let st = lock(&self.state);
            Ok(node_names
                .iter()
                .map(|name| {
                    let (cpu, mem) = st
                        .utilization
                        .get(name)
                        .copied()
                        .unwrap_or(st.default_utilization);
                    NodeUtilization {
                        node: name.clone(),
                        cpu_percent: cpu,
                        memory_percent: mem,
                    }
                })
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(name: &str, offering: &str) -> InstanceSpec {
        InstanceSpec {
            name: name.to_string(),
            datacenter_id: "dc-1".to_string(),
            image_id: "img".to_string(),
            offering_id: offering.to_string(),
            labels: HashMap::new(),
        }
    }

    fn drain_opts(force: bool) -> DrainOptions {
        DrainOptions {
            respect_pdbs: true,
            force,
            timeout: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_per_token() {
        let cloud = SimCloud::new("dc-1", &["small"]);
        let a = cloud.create_instance(&spec("web-1", "small")).await.unwrap();
        let b = cloud.create_instance(&spec("web-1", "small")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(cloud.instance_count(), 1);
        assert_eq!(cloud.created_count(), 1);
    }

    #[tokio::test]
    async fn instance_boots_after_polls() {
        let cloud = SimCloud::new("dc-1", &["small"]);
        cloud.set_boot_polls(2);
        let h = cloud.create_instance(&spec("web-1", "small")).await.unwrap();
        assert_eq!(cloud.instance_status(&h.instance_id).await.unwrap(), InstanceState::Creating);
        assert_eq!(cloud.instance_status(&h.instance_id).await.unwrap(), InstanceState::Creating);
        assert_eq!(cloud.instance_status(&h.instance_id).await.unwrap(), InstanceState::Running);
    }

    #[tokio::test]
    async fn quota_and_unavailable_offerings() {
        let cloud = SimCloud::new("dc-1", &["small", "large"]);
        cloud.set_quota(Some(1));
        cloud.set_offering_available("large", false);

        let err = cloud.create_instance(&spec("a", "large")).await.unwrap_err();
        assert!(matches!(err, ProviderError::OfferingUnavailable(_)));
        cloud.create_instance(&spec("b", "small")).await.unwrap();
        let err = cloud.create_instance(&spec("c", "small")).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn delete_unknown_instance_succeeds() {
        let cloud = SimCloud::new("dc-1", &["small"]);
        cloud.delete_instance("i-missing").await.unwrap();
        assert_eq!(
            cloud.instance_status("i-missing").await.unwrap(),
            InstanceState::NotFound
        );
    }

    #[tokio::test]
    async fn joined_node_turns_ready() {
        let cluster = SimCluster::new();
        cluster.set_ready_polls(1);
        assert_eq!(cluster.node_condition("n1").await.unwrap(), NodeCondition::Absent);
        cluster.join_cluster("i-1", "n1").await.unwrap();
        assert_eq!(cluster.node_condition("n1").await.unwrap(), NodeCondition::NotReady);
        assert_eq!(cluster.node_condition("n1").await.unwrap(), NodeCondition::Ready);
    }

    #[tokio::test]
    async fn pdb_blocks_drain_unless_forced() {
        let cluster = SimCluster::new();
        cluster.add_ready_node("n1");
        cluster.set_pdb_blocked("n1", true);

        let status = cluster.drain_node("n1", drain_opts(false)).await.unwrap();
        assert!(matches!(status, DrainStatus::Blocked { .. }));
        assert!(!cluster.disruption_status("n1").await.unwrap().allowed);

        let status = cluster.drain_node("n1", drain_opts(true)).await.unwrap();
        assert_eq!(status, DrainStatus::Complete);
        assert!(cluster.is_drained("n1"));
    }

    #[tokio::test]
    async fn utilization_falls_back_to_default() {
        let cluster = SimCluster::new();
        cluster.set_default_utilization(10.0, 20.0);
        cluster.set_node_utilization("hot", 95.0, 90.0);
        let names = vec!["hot".to_string(), "cold".to_string()];
        let u = cluster.node_utilization(&names).await.unwrap();
        assert_eq!(u[0].cpu_percent, 95.0);
        assert_eq!(u[1].memory_percent, 20.0);
    }
}
