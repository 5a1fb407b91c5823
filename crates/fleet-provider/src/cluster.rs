//! Cluster (Kubernetes API) contract.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ProviderFuture;

/// Readiness of a node object as seen by the API server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCondition {
    /// No node object registered yet.
    Absent,
    /// Registered but not Ready.
    NotReady,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOptions {
    pub respect_pdbs: bool,
    /// Evict remaining pods regardless of disruption budgets.
    pub force: bool,
    pub timeout: Duration,
}

/// Progress of an issued drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainStatus {
    /// All evictable workloads are off the node.
    Complete,
    InProgress { remaining_pods: u32 },
    /// Evictions refused, e.g. by a PodDisruptionBudget.
    Blocked { reason: String },
}

/// Health of workloads scheduled onto a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadHealth {
    Healthy,
    Pending { not_ready: u32 },
    Unhealthy { reason: String },
}

/// Whether evicting the pods on a node would violate a disruption budget.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisruptionStatus {
    pub allowed: bool,
    /// Names of budgets that would be violated.
    pub blocking: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPlaneHealth {
    pub healthy: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeUtilization {
    pub node: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// The subset of the cluster API the controller consumes.
pub trait ClusterClient: Send + Sync {
    /// Issue a join for a running instance; returns the node name it will
    /// register under.
    fn join_cluster<'a>(&'a self, instance_id: &'a str, node_name: &'a str) -> ProviderFuture<'a, String>;

    fn node_condition<'a>(&'a self, node_name: &'a str) -> ProviderFuture<'a, NodeCondition>;

    fn cordon_node<'a>(&'a self, node_name: &'a str) -> ProviderFuture<'a, ()>;

    fn uncordon_node<'a>(&'a self, node_name: &'a str) -> ProviderFuture<'a, ()>;

    /// Issue (or continue) evictions and report progress.
    fn drain_node<'a>(&'a self, node_name: &'a str, options: DrainOptions) -> ProviderFuture<'a, DrainStatus>;

    /// Remove the node object once its instance is gone.
    fn delete_node_object<'a>(&'a self, node_name: &'a str) -> ProviderFuture<'a, ()>;

    fn workload_health<'a>(&'a self, node_name: &'a str) -> ProviderFuture<'a, WorkloadHealth>;

    fn disruption_status<'a>(&'a self, node_name: &'a str) -> ProviderFuture<'a, DisruptionStatus>;

    fn control_plane_health(&self) -> ProviderFuture<'_, ControlPlaneHealth>;

    fn node_utilization<'a>(&'a self, node_names: &'a [String]) -> ProviderFuture<'a, Vec<NodeUtilization>>;
}
