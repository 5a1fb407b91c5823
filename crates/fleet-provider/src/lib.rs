//! fleet-provider — contracts for the external systems the controller drives.
//!
//! The controller never talks to a cloud VM API or a Kubernetes API server
//! directly; it consumes them through two injected traits:
//!
//! - **`CloudProvider`** — create/delete instances, poll instance status,
//!   list offerings and quota for a datacenter.
//! - **`ClusterClient`** — join a node to the cluster, observe its readiness,
//!   cordon/uncordon/drain it, and report workload health, disruption-budget
//!   status, control-plane health, and utilization.
//!
//! Every call is a short request/response: operations that complete
//! asynchronously on the remote side (booting, joining, draining) are observed
//! by polling on later reconciles, never by blocking.
//!
//! The `sim` module provides deterministic in-memory implementations used by
//! tests and by `fleetd --provider simulated`.

pub mod cloud;
pub mod cluster;
pub mod error;
pub mod sim;

use std::future::Future;
use std::pin::Pin;

pub use cloud::{CloudProvider, InstanceHandle, InstanceSpec, InstanceState, Offering, Quota};
pub use cluster::{
    ClusterClient, ControlPlaneHealth, DisruptionStatus, DrainOptions, DrainStatus,
    NodeCondition, NodeUtilization, WorkloadHealth,
};
pub use error::{ProviderError, ProviderResult};

/// Boxed future returned by collaborator calls.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = ProviderResult<T>> + Send + 'a>>;
