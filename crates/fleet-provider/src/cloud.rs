//! Cloud VM API contract.

use std::collections::HashMap;

use fleet_state::NodeResources;
use serde::{Deserialize, Serialize};

use crate::ProviderFuture;

/// Request to create one instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceSpec {
    /// Node name; providers must treat it as an idempotency token so a
    /// re-issued request returns the instance created the first time.
    pub name: String,
    pub datacenter_id: String,
    pub image_id: String,
    pub offering_id: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceHandle {
    pub instance_id: String,
}

/// Provider-reported instance state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum InstanceState {
    Creating,
    Running,
    Stopped,
    Deleting,
    Error(String),
    NotFound,
}

/// An instance type available in a datacenter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Offering {
    pub id: String,
    pub datacenter_id: String,
    pub available: bool,
    pub resources: NodeResources,
    pub hourly_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Quota {
    /// Instances that may still be created; `None` means unlimited.
    pub instances_remaining: Option<u32>,
}

impl Quota {
    pub fn allows(&self, count: u32) -> bool {
        self.instances_remaining.is_none_or(|r| r >= count)
    }
}

/// The subset of a cloud VM API the controller consumes.
pub trait CloudProvider: Send + Sync {
    /// Request a new instance. Returns once the provider accepted the request.
    fn create_instance<'a>(&'a self, spec: &'a InstanceSpec) -> ProviderFuture<'a, InstanceHandle>;

    /// Request deletion. Deleting an unknown instance succeeds.
    fn delete_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, ()>;

    fn instance_status<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, InstanceState>;

    fn list_offerings<'a>(&'a self, datacenter_id: &'a str) -> ProviderFuture<'a, Vec<Offering>>;

    fn quota<'a>(&'a self, datacenter_id: &'a str) -> ProviderFuture<'a, Quota>;
}
