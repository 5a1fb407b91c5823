//! fleetd — the fleet controller daemon.
//!
//! Assembles the fleet subsystems into one process:
//! - State store (redb)
//! - Cloud and cluster collaborators
//! - Leader election over a store lease
//! - Work queue with a bounded worker pool running per-group reconciles
//! - REST API
//!
//! # Usage
//!
//! ```text
//! fleetd run --config /etc/fleetd/fleetd.toml
//! ```

pub mod config;
pub mod controller;
pub mod leader;
pub mod queue;
pub mod reconciler;

use std::sync::Arc;

use fleet_provider::sim::{SimCloud, SimCluster};
use fleet_provider::{CloudProvider, ClusterClient};

use crate::config::{ProviderConfig, ProviderKind};

/// Collaborators selected by `[provider]`.
pub struct Providers {
    pub cloud: Arc<dyn CloudProvider>,
    pub cluster: Arc<dyn ClusterClient>,
}

pub fn build_providers(config: &ProviderConfig) -> Providers {
    match config.kind {
        ProviderKind::Simulated => {
            let sim = &config.simulated;
            let offerings: Vec<&str> = sim.offering_ids.iter().map(String::as_str).collect();
            let cloud = SimCloud::new(&sim.datacenter_id, &offerings);
            cloud.set_boot_polls(sim.boot_polls);
            cloud.set_quota(sim.quota);
            let cluster = SimCluster::new();
            cluster.set_default_utilization(sim.cpu_percent, sim.memory_percent);
            Providers {
                cloud: Arc::new(cloud),
                cluster: Arc::new(cluster),
            }
        }
    }
}
