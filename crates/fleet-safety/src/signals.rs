//! Point-in-time observations the checks evaluate.

use std::collections::HashMap;

use fleet_provider::{
    CloudProvider, ClusterClient, ControlPlaneHealth, DisruptionStatus, Offering, ProviderResult,
    Quota,
};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SafetySignals {
    pub control_plane: ControlPlaneHealth,
    /// Disruption-budget status keyed by cluster node name.
    pub disruption: HashMap<String, DisruptionStatus>,
    pub offerings: Vec<Offering>,
    pub quota: Quota,
}

impl SafetySignals {
    /// Signals for a healthy cluster with the given offerings and no budgets.
    pub fn healthy(offerings: Vec<Offering>) -> Self {
        Self {
            control_plane: ControlPlaneHealth {
                healthy: true,
                message: String::new(),
            },
            disruption: HashMap::new(),
            offerings,
            quota: Quota::default(),
        }
    }

    pub fn offering(&self, id: &str) -> Option<&Offering> {
        self.offerings.iter().find(|o| o.id == id)
    }
}

/// Gather every signal needed to gate operations on `node_names` in one
/// datacenter.
pub async fn collect_signals(
    cloud: &dyn CloudProvider,
    cluster: &dyn ClusterClient,
    datacenter_id: &str,
    node_names: &[String],
) -> ProviderResult<SafetySignals> {
    let control_plane = cluster.control_plane_health().await?;
    let offerings = cloud.list_offerings(datacenter_id).await?;
    let quota = cloud.quota(datacenter_id).await?;

    let mut disruption = HashMap::with_capacity(node_names.len());
    for name in node_names {
        let status = cluster.disruption_status(name).await?;
        disruption.insert(name.clone(), status);
    }

    debug!(
        datacenter = %datacenter_id,
        nodes = node_names.len(),
        control_plane_healthy = control_plane.healthy,
        "collected safety signals"
    );

    Ok(SafetySignals {
        control_plane,
        disruption,
        offerings,
        quota,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_provider::sim::{SimCloud, SimCluster};

    #[tokio::test]
    async fn collects_budget_status_per_node() {
        let cloud = SimCloud::new("dc-1", &["small", "large"]);
        let cluster = SimCluster::new();
        cluster.set_pdb_blocked("n2", true);

        let names = vec!["n1".to_string(), "n2".to_string()];
        let signals = collect_signals(&cloud, &cluster, "dc-1", &names)
            .await
            .unwrap();

        assert!(signals.control_plane.healthy);
        assert_eq!(signals.offerings.len(), 2);
        assert!(signals.disruption["n1"].allowed);
        assert!(!signals.disruption["n2"].allowed);
    }
}
