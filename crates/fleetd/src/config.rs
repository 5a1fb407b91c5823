//! fleetd.toml configuration.
//!
//! Every section and field has a default; a missing section is filled in,
//! a missing file is an error.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use fleet_lifecycle::LifecycleConfig;
use fleet_rebalance::{ExecutorConfig, ScoreWeights};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FleetdConfig {
    pub controller: ControllerConfig,
    pub leader: LeaderConfig,
    pub api: ApiConfig,
    pub provider: ProviderConfig,
    pub analyzer: ScoreWeights,
    pub lifecycle: LifecycleConfig,
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Lease holder identity.
    pub id: String,
    /// Concurrent group reconciles.
    pub workers: usize,
    /// Interval of the periodic full re-enqueue.
    pub resync_interval_secs: u64,
    /// Deadline for a single reconcile.
    pub reconcile_timeout_secs: u64,
    /// How long shutdown waits for in-flight reconciles.
    pub shutdown_grace_secs: u64,
    pub data_dir: PathBuf,
    pub log_format: LogFormat,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            id: "fleetd-0".to_string(),
            workers: 4,
            resync_interval_secs: 30,
            reconcile_timeout_secs: 60,
            shutdown_grace_secs: 30,
            data_dir: PathBuf::from("/var/lib/fleetd"),
            log_format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LeaderConfig {
    pub lease_ttl_secs: u64,
    pub renew_interval_secs: u64,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 15,
            renew_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8480)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// In-memory cloud and cluster; real clients are linked in externally.
    #[default]
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub simulated: SimulatedConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Simulated,
            simulated: SimulatedConfig::default(),
        }
    }
}

/// Shape of the simulated datacenter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulatedConfig {
    pub datacenter_id: String,
    /// Offerings, smallest first.
    pub offering_ids: Vec<String>,
    /// Status polls before a new instance is running.
    pub boot_polls: u32,
    /// Remaining instance quota; unlimited when absent.
    pub quota: Option<u32>,
    /// Utilization every simulated node reports.
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            datacenter_id: "dc-1".to_string(),
            offering_ids: vec!["small".to_string(), "medium".to_string(), "large".to_string()],
            boot_polls: 1,
            quota: None,
            cpu_percent: 50.0,
            memory_percent: 50.0,
        }
    }
}

impl FleetdConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: FleetdConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.controller.id.trim().is_empty() {
            anyhow::bail!("controller.id must not be empty");
        }
        if self.controller.workers == 0 {
            anyhow::bail!("controller.workers must be >= 1");
        }
        if self.controller.resync_interval_secs == 0 {
            anyhow::bail!("controller.resync_interval_secs must be > 0");
        }
        if self.leader.renew_interval_secs == 0
            || self.leader.renew_interval_secs >= self.leader.lease_ttl_secs
        {
            anyhow::bail!(
                "leader.renew_interval_secs ({}) must be > 0 and below lease_ttl_secs ({})",
                self.leader.renew_interval_secs,
                self.leader.lease_ttl_secs
            );
        }
        if self.provider.simulated.offering_ids.is_empty() {
            anyhow::bail!("provider.simulated.offering_ids must not be empty");
        }
        Ok(())
    }
}
