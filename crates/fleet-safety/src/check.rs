//! Check results and their aggregation.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CheckName {
    ClusterHealth,
    GroupHealth,
    DisruptionBudget,
    ResourceAvailability,
    Cooldown,
    MaintenanceWindow,
    PeakHours,
}

/// What a failing check blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CheckScope {
    /// Everything in the cluster.
    Cluster,
    /// Operations on the whole group.
    Group,
    /// Operations touching this node only.
    Node(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckResult {
    pub name: CheckName,
    pub scope: CheckScope,
    pub passed: bool,
    pub reason: String,
}

impl CheckResult {
    pub fn pass(name: CheckName, scope: CheckScope, reason: impl Into<String>) -> Self {
        Self {
            name,
            scope,
            passed: true,
            reason: reason.into(),
        }
    }

    pub fn fail(name: CheckName, scope: CheckScope, reason: impl Into<String>) -> Self {
        Self {
            name,
            scope,
            passed: false,
            reason: reason.into(),
        }
    }

    pub fn is_cluster_wide(&self) -> bool {
        self.scope == CheckScope::Cluster
    }
}

/// A conjunction of check results.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Verdict {
    pub checks: Vec<CheckResult>,
}

impl Verdict {
    pub fn push(&mut self, check: CheckResult) {
        self.checks.push(check);
    }

    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.passed)
    }

    /// The first failing cluster-scoped check, if any.
    pub fn cluster_failure(&self) -> Option<&CheckResult> {
        self.failures().find(|c| c.is_cluster_wide())
    }

    pub fn failed(&self, name: CheckName) -> bool {
        self.failures().any(|c| c.name == name)
    }

    /// Reasons of every failing check, joined for events and conditions.
    pub fn summary(&self) -> String {
        self.failures()
            .map(|c| format!("{:?}: {}", c.name, c.reason))
            .collect::<Vec<_>>()
            .join("; ")
    }
}
