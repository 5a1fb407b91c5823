//! The individual checks and the three evaluation entry points.

use fleet_state::{ManagedNode, NodeGroup, NodePhase, RebalancePolicy, weekday_and_hour};
use tracing::{debug, warn};

use crate::check::{CheckName, CheckResult, CheckScope, Verdict};
use crate::signals::SafetySignals;

/// Everything a check may look at.
#[derive(Debug, Clone, Copy)]
pub struct SafetyContext<'a> {
    pub group: &'a NodeGroup,
    /// Effective minimum, after override annotations.
    pub min_nodes: u32,
    pub nodes: &'a [ManagedNode],
    pub signals: &'a SafetySignals,
    /// Nodes already owned by the operation being gated. Their
    /// termination does not count against group health.
    pub exclude: &'a [String],
    pub now: u64,
}

/// Outcome of gating one rebalance batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchVerdict {
    Proceed,
    /// Only this batch waits; `reason` is re-evaluated next pass.
    BlockBatch { reason: String },
    /// A cluster-wide check failed; the whole plan pauses.
    PausePlan { reason: String },
}

pub fn check_cluster_health(signals: &SafetySignals) -> CheckResult {
    if signals.control_plane.healthy {
        CheckResult::pass(CheckName::ClusterHealth, CheckScope::Cluster, "control plane healthy")
    } else {
        CheckResult::fail(
            CheckName::ClusterHealth,
            CheckScope::Cluster,
            format!("control plane degraded: {}", signals.control_plane.message),
        )
    }
}

/// Live nodes stay at or above `min_nodes` after removing `removing`, and
/// no node outside `exclude` is already terminating.
pub fn check_group_health(
    min_nodes: u32,
    nodes: &[ManagedNode],
    removing: u32,
    exclude: &[String],
) -> CheckResult {
    let live = nodes.iter().filter(|n| n.phase.is_live()).count() as u32;
    if let Some(busy) = nodes
        .iter()
        .find(|n| n.phase == NodePhase::Terminating && !exclude.contains(&n.name))
    {
        return CheckResult::fail(
            CheckName::GroupHealth,
            CheckScope::Group,
            format!("node {} is already terminating", busy.name),
        );
    }
    let after = live.saturating_sub(removing);
    if after < min_nodes {
        return CheckResult::fail(
            CheckName::GroupHealth,
            CheckScope::Group,
            format!("{after} live nodes after operation would be below minNodes {min_nodes}"),
        );
    }
    CheckResult::pass(
        CheckName::GroupHealth,
        CheckScope::Group,
        format!("{after} live nodes after operation"),
    )
}

pub fn check_disruption(policy: &RebalancePolicy, signals: &SafetySignals, node: &ManagedNode) -> CheckResult {
    let scope = CheckScope::Node(node.name.clone());
    if !policy.respect_pdbs {
        return CheckResult::pass(CheckName::DisruptionBudget, scope, "disruption budgets not enforced");
    }
    match signals.disruption.get(node.kube_name()) {
        Some(status) if status.allowed => {
            CheckResult::pass(CheckName::DisruptionBudget, scope, "eviction allowed")
        }
        Some(status) => CheckResult::fail(
            CheckName::DisruptionBudget,
            scope,
            format!("eviction blocked by {}", status.blocking.join(", ")),
        ),
        None => CheckResult::fail(
            CheckName::DisruptionBudget,
            scope,
            "no disruption-budget status observed",
        ),
    }
}

/// `offering_id` exists, is available, and quota covers `needed` instances.
pub fn check_resources(signals: &SafetySignals, offering_id: &str, needed: u32) -> CheckResult {
    let scope = CheckScope::Group;
    match signals.offering(offering_id) {
        None => CheckResult::fail(
            CheckName::ResourceAvailability,
            scope,
            format!("offering {offering_id} not offered in datacenter"),
        ),
        Some(o) if !o.available => CheckResult::fail(
            CheckName::ResourceAvailability,
            scope,
            format!("offering {offering_id} currently unavailable"),
        ),
        Some(_) if !signals.quota.allows(needed) => CheckResult::fail(
            CheckName::ResourceAvailability,
            scope,
            format!(
                "quota allows {} more instances, {needed} needed",
                signals.quota.instances_remaining.unwrap_or(0)
            ),
        ),
        Some(_) => CheckResult::pass(CheckName::ResourceAvailability, scope, "capacity available"),
    }
}

pub fn check_cooldown(last_rebalance: u64, cooldown_secs: u64, now: u64) -> CheckResult {
    let elapsed = now.saturating_sub(last_rebalance);
    if last_rebalance == 0 || elapsed >= cooldown_secs {
        CheckResult::pass(CheckName::Cooldown, CheckScope::Group, "cooldown elapsed")
    } else {
        CheckResult::fail(
            CheckName::Cooldown,
            CheckScope::Group,
            format!("last rebalance {elapsed}s ago, cooldown is {cooldown_secs}s"),
        )
    }
}

pub fn check_maintenance_window(policy: &RebalancePolicy, now: u64) -> CheckResult {
    match &policy.maintenance_window {
        None => CheckResult::pass(CheckName::MaintenanceWindow, CheckScope::Group, "no window configured"),
        Some(w) if w.contains(now) => {
            CheckResult::pass(CheckName::MaintenanceWindow, CheckScope::Group, "inside maintenance window")
        }
        Some(w) => {
            let (day, hour) = weekday_and_hour(now);
            CheckResult::fail(
                CheckName::MaintenanceWindow,
                CheckScope::Group,
                format!(
                    "day {day} hour {hour} outside window {:02}:00-{:02}:00",
                    w.hours.start_hour, w.hours.end_hour
                ),
            )
        }
    }
}

pub fn check_peak_hours(policy: &RebalancePolicy, now: u64) -> CheckResult {
    let (_, hour) = weekday_and_hour(now);
    match &policy.peak_hours {
        Some(peak) if peak.contains(hour) => CheckResult::fail(
            CheckName::PeakHours,
            CheckScope::Group,
            format!("hour {hour} is inside peak hours"),
        ),
        _ => CheckResult::pass(CheckName::PeakHours, CheckScope::Group, "outside peak hours"),
    }
}

/// Group-wide checks run before analysing an opportunity.
pub fn evaluate_group(ctx: &SafetyContext<'_>, target_offering: &str) -> Verdict {
    let policy = &ctx.group.spec.rebalancing;
    let mut verdict = Verdict::default();
    verdict.push(check_cluster_health(ctx.signals));
    verdict.push(check_group_health(ctx.min_nodes, ctx.nodes, 0, ctx.exclude));
    verdict.push(check_resources(ctx.signals, target_offering, 1));
    verdict.push(check_cooldown(
        ctx.group.status.last_rebalance_time,
        policy.cooldown_secs,
        ctx.now,
    ));
    verdict.push(check_maintenance_window(policy, ctx.now));
    verdict.push(check_peak_hours(policy, ctx.now));
    log_verdict(ctx, "group", &verdict);
    verdict
}

/// Node-level checks for one candidate.
pub fn evaluate_node(ctx: &SafetyContext<'_>, node: &ManagedNode) -> Verdict {
    let mut verdict = Verdict::default();
    verdict.push(check_disruption(&ctx.group.spec.rebalancing, ctx.signals, node));
    verdict
}

/// Gate the start of one batch replacing `batch_nodes` with `needed` new
/// instances of `target_offering`.
pub fn evaluate_batch(
    ctx: &SafetyContext<'_>,
    batch_nodes: &[&ManagedNode],
    target_offering: &str,
    needed: u32,
) -> BatchVerdict {
    let policy = &ctx.group.spec.rebalancing;
    let mut verdict = Verdict::default();
    verdict.push(check_cluster_health(ctx.signals));
    verdict.push(check_group_health(ctx.min_nodes, ctx.nodes, 0, ctx.exclude));
    for node in batch_nodes {
        verdict.push(check_disruption(policy, ctx.signals, node));
    }
    if needed > 0 {
        verdict.push(check_resources(ctx.signals, target_offering, needed));
    }
    verdict.push(check_maintenance_window(policy, ctx.now));
    verdict.push(check_peak_hours(policy, ctx.now));
    log_verdict(ctx, "batch", &verdict);

    if let Some(failure) = verdict.cluster_failure() {
        return BatchVerdict::PausePlan {
            reason: failure.reason.clone(),
        };
    }
    if verdict.passed() {
        BatchVerdict::Proceed
    } else {
        BatchVerdict::BlockBatch {
            reason: verdict.summary(),
        }
    }
}

/// Reduced gate consulted before removing `removing` nodes on scale-down.
pub fn evaluate_scale_down(ctx: &SafetyContext<'_>, removing: u32) -> Verdict {
    let mut verdict = Verdict::default();
    verdict.push(check_cluster_health(ctx.signals));
    verdict.push(check_group_health(ctx.min_nodes, ctx.nodes, removing, ctx.exclude));
    log_verdict(ctx, "scale-down", &verdict);
    verdict
}

fn log_verdict(ctx: &SafetyContext<'_>, gate: &str, verdict: &Verdict) {
    if verdict.passed() {
        debug!(group = %ctx.group.name(), gate, "safety gate passed");
    } else {
        warn!(group = %ctx.group.name(), gate, reasons = %verdict.summary(), "safety gate blocked");
    }
}
