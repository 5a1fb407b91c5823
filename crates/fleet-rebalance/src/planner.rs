//! Turning an analysis into a batched, reversible plan.

use fleet_state::{
    CandidateNode, NodeBatch, RebalancePlan, RebalancePolicy, RebalanceStrategy, RollbackAction,
    RollbackPlan, RollbackStep,
};
use tracing::info;

use crate::analyzer::{RebalanceAnalysis, per_batch_estimate};
use crate::error::PlanError;

/// Nodes that may be out of service at once without dropping below
/// `min_healthy_percent` of `total_nodes`.
pub fn headroom(total_nodes: u32, min_healthy_percent: u32) -> u32 {
    let disruptable = 100u32.saturating_sub(min_healthy_percent.min(100));
    (u64::from(total_nodes) * u64::from(disruptable) / 100) as u32
}

#[derive(Debug, Clone, Default)]
pub struct RebalancePlanner;

impl RebalancePlanner {
    pub fn new() -> Self {
        Self
    }

    /// Build a plan from the safe candidates of `analysis`, in priority
    /// order.
    ///
    /// - **Rolling**: batches of `batch_size` capped by headroom; batch N
    ///   depends on batch N-1.
    /// - **Surge**: same partition, no dependencies. Replacements are
    ///   provisioned ahead and old nodes are only drained once every new
    ///   node is Ready.
    /// - **Blue-green**: one batch holding every candidate; headroom does
    ///   not apply since the full replacement set is Ready before any
    ///   drain.
    pub fn plan(
        &self,
        analysis: &RebalanceAnalysis,
        policy: &RebalancePolicy,
        now: u64,
    ) -> Result<RebalancePlan, PlanError> {
        if !analysis.safety.passed() {
            return Err(PlanError::NotSafe(analysis.safety.summary()));
        }
        let candidates: Vec<CandidateNode> = analysis.safe_candidates().cloned().collect();
        if candidates.is_empty() {
            return Err(PlanError::NoSafeCandidates);
        }

        let room = headroom(analysis.total_nodes, policy.min_healthy_percent);
        let batches = match policy.strategy {
            RebalanceStrategy::BlueGreen => vec![NodeBatch {
                number: 1,
                nodes: candidates,
                depends_on: Vec::new(),
            }],
            RebalanceStrategy::Rolling | RebalanceStrategy::Surge => {
                if room == 0 {
                    return Err(PlanError::NoHeadroom {
                        min_healthy_percent: policy.min_healthy_percent,
                        total_nodes: analysis.total_nodes,
                    });
                }
                let size = policy.batch_size.max(1).min(room) as usize;
                let rolling = policy.strategy == RebalanceStrategy::Rolling;
                candidates
                    .chunks(size)
                    .enumerate()
                    .map(|(i, chunk)| {
                        let number = i as u32 + 1;
                        NodeBatch {
                            number,
                            nodes: chunk.to_vec(),
                            depends_on: if rolling && number > 1 {
                                vec![number - 1]
                            } else {
                                Vec::new()
                            },
                        }
                    })
                    .collect()
            }
        };

        let rollback = RollbackPlan {
            steps: batches.iter().map(rollback_step).collect(),
        };
        let estimated_duration_secs = estimate(policy, batches.len() as u64);

        let plan = RebalancePlan {
            id: plan_id(&analysis.group, now),
            group: analysis.group.clone(),
            opportunity: analysis.opportunity.clone(),
            batches,
            strategy: policy.strategy,
            max_concurrent: policy.max_concurrent.max(1),
            max_disrupted: room,
            rollback,
            estimated_duration_secs,
            created_at: now,
            version: 0,
        };

        info!(
            plan = %plan.id,
            group = %plan.group,
            strategy = ?plan.strategy,
            batches = plan.batches.len(),
            nodes = plan.batches.iter().map(|b| b.nodes.len()).sum::<usize>(),
            "rebalance plan created"
        );
        Ok(plan)
    }
}

/// Inverse actions for every node of a batch, capacity-restoring actions
/// first. The executor applies the subset matching how far each
/// replacement got.
fn rollback_step(batch: &NodeBatch) -> RollbackStep {
    let mut actions = Vec::with_capacity(batch.nodes.len() * 3);
    for node in &batch.nodes {
        actions.push(RollbackAction::Uncordon {
            node: node.node_name.clone(),
        });
        actions.push(RollbackAction::RecreateOld {
            node: node.node_name.clone(),
            offering_id: node.current_offering_id.clone(),
        });
        actions.push(RollbackAction::CancelReplacement {
            old_node: node.node_name.clone(),
        });
    }
    RollbackStep {
        batch: batch.number,
        actions,
    }
}

fn estimate(policy: &RebalancePolicy, batches: u64) -> u64 {
    let per_batch = per_batch_estimate(policy);
    match policy.strategy {
        RebalanceStrategy::Rolling => batches * per_batch,
        // Provisioning overlaps; drains still run one batch after another.
        RebalanceStrategy::Surge => {
            let waves = batches.div_ceil(u64::from(policy.max_concurrent.max(1)));
            waves * policy.provision_timeout_secs / 2 + batches * policy.drain_timeout_secs / 2
        }
        RebalanceStrategy::BlueGreen => per_batch,
    }
}

fn plan_id(group: &str, now: u64) -> String {
    let prefix: String = group.chars().take(40).collect();
    format!("{}-{now:x}", prefix.trim_end_matches('-'))
}
