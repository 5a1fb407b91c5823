//! Candidate scoring and the group-wide rebalance gate.

use fleet_safety::{
    CheckName, CheckResult, CheckScope, SafetyContext, Verdict, evaluate_group, evaluate_node,
};
use fleet_state::{CandidateNode, ManagedNode, NodePhase, Opportunity};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Weights of the candidate priority score.
///
/// `score = age_weight * min(age / age_horizon, 1)
///        + savings_weight * savings / 100
///        - safety_penalty_weight * (node gate failed)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub age_weight: f64,
    pub savings_weight: f64,
    pub safety_penalty_weight: f64,
    /// Age at which the age term saturates.
    pub age_horizon_secs: u64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            age_weight: 0.4,
            savings_weight: 0.6,
            safety_penalty_weight: 0.5,
            age_horizon_secs: 30 * 24 * 3600,
        }
    }
}

impl ScoreWeights {
    pub fn score(&self, age_secs: u64, savings_percent: f64, unsafe_node: bool) -> f64 {
        let age = if self.age_horizon_secs == 0 {
            1.0
        } else {
            (age_secs as f64 / self.age_horizon_secs as f64).min(1.0)
        };
        let savings = savings_percent.clamp(0.0, 100.0) / 100.0;
        let penalty = if unsafe_node { self.safety_penalty_weight } else { 0.0 };
        self.age_weight * age + self.savings_weight * savings - penalty
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecommendedAction {
    /// Plan and execute now.
    Proceed,
    /// Something transient blocks the group; analyse again later.
    Defer,
    /// Nothing in the group can take the substitution.
    Skip,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebalanceAnalysis {
    pub group: String,
    pub opportunity: Opportunity,
    /// Live nodes in the group.
    pub total_nodes: u32,
    /// Eligible nodes, highest priority first.
    pub candidates: Vec<CandidateNode>,
    pub safety: Verdict,
    pub safe_to_rebalance: bool,
    pub recommended_action: RecommendedAction,
    pub estimated_duration_secs: u64,
}

impl RebalanceAnalysis {
    pub fn safe_candidates(&self) -> impl Iterator<Item = &CandidateNode> {
        self.candidates.iter().filter(|c| c.safe_to_rebalance)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RebalanceAnalyzer {
    weights: ScoreWeights,
}

impl RebalanceAnalyzer {
    pub fn new(weights: ScoreWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScoreWeights {
        &self.weights
    }

    /// Score every eligible node of `ctx.group` against `opportunity` and
    /// run the group-wide gate.
    pub fn analyze(&self, ctx: &SafetyContext<'_>, opportunity: &Opportunity) -> RebalanceAnalysis {
        let group = ctx.group.name().to_string();
        let policy = &ctx.group.spec.rebalancing;
        let target = opportunity.target_offering_id.as_str();

        let mut candidates: Vec<CandidateNode> = ctx
            .nodes
            .iter()
            .filter(|n| self.eligible(n, opportunity, policy.skip_nodes_with_local_storage))
            .map(|n| {
                let verdict = evaluate_node(ctx, n);
                let safe = verdict.passed();
                let age = n.age_secs(ctx.now);
                CandidateNode {
                    node_name: n.name.clone(),
                    instance_id: n.instance_id.clone(),
                    current_offering_id: n.offering_id.clone(),
                    target_offering_id: target.to_string(),
                    age_secs: age,
                    priority_score: self.weights.score(age, opportunity.estimated_savings_percent, !safe),
                    safe_to_rebalance: safe,
                    reason: if safe {
                        format!("{} -> {target}", n.offering_id)
                    } else {
                        verdict.summary()
                    },
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.priority_score
                .total_cmp(&a.priority_score)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
                .then_with(|| a.node_name.cmp(&b.node_name))
        });

        let mut safety = evaluate_group(ctx, target);
        if opportunity.is_expired(ctx.now) {
            safety.push(CheckResult::fail(
                CheckName::ResourceAvailability,
                CheckScope::Group,
                format!("opportunity {} expired", opportunity.id),
            ));
        }

        let safe_count = candidates.iter().filter(|c| c.safe_to_rebalance).count() as u32;
        let safe_to_rebalance = safety.passed() && safe_count > 0;
        let recommended_action = if candidates.is_empty() || opportunity.is_expired(ctx.now) {
            RecommendedAction::Skip
        } else if safe_to_rebalance {
            RecommendedAction::Proceed
        } else {
            RecommendedAction::Defer
        };

        let batch_size = policy.batch_size.max(1);
        let batches = safe_count.div_ceil(batch_size) as u64;
        let estimated_duration_secs = batches * per_batch_estimate(policy);

        let total_nodes = ctx.nodes.iter().filter(|n| n.phase.is_live()).count() as u32;
        let analysis = RebalanceAnalysis {
            group,
            opportunity: opportunity.clone(),
            total_nodes,
            candidates,
            safety,
            safe_to_rebalance,
            recommended_action,
            estimated_duration_secs,
        };

        info!(
            group = %analysis.group,
            opportunity = %opportunity.id,
            candidates = analysis.candidates.len(),
            safe = safe_count,
            action = ?analysis.recommended_action,
            "opportunity analysed"
        );
        analysis
    }

    fn eligible(&self, node: &ManagedNode, opportunity: &Opportunity, skip_local_storage: bool) -> bool {
        let skip = if node.phase != NodePhase::Ready {
            Some("not Ready")
        } else if node.offering_id == opportunity.target_offering_id {
            Some("already on target offering")
        } else if node.is_do_not_delete() {
            Some("do-not-delete")
        } else if skip_local_storage && node.has_local_storage {
            Some("local storage")
        } else if !opportunity.node_names.is_empty() && !opportunity.node_names.contains(&node.name) {
            Some("not named by opportunity")
        } else {
            None
        };
        if let Some(why) = skip {
            debug!(node = %node.name, why, "node not eligible");
        }
        skip.is_none()
    }
}

/// Rough wall-clock cost of one batch: half of each configured timeout.
pub(crate) fn per_batch_estimate(policy: &fleet_state::RebalancePolicy) -> u64 {
    (policy.provision_timeout_secs + policy.drain_timeout_secs + policy.health_check_timeout_secs) / 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_provider::{DisruptionStatus, Offering, Quota};
    use fleet_safety::SafetySignals;
    use fleet_state::{
        ANNOTATION_DO_NOT_DELETE, NodeGroup, NodeGroupSpec, NodeOwner, NodeResources,
        RebalancePolicy, ScaleDownPolicy, ScaleUpPolicy,
    };
    use std::collections::HashMap;

    const NOW: u64 = 10 * 24 * 3600 + 3 * 3600;

    fn group() -> NodeGroup {
        NodeGroup::new(
            NodeGroupSpec {
                name: "web".into(),
                datacenter_id: "dc-1".into(),
                image_id: "img".into(),
                offering_ids: vec!["small".into(), "large".into()],
                min_nodes: 1,
                max_nodes: 10,
                scale_up: ScaleUpPolicy::default(),
                scale_down: ScaleDownPolicy::default(),
                rebalancing: RebalancePolicy::default(),
                labels: HashMap::new(),
                annotations: HashMap::new(),
            },
            0,
        )
    }

    fn node(name: &str, instance: &str, created_at: u64) -> ManagedNode {
        let mut n = ManagedNode::pending(name, "web", "small", NodeOwner::Scaling, created_at);
        n.phase = NodePhase::Ready;
        n.instance_id = Some(instance.into());
        n
    }

    fn signals(nodes: &[ManagedNode]) -> SafetySignals {
        let mut s = SafetySignals::healthy(vec![Offering {
            id: "large".into(),
            datacenter_id: "dc-1".into(),
            available: true,
            resources: NodeResources::default(),
            hourly_price: 0.01,
        }]);
        s.quota = Quota::default();
        for n in nodes {
            s.disruption.insert(
                n.name.clone(),
                DisruptionStatus {
                    allowed: true,
                    blocking: Vec::new(),
                },
            );
        }
        s
    }

    fn opportunity() -> Opportunity {
        Opportunity {
            id: "opp-1".into(),
            group: "web".into(),
            target_offering_id: "large".into(),
            node_names: Vec::new(),
            estimated_savings_percent: 20.0,
            estimated_monthly_savings: 40.0,
            performance_delta_percent: 0.0,
            created_at: NOW,
            expires_at: None,
            version: 0,
        }
    }

    fn analyze(g: &NodeGroup, nodes: &[ManagedNode], s: &SafetySignals, opp: &Opportunity) -> RebalanceAnalysis {
        let ctx = SafetyContext {
            group: g,
            min_nodes: g.spec.min_nodes,
            nodes,
            signals: s,
            exclude: &[],
            now: NOW,
        };
        RebalanceAnalyzer::default().analyze(&ctx, opp)
    }

    #[test]
    fn score_formula() {
        let w = ScoreWeights::default();
        let full = w.score(w.age_horizon_secs * 2, 50.0, false);
        assert!((full - (0.4 + 0.3)).abs() < 1e-9);
        let half = w.score(w.age_horizon_secs / 2, 0.0, true);
        assert!((half - (0.2 - 0.5)).abs() < 1e-9);
    }

    #[test]
    fn older_nodes_rank_first_and_ties_break_by_instance_id() {
        let g = group();
        let nodes = vec![
            node("web-new", "i-3", NOW - 3600),
            node("web-b", "i-2", 0),
            node("web-a", "i-1", 0),
        ];
        let s = signals(&nodes);
        let a = analyze(&g, &nodes, &s, &opportunity());

        let order: Vec<_> = a.candidates.iter().map(|c| c.node_name.as_str()).collect();
        assert_eq!(order, vec!["web-a", "web-b", "web-new"]);
        assert!(a.safe_to_rebalance);
        assert_eq!(a.recommended_action, RecommendedAction::Proceed);
        assert_eq!(a.total_nodes, 3);
    }

    #[test]
    fn ineligible_nodes_are_skipped() {
        let mut g = group();
        g.spec.rebalancing.skip_nodes_with_local_storage = true;

        let mut on_target = node("web-target", "i-1", 0);
        on_target.offering_id = "large".into();
        let mut pinned = node("web-pinned", "i-2", 0);
        pinned
            .annotations
            .insert(ANNOTATION_DO_NOT_DELETE.into(), "true".into());
        let mut storage = node("web-disk", "i-3", 0);
        storage.has_local_storage = true;
        let mut joining = node("web-joining", "i-4", 0);
        joining.phase = NodePhase::Joining;
        let plain = node("web-plain", "i-5", 0);

        let nodes = vec![on_target, pinned, storage, joining, plain];
        let s = signals(&nodes);
        let a = analyze(&g, &nodes, &s, &opportunity());
        let names: Vec<_> = a.candidates.iter().map(|c| c.node_name.as_str()).collect();
        assert_eq!(names, vec!["web-plain"]);
    }

    #[test]
    fn node_filter_restricts_candidates() {
        let g = group();
        let nodes = vec![node("web-a", "i-1", 0), node("web-b", "i-2", 0)];
        let s = signals(&nodes);
        let mut opp = opportunity();
        opp.node_names = vec!["web-b".into()];
        let a = analyze(&g, &nodes, &s, &opp);
        assert_eq!(a.candidates.len(), 1);
        assert_eq!(a.candidates[0].node_name, "web-b");
    }

    #[test]
    fn pdb_blocked_node_is_penalised_and_unsafe() {
        let g = group();
        let nodes = vec![node("web-a", "i-1", 0), node("web-b", "i-2", 0)];
        let mut s = signals(&nodes);
        s.disruption.insert(
            "web-a".into(),
            DisruptionStatus {
                allowed: false,
                blocking: vec!["pdb-web".into()],
            },
        );
        let a = analyze(&g, &nodes, &s, &opportunity());
        assert_eq!(a.candidates[0].node_name, "web-b");
        let blocked = &a.candidates[1];
        assert!(!blocked.safe_to_rebalance);
        assert!(blocked.reason.contains("pdb-web"));
        assert!(a.safe_to_rebalance);
    }

    #[test]
    fn cooldown_blocks_group() {
        let mut g = group();
        g.spec.rebalancing.cooldown_secs = 3600;
        g.status.last_rebalance_time = NOW - 600;
        let nodes = vec![node("web-a", "i-1", 0)];
        let s = signals(&nodes);
        let a = analyze(&g, &nodes, &s, &opportunity());
        assert!(!a.safe_to_rebalance);
        assert!(a.safety.failed(CheckName::Cooldown));
        assert_eq!(a.recommended_action, RecommendedAction::Defer);
    }

    #[test]
    fn nothing_eligible_means_skip() {
        let g = group();
        let mut n = node("web-a", "i-1", 0);
        n.offering_id = "large".into();
        let nodes = vec![n];
        let s = signals(&nodes);
        let a = analyze(&g, &nodes, &s, &opportunity());
        assert!(a.candidates.is_empty());
        assert!(!a.safe_to_rebalance);
        assert_eq!(a.recommended_action, RecommendedAction::Skip);
    }

    #[test]
    fn expired_opportunity_is_skipped() {
        let g = group();
        let nodes = vec![node("web-a", "i-1", 0)];
        let s = signals(&nodes);
        let mut opp = opportunity();
        opp.expires_at = Some(NOW - 1);
        let a = analyze(&g, &nodes, &s, &opp);
        assert!(!a.safe_to_rebalance);
        assert_eq!(a.recommended_action, RecommendedAction::Skip);
    }
}
