//! One reconcile pass over a node group.
//!
//! Pass order: admission re-check, lifecycle of every node, the active
//! rebalance (if any), otherwise the oldest pending opportunity, and finally
//! the scaling decision. Each stage persists its own progress; the pass
//! returns the smallest requeue delay any stage asked for.

use std::sync::Arc;

use fleet_autoscale::{Autoscaler, ScaleError, ScaleOutcome};
use fleet_lifecycle::{LifecycleError, NodeLifecycle};
use fleet_rebalance::{
    ExecutorConfig, ExecutorError, PlanError, RebalanceAnalyzer, RebalanceExecutor, RebalancePlanner,
    RebalanceResult, RecommendedAction, ScoreWeights,
};
use fleet_safety::{SafetyContext, collect_signals};
use fleet_state::{
    ConditionKind, Event, EventReason, NodeGroup, Opportunity, StateError, StateStore,
    effective_bounds, validate_group_spec,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Condition reason for a stored spec that fails admission rules.
const INVALID_SPEC: &str = "InvalidSpec";
/// Condition reason while an opportunity waits on the safety gate.
const DEFERRED: &str = "OpportunityDeferred";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("scaling error: {0}")]
    Scale(#[from] ScaleError),

    #[error("rebalance error: {0}")]
    Executor(#[from] ExecutorError),
}

impl ReconcileError {
    /// A concurrent writer changed a record; re-read and retry soon.
    pub fn is_conflict(&self) -> bool {
        match self {
            ReconcileError::State(e) => e.is_conflict(),
            ReconcileError::Lifecycle(e) => e.is_conflict(),
            ReconcileError::Scale(ScaleError::State(e)) => e.is_conflict(),
            ReconcileError::Scale(ScaleError::Lifecycle(e)) => e.is_conflict(),
            ReconcileError::Executor(e) => executor_conflict(e),
            _ => false,
        }
    }
}

fn executor_conflict(e: &ExecutorError) -> bool {
    match e {
        ExecutorError::State(e) => e.is_conflict(),
        ExecutorError::Lifecycle(e) => e.is_conflict(),
        _ => false,
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// What a pass did, for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub requeue_after_secs: Option<u64>,
    pub rebalance: Option<RebalanceResult>,
    pub started_plan: Option<String>,
    pub discarded_opportunities: Vec<String>,
    pub scaling: Option<ScaleOutcome>,
}

impl ReconcileOutcome {
    fn requeue(&mut self, secs: Option<u64>) {
        if let Some(secs) = secs {
            self.requeue_after_secs = Some(self.requeue_after_secs.map_or(secs, |r| r.min(secs)));
        }
    }
}

pub struct Reconciler {
    lifecycle: Arc<NodeLifecycle>,
    autoscaler: Autoscaler,
    analyzer: RebalanceAnalyzer,
    planner: RebalancePlanner,
    executor: RebalanceExecutor,
    /// Re-analysis delay for a deferred opportunity.
    defer_secs: u64,
}

impl Reconciler {
    pub fn new(
        lifecycle: Arc<NodeLifecycle>,
        weights: ScoreWeights,
        executor: ExecutorConfig,
        defer_secs: u64,
    ) -> Self {
        Self {
            autoscaler: Autoscaler::new(Arc::clone(&lifecycle)),
            analyzer: RebalanceAnalyzer::new(weights),
            planner: RebalancePlanner::new(),
            executor: RebalanceExecutor::new(Arc::clone(&lifecycle), executor),
            lifecycle,
            defer_secs,
        }
    }

    pub fn store(&self) -> &StateStore {
        self.lifecycle.store()
    }

    /// Reconcile group `name`. Returns `None` when the group no longer
    /// exists.
    pub async fn reconcile(&self, name: &str, now: u64) -> ReconcileResult<Option<ReconcileOutcome>> {
        let store = self.store();
        let Some(mut group) = store.get_group(name)? else {
            debug!(group = %name, "group deleted, nothing to reconcile");
            return Ok(None);
        };
        let mut outcome = ReconcileOutcome::default();

        if !self.admit(&mut group, now)? {
            return Ok(Some(outcome));
        }

        let lifecycle_wait = self.lifecycle.reconcile_group(&group.spec, now).await?;
        outcome.requeue(lifecycle_wait);

        match store.active_execution(name)? {
            Some(exec) => match self.executor.execute(&mut group, &exec.plan_id, now).await {
                Ok(result) => {
                    debug!(group = %name, plan = %result.plan_id, status = ?result.status, "rebalance step");
                    outcome.requeue(result.requeue_after_secs);
                    outcome.rebalance = Some(result);
                }
                Err(e) if executor_conflict(&e) => {
                    debug!(group = %name, "execution changed concurrently, requeueing");
                    outcome.requeue(Some(1));
                    group = self.reload(name)?;
                }
                Err(e) => {
                    warn!(group = %name, plan = %exec.plan_id, error = %e, "rebalance step failed");
                    outcome.requeue(Some(self.executor.config().poll_interval_secs));
                    group = self.reload(name)?;
                }
            },
            None => self.process_opportunities(&mut group, now, &mut outcome).await?,
        }

        let protected = store
            .active_execution(name)?
            .map(|e| e.involved_nodes())
            .unwrap_or_default();
        let scaling = self.autoscaler.reconcile_group(&mut group, &protected, now).await?;
        outcome.requeue(scaling.requeue_after_secs);
        if !scaling.created.is_empty() || !scaling.terminated.is_empty() {
            outcome.requeue(Some(1));
        }
        outcome.scaling = Some(scaling);

        Ok(Some(outcome))
    }

    fn reload(&self, name: &str) -> ReconcileResult<NodeGroup> {
        self.store()
            .get_group(name)?
            .ok_or_else(|| StateError::NotFound(name.to_string()).into())
    }

    /// Re-check admission rules on the stored spec. An invalid group is
    /// flagged and left alone until its spec changes.
    fn admit(&self, group: &mut NodeGroup, now: u64) -> ReconcileResult<bool> {
        let store = self.store();
        match validate_group_spec(&group.spec) {
            Ok(()) => {
                let flagged = group
                    .status
                    .condition(ConditionKind::InvalidConfiguration)
                    .is_some_and(|c| c.status && c.reason == INVALID_SPEC);
                if flagged {
                    group
                        .status
                        .set_condition(ConditionKind::InvalidConfiguration, false, "Valid", "", now);
                    store.update_group(group)?;
                    info!(group = %group.name(), "spec valid again");
                }
                Ok(true)
            }
            Err(e) => {
                let msg = e.errors.join("; ");
                if group.status.set_condition(
                    ConditionKind::InvalidConfiguration,
                    true,
                    INVALID_SPEC,
                    &msg,
                    now,
                ) {
                    store.emit(Event::new(
                        group.object_ref(),
                        EventReason::InvalidConfiguration,
                        format!("not reconciling: {msg}"),
                        now,
                    ));
                    store.update_group(group)?;
                }
                Ok(false)
            }
        }
    }

    /// Consider the oldest live opportunity; expired ones are discarded on
    /// the way.
    async fn process_opportunities(
        &self,
        group: &mut NodeGroup,
        now: u64,
        outcome: &mut ReconcileOutcome,
    ) -> ReconcileResult<()> {
        let store = self.store();
        let name = group.name().to_string();
        if !group.spec.rebalancing.enabled || group.is_paused() {
            return Ok(());
        }

        let mut opportunities = store.list_opportunities(&name)?;
        opportunities.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        for opportunity in opportunities {
            if opportunity.is_expired(now) {
                info!(group = %name, opportunity = %opportunity.id, "opportunity expired, discarding");
                self.discard(&name, &opportunity, outcome)?;
                continue;
            }
            return self.consider(group, &opportunity, now, outcome).await;
        }
        Ok(())
    }

    async fn consider(
        &self,
        group: &mut NodeGroup,
        opportunity: &Opportunity,
        now: u64,
        outcome: &mut ReconcileOutcome,
    ) -> ReconcileResult<()> {
        let store = self.store();
        let name = group.name().to_string();
        let nodes = store.list_nodes(&name)?;
        let kube_names: Vec<String> = nodes
            .iter()
            .filter(|n| n.phase.is_live())
            .map(|n| n.kube_name().to_string())
            .collect();
        let signals = match collect_signals(
            self.lifecycle.cloud(),
            self.lifecycle.cluster(),
            &group.spec.datacenter_id,
            &kube_names,
        )
        .await
        {
            Ok(s) => s,
            Err(e) => {
                warn!(group = %name, opportunity = %opportunity.id, error = %e, "could not observe safety signals");
                outcome.requeue(Some(self.executor.config().poll_interval_secs));
                return Ok(());
            }
        };

        let bounds = effective_bounds(&group.spec);
        let analysis = self.analyzer.analyze(
            &SafetyContext {
                group: &*group,
                min_nodes: bounds.min_nodes,
                nodes: &nodes,
                signals: &signals,
                exclude: &[],
                now,
            },
            opportunity,
        );
        debug!(
            group = %name,
            opportunity = %opportunity.id,
            candidates = analysis.candidates.len(),
            action = ?analysis.recommended_action,
            "opportunity analyzed"
        );

        match analysis.recommended_action {
            RecommendedAction::Skip => {
                info!(group = %name, opportunity = %opportunity.id, reason = %analysis.safety.summary(), "opportunity skipped");
                self.discard(&name, opportunity, outcome)
            }
            RecommendedAction::Defer => {
                self.defer(group, opportunity, &analysis.safety.summary(), now, outcome)
            }
            RecommendedAction::Proceed => {
                match self.planner.plan(&analysis, &group.spec.rebalancing, now) {
                    Ok(mut plan) => {
                        group.status.set_condition(
                            ConditionKind::RebalanceBlocked,
                            false,
                            "PlanStarted",
                            "",
                            now,
                        );
                        self.executor.start(group, &mut plan, now)?;
                        outcome.started_plan = Some(plan.id.clone());
                        outcome.requeue(Some(1));
                        self.discard(&name, opportunity, outcome)
                    }
                    Err(e @ PlanError::NoHeadroom { .. }) => {
                        store.emit(Event::new(
                            group.object_ref(),
                            EventReason::SafetyCheckFailed,
                            format!("discarding opportunity {}: {e}", opportunity.id),
                            now,
                        ));
                        self.discard(&name, opportunity, outcome)
                    }
                    Err(e) => self.defer(group, opportunity, &e.to_string(), now, outcome),
                }
            }
        }
    }

    fn defer(
        &self,
        group: &mut NodeGroup,
        opportunity: &Opportunity,
        reason: &str,
        now: u64,
        outcome: &mut ReconcileOutcome,
    ) -> ReconcileResult<()> {
        let msg = format!("opportunity {} deferred: {reason}", opportunity.id);
        if group
            .status
            .set_condition(ConditionKind::RebalanceBlocked, true, DEFERRED, &msg, now)
        {
            self.store().emit(Event::new(
                group.object_ref(),
                EventReason::SafetyCheckFailed,
                msg,
                now,
            ));
            self.store().update_group(group)?;
        }
        outcome.requeue(Some(self.defer_secs));
        Ok(())
    }

    fn discard(
        &self,
        group: &str,
        opportunity: &Opportunity,
        outcome: &mut ReconcileOutcome,
    ) -> ReconcileResult<()> {
        self.store().delete_opportunity(group, &opportunity.id)?;
        outcome.discarded_opportunities.push(opportunity.id.clone());
        Ok(())
    }
}
