//! Resumable execution of a rebalance plan.
//!
//! [`RebalanceExecutor::step`] advances an [`ExecutionState`] as far as it
//! can without waiting and checkpoints it after every replacement. Each
//! replacement walks
//!
//! ```text
//! Pending → Provisioning → Provisioned → Cordoned → Draining → Drained
//!         → Verified → Terminating → Done
//! ```
//!
//! and any drain or workload-health failure may divert the whole batch to
//! `RollingBack → RolledBack`. Every external call is idempotent, so
//! repeating the last step after a crash is harmless.

use std::sync::Arc;
use std::time::Duration;

use fleet_lifecycle::{NodeLifecycle, NodeProgress};
use fleet_provider::{DrainOptions, DrainStatus, ProviderError, WorkloadHealth};
use fleet_safety::{
    BatchVerdict, SafetyContext, SafetySignals, check_cluster_health, collect_signals,
    evaluate_batch,
};
use fleet_state::{
    BatchStatus, ConditionKind, Event, EventReason, ExecutionState, ExecutionStatus, ManagedNode,
    NodeGroup, NodeGroupSpec, NodeOwner, NodePhase, RebalancePlan, RebalanceStrategy,
    Replacement, ReplacementStep, RollbackAction, StateError, effective_bounds,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{ExecutorError, ExecutorResult};

/// Upper bound on sub-steps one replacement takes in a single pass.
const MAX_STEPS_PER_PASS: usize = 12;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Requeue delay while waiting on remote progress.
    pub poll_interval_secs: u64,
    /// Provisioning attempts per offering before giving up on it.
    pub max_offering_attempts: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            max_offering_attempts: 3,
        }
    }
}

/// Snapshot returned by every executor call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebalanceResult {
    pub plan_id: String,
    pub status: ExecutionStatus,
    pub completed_nodes: Vec<String>,
    pub failed_nodes: Vec<String>,
    pub requeue_after_secs: Option<u64>,
}

/// Deterministic node name for one provisioning attempt, so a restarted
/// executor re-issues the same idempotency token.
pub fn replacement_name(plan_id: &str, batch: u32, slot: usize, attempt: u32) -> String {
    format!("{plan_id}-{batch}-{slot}-{attempt}")
}

/// What advancing a single replacement asks of its batch.
#[derive(Debug)]
enum Advance {
    Wait(u64),
    Settled,
    /// Drain or verification failed; roll the whole batch back.
    RollbackBatch(String),
}

/// Side effects of one pass, folded into the execution state afterwards.
#[derive(Debug, Default)]
struct PassEffects {
    provisioned: Vec<String>,
    completed: Vec<String>,
    failed: Vec<String>,
    errors: Vec<String>,
}

/// Observations shared by every replacement in a pass.
struct Pass<'a> {
    spec: &'a NodeGroupSpec,
    plan: &'a RebalancePlan,
    signals: &'a SafetySignals,
    /// Every new node of every live batch is Ready.
    replacements_ready: bool,
    /// Replacements currently provisioning, across batches.
    provisioning: u32,
    /// Old nodes cordoned and not yet handed over, across batches.
    disrupted: u32,
    now: u64,
}

pub struct RebalanceExecutor {
    lifecycle: Arc<NodeLifecycle>,
    config: ExecutorConfig,
}

impl RebalanceExecutor {
    pub fn new(lifecycle: Arc<NodeLifecycle>, config: ExecutorConfig) -> Self {
        Self { lifecycle, config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Persist `plan`, create its execution checkpoint and mark the group
    /// as rebalancing. Fails with [`StateError::ExecutionActive`] when the
    /// group already runs a plan.
    pub fn start(
        &self,
        group: &mut NodeGroup,
        plan: &mut RebalancePlan,
        now: u64,
    ) -> ExecutorResult<ExecutionState> {
        let store = self.lifecycle.store();
        if let Some(active) = store.active_execution(group.name())? {
            return Err(StateError::ExecutionActive {
                group: group.name().to_string(),
                plan_id: active.plan_id,
            }
            .into());
        }

        store.create_plan(plan)?;
        let mut exec = ExecutionState::new(plan);
        exec.status = ExecutionStatus::Running;
        exec.started_at = Some(now);
        store.start_execution(&mut exec)?;

        group.status.active_plan = Some(plan.id.clone());
        store.update_group(group)?;

        let nodes: usize = plan.batches.iter().map(|b| b.nodes.len()).sum();
        store.emit(Event::new(
            group.object_ref(),
            EventReason::RebalanceStarted,
            format!(
                "plan {} replaces {nodes} nodes with {} in {} {:?} batches",
                plan.id,
                plan.opportunity.target_offering_id,
                plan.batches.len(),
                plan.strategy
            ),
            now,
        ));
        Ok(exec)
    }

    /// Load the plan and its checkpoint, then run one [`step`](Self::step).
    pub async fn execute(
        &self,
        group: &mut NodeGroup,
        plan_id: &str,
        now: u64,
    ) -> ExecutorResult<RebalanceResult> {
        let store = self.lifecycle.store();
        let plan = store
            .get_plan(plan_id)?
            .ok_or_else(|| ExecutorError::PlanNotFound(plan_id.to_string()))?;
        let mut exec = store
            .get_execution(plan_id)?
            .ok_or_else(|| ExecutorError::ExecutionNotFound(plan_id.to_string()))?;
        self.step(group, &plan, &mut exec, now).await
    }

    /// Advance `exec` without blocking. A terminal execution is returned
    /// untouched.
    pub async fn step(
        &self,
        group: &mut NodeGroup,
        plan: &RebalancePlan,
        exec: &mut ExecutionState,
        now: u64,
    ) -> ExecutorResult<RebalanceResult> {
        if exec.status.is_terminal() {
            return Ok(self.result(exec, None));
        }
        let poll = self.config.poll_interval_secs;

        if group.is_paused() {
            self.pause(group, exec, "group paused by annotation", now)?;
            return Ok(self.result(exec, Some(poll)));
        }

        let store = self.lifecycle.store();
        let nodes = store.list_nodes(&plan.group)?;
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
                warn!(plan = %plan.id, error = %e, "could not observe safety signals");
                return Ok(self.result(exec, Some(poll)));
            }
        };

        let cluster = check_cluster_health(&signals);
        if !cluster.passed {
            self.pause(group, exec, &cluster.reason, now)?;
            return Ok(self.result(exec, Some(poll)));
        }
        if exec.status != ExecutionStatus::Running {
            info!(plan = %plan.id, "rebalance running");
            exec.status = ExecutionStatus::Running;
            exec.paused_reason = None;
        }

        self.skip_unreachable(plan, exec);
        if let Some(reason) = self.start_batches(group, plan, exec, &nodes, &signals, now) {
            self.pause(group, exec, &reason, now)?;
            return Ok(self.result(exec, Some(poll)));
        }

        let mut pass = Pass {
            spec: &group.spec,
            plan,
            signals: &signals,
            replacements_ready: replacements_ready(exec),
            provisioning: exec
                .batches
                .iter()
                .flat_map(|b| &b.replacements)
                .filter(|r| r.step == ReplacementStep::Provisioning)
                .count() as u32,
            disrupted: disrupted(exec),
            now,
        };
        let mut requeue: Option<u64> = None;
        let mut merge = |secs: u64| requeue = Some(requeue.map_or(secs, |r: u64| r.min(secs)));

        for bi in 0..exec.batches.len() {
            if exec.batches[bi].status != BatchStatus::Running {
                continue;
            }
            let mut fx = PassEffects::default();
            let wait = self.advance_batch(&mut pass, exec, bi, &mut fx).await?;
            apply_effects(exec, bi, fx, now);
            settle_batch(exec, bi, now);
            self.checkpoint(exec)?;
            if let Some(secs) = wait {
                merge(secs);
            }
        }

        self.abort_if_failing(plan, exec, now);
        if self.finish_if_done(group, plan, exec, now)? {
            return Ok(self.result(exec, None));
        }
        if exec.batches.iter().any(|b| b.blocked_reason.is_some()) {
            merge(poll);
        }
        self.checkpoint(exec)?;
        Ok(self.result(exec, Some(requeue.unwrap_or(poll))))
    }

    // ── Batches ────────────────────────────────────────────────────

    /// Mark pending batches whose dependencies ended without success.
    fn skip_unreachable(&self, plan: &RebalancePlan, exec: &mut ExecutionState) {
        loop {
            let mut changed = false;
            for bi in 0..exec.batches.len() {
                if exec.batches[bi].status != BatchStatus::Pending {
                    continue;
                }
                let number = exec.batches[bi].number;
                let Some(batch) = plan.batch(number) else { continue };
                let broken = batch.depends_on.iter().any(|dep| {
                    exec.batch(*dep)
                        .is_some_and(|b| b.status.is_terminal() && b.status != BatchStatus::Succeeded)
                });
                if broken {
                    info!(plan = %plan.id, batch = number, "dependency did not succeed, skipping batch");
                    exec.batches[bi].status = BatchStatus::Skipped;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Gate and start every batch whose turn has come. Returns a reason
    /// when a cluster-wide check requires pausing the plan.
    fn start_batches(
        &self,
        group: &mut NodeGroup,
        plan: &RebalancePlan,
        exec: &mut ExecutionState,
        nodes: &[ManagedNode],
        signals: &SafetySignals,
        now: u64,
    ) -> Option<String> {
        let store = self.lifecycle.store();
        let min_nodes = effective_bounds(&group.spec).min_nodes;
        let mut running = exec
            .batches
            .iter()
            .filter(|b| b.status == BatchStatus::Running)
            .count() as u32;
        let mut blocked = Vec::new();

        for bi in 0..exec.batches.len() {
            if exec.batches[bi].status != BatchStatus::Pending {
                continue;
            }
            let number = exec.batches[bi].number;
            let Some(batch) = plan.batch(number) else { continue };
            let deps_done = batch.depends_on.iter().all(|dep| {
                exec.batch(*dep)
                    .is_some_and(|b| b.status == BatchStatus::Succeeded)
            });
            if !deps_done {
                continue;
            }
            if plan.strategy == RebalanceStrategy::Rolling && running >= plan.max_concurrent {
                break;
            }

            let olds: Vec<&ManagedNode> = batch
                .nodes
                .iter()
                .filter_map(|c| nodes.iter().find(|n| n.name == c.node_name))
                .collect();
            let mut exclude = exec.involved_nodes();
            exclude.extend(nodes.iter().filter(|n| owned_by(n, &plan.id)).map(|n| n.name.clone()));
            let ctx = SafetyContext {
                group: &*group,
                min_nodes,
                nodes,
                signals,
                exclude: &exclude,
                now,
            };
            let needed = batch.nodes.len() as u32;
            match evaluate_batch(&ctx, &olds, &plan.opportunity.target_offering_id, needed) {
                BatchVerdict::Proceed => {
                    let progress = &mut exec.batches[bi];
                    progress.status = BatchStatus::Running;
                    progress.started_at = Some(now);
                    progress.blocked_reason = None;
                    exec.current_batch = exec.current_batch.max(number);
                    running += 1;
                    info!(plan = %plan.id, batch = number, nodes = needed, "batch started");
                }
                BatchVerdict::BlockBatch { reason } => {
                    let progress = &mut exec.batches[bi];
                    if progress.blocked_reason.as_deref() != Some(reason.as_str()) {
                        store.emit(Event::new(
                            group.object_ref(),
                            EventReason::SafetyCheckFailed,
                            format!("plan {} batch {number} blocked: {reason}", plan.id),
                            now,
                        ));
                    }
                    progress.blocked_reason = Some(reason.clone());
                    blocked.push(reason);
                }
                BatchVerdict::PausePlan { reason } => return Some(reason),
            }
        }

        let changed = match blocked.first() {
            Some(reason) => group.status.set_condition(
                ConditionKind::RebalanceBlocked,
                true,
                "SafetyCheckFailed",
                reason,
                now,
            ),
            None => group
                .status
                .set_condition(ConditionKind::RebalanceBlocked, false, "Clear", "", now),
        };
        if changed && let Err(e) = store.update_group(group) {
            warn!(group = %group.name(), error = %e, "could not persist rebalance condition");
        }
        None
    }

    async fn advance_batch(
        &self,
        pass: &mut Pass<'_>,
        exec: &mut ExecutionState,
        bi: usize,
        fx: &mut PassEffects,
    ) -> ExecutorResult<Option<u64>> {
        let number = exec.batches[bi].number;
        let mut wait: Option<u64> = None;
        let mut rollback: Option<String> = None;

        for slot in 0..exec.batches[bi].replacements.len() {
            let r = &mut exec.batches[bi].replacements[slot];
            match self.advance(pass, number, slot, r, fx).await? {
                Advance::Wait(secs) => wait = Some(wait.map_or(secs, |w| w.min(secs))),
                Advance::Settled => {}
                Advance::RollbackBatch(reason) => {
                    rollback = Some(reason);
                    break;
                }
            }
        }

        if let Some(reason) = rollback {
            fx.errors.push(reason.clone());
            self.roll_back_batch(pass, exec, bi, &reason, fx).await;
        }
        Ok(wait)
    }

    /// Batches that ended badly reach `max_concurrent`: the plan is failed
    /// and no new batch starts. Running batches finish their own rollback
    /// or hand-over.
    fn abort_if_failing(&self, plan: &RebalancePlan, exec: &mut ExecutionState, now: u64) {
        let failing = exec
            .batches
            .iter()
            .filter(|b| matches!(b.status, BatchStatus::Failed | BatchStatus::RolledBack))
            .count() as u32;
        if failing < plan.max_concurrent {
            return;
        }
        if !exec.aborted {
            warn!(plan = %plan.id, failing, "failed batches reached max_concurrent, aborting plan");
            exec.aborted = true;
            exec.record_error(
                now,
                None,
                format!("{failing} batches failed (max_concurrent {})", plan.max_concurrent),
            );
        }
        for batch in exec
            .batches
            .iter_mut()
            .filter(|b| b.status == BatchStatus::Pending)
        {
            warn!(plan = %plan.id, batch = batch.number, failing, "too many failed batches, skipping");
            batch.status = BatchStatus::Skipped;
        }
    }

    /// Close the execution once every batch is terminal.
    fn finish_if_done(
        &self,
        group: &mut NodeGroup,
        plan: &RebalancePlan,
        exec: &mut ExecutionState,
        now: u64,
    ) -> ExecutorResult<bool> {
        if !exec.batches.iter().all(|b| b.status.is_terminal()) {
            return Ok(false);
        }
        let status = if exec.batches.iter().all(|b| b.status == BatchStatus::Succeeded) {
            ExecutionStatus::Succeeded
        } else if exec.aborted || exec.batches.iter().any(|b| b.status == BatchStatus::Failed) {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::RolledBack
        };
        exec.status = status;
        exec.completed_at = Some(now);
        exec.paused_reason = None;
        self.checkpoint(exec)?;

        let store = self.lifecycle.store();
        group.status.last_rebalance_time = now;
        group.status.active_plan = None;
        group
            .status
            .set_condition(ConditionKind::RebalanceBlocked, false, "Clear", "", now);
        store.update_group(group)?;

        let summary = format!(
            "plan {} {:?}: {} replaced, {} failed",
            plan.id,
            status,
            exec.completed_nodes.len(),
            exec.failed_nodes.len()
        );
        let reason = if status == ExecutionStatus::Succeeded {
            EventReason::RebalanceCompleted
        } else {
            EventReason::RebalanceFailed
        };
        store.emit(Event::new(group.object_ref(), reason, summary, now));
        Ok(true)
    }

    fn pause(
        &self,
        group: &mut NodeGroup,
        exec: &mut ExecutionState,
        reason: &str,
        now: u64,
    ) -> ExecutorResult<()> {
        if exec.status == ExecutionStatus::Paused && exec.paused_reason.as_deref() == Some(reason) {
            return Ok(());
        }
        warn!(plan = %exec.plan_id, %reason, "rebalance paused");
        exec.status = ExecutionStatus::Paused;
        exec.paused_reason = Some(reason.to_string());
        self.checkpoint(exec)?;

        let store = self.lifecycle.store();
        store.emit(Event::new(
            group.object_ref(),
            EventReason::SafetyCheckFailed,
            format!("plan {} paused: {reason}", exec.plan_id),
            now,
        ));
        if group
            .status
            .set_condition(ConditionKind::RebalanceBlocked, true, "Paused", reason, now)
        {
            store.update_group(group)?;
        }
        Ok(())
    }

    // ── Replacements ───────────────────────────────────────────────

    async fn advance(
        &self,
        pass: &mut Pass<'_>,
        batch: u32,
        slot: usize,
        r: &mut Replacement,
        fx: &mut PassEffects,
    ) -> ExecutorResult<Advance> {
        let store = self.lifecycle.store();
        let cluster = self.lifecycle.cluster();
        let spec: &NodeGroupSpec = pass.spec;
        let policy = &spec.rebalancing;
        let group = spec.name.as_str();
        let poll = self.config.poll_interval_secs;
        let now = pass.now;

        for _ in 0..MAX_STEPS_PER_PASS {
            match r.step {
                ReplacementStep::Pending => {
                    if r.retry_at > now {
                        return Ok(Advance::Wait(r.retry_at - now));
                    }
                    if pass.plan.strategy == RebalanceStrategy::Surge
                        && pass.provisioning >= pass.plan.max_concurrent
                    {
                        return Ok(Advance::Wait(poll));
                    }
                    let name = replacement_name(&pass.plan.id, batch, slot, r.attempts + 1);
                    let owner = NodeOwner::Rebalance {
                        plan_id: pass.plan.id.clone(),
                        batch,
                    };
                    let mut node = ManagedNode::pending(&name, group, &r.offering_id, owner, now);
                    if let Some(offering) = pass.signals.offering(&r.offering_id) {
                        node.resources = offering.resources.clone();
                    }
                    match store.create_node(&mut node) {
                        Ok(()) | Err(StateError::AlreadyExists(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                    info!(
                        plan = %pass.plan.id,
                        old = %r.old_node,
                        new = %name,
                        offering = %r.offering_id,
                        "provisioning replacement"
                    );
                    r.new_node = Some(name);
                    r.attempts += 1;
                    r.offering_attempts += 1;
                    r.step = ReplacementStep::Provisioning;
                    r.step_started_at = now;
                    pass.provisioning += 1;
                }

                ReplacementStep::Provisioning => {
                    let Some(name) = r.new_node.clone() else {
                        r.step = ReplacementStep::Pending;
                        continue;
                    };
                    let Some(mut node) = store.get_node(group, &name)? else {
                        return self.retry_provisioning(pass, r, None, "replacement record vanished", fx);
                    };
                    if !matches!(node.phase, NodePhase::Ready | NodePhase::Failed) {
                        if let Err(e) = self.lifecycle.reconcile_node(spec, &mut node, now).await {
                            warn!(node = %name, error = %e, "replacement reconcile failed");
                            return Ok(Advance::Wait(poll));
                        }
                    }
                    match node.phase {
                        NodePhase::Ready => {
                            info!(plan = %pass.plan.id, new = %name, "replacement Ready");
                            fx.provisioned.push(name);
                            pass.provisioning = pass.provisioning.saturating_sub(1);
                            r.step = ReplacementStep::Provisioned;
                            r.step_started_at = now;
                        }
                        NodePhase::Failed => {
                            let why = node
                                .last_error
                                .clone()
                                .unwrap_or_else(|| "replacement failed".to_string());
                            return self.retry_provisioning(pass, r, Some(node), &why, fx);
                        }
                        _ if now >= r.step_started_at + policy.provision_timeout_secs => {
                            let why = format!(
                                "replacement not Ready within {}s",
                                policy.provision_timeout_secs
                            );
                            return self.retry_provisioning(pass, r, Some(node), &why, fx);
                        }
                        _ => return Ok(Advance::Wait(poll)),
                    }
                }

                ReplacementStep::Provisioned => {
                    if pass.plan.strategy != RebalanceStrategy::Rolling && !pass.replacements_ready {
                        return Ok(Advance::Wait(poll));
                    }
                    if pass.plan.strategy != RebalanceStrategy::BlueGreen
                        && pass.disrupted >= pass.plan.max_disrupted.max(1)
                    {
                        debug!(old = %r.old_node, disrupted = pass.disrupted, "disruption headroom used, waiting");
                        return Ok(Advance::Wait(poll));
                    }
                    let Some(mut old) = store.get_node(group, &r.old_node)? else {
                        warn!(old = %r.old_node, "old node already gone");
                        r.step = ReplacementStep::Terminating;
                        continue;
                    };
                    if !old.cordoned {
                        if let Err(e) = cluster.cordon_node(old.kube_name()).await {
                            return Ok(self.call_failed(r, "cordon", e, poll));
                        }
                        old.cordoned = true;
                        store.update_node(&mut old)?;
                    }
                    debug!(old = %r.old_node, "old node cordoned");
                    pass.disrupted += 1;
                    r.step = ReplacementStep::Cordoned;
                    r.step_started_at = now;
                }

                ReplacementStep::Cordoned => {
                    r.step = ReplacementStep::Draining;
                    r.step_started_at = now;
                }

                ReplacementStep::Draining => {
                    let Some(mut old) = store.get_node(group, &r.old_node)? else {
                        r.step = ReplacementStep::Terminating;
                        continue;
                    };
                    let options = DrainOptions {
                        respect_pdbs: policy.respect_pdbs,
                        force: r.force_drain_issued,
                        timeout: Duration::from_secs(policy.drain_timeout_secs),
                    };
                    let status = match cluster.drain_node(old.kube_name(), options).await {
                        Ok(s) => s,
                        Err(e) => return Ok(self.call_failed(r, "drain", e, poll)),
                    };
                    if status == DrainStatus::Complete {
                        old.drained = true;
                        store.update_node(&mut old)?;
                        info!(old = %r.old_node, "old node drained");
                        r.step = ReplacementStep::Drained;
                        r.step_started_at = now;
                        continue;
                    }
                    if now < r.step_started_at + policy.drain_timeout_secs {
                        debug!(old = %r.old_node, ?status, "drain in progress");
                        return Ok(Advance::Wait(poll));
                    }
                    if policy.force_drain && !r.force_drain_issued {
                        store.emit(Event::new(
                            old.object_ref(),
                            EventReason::DrainFailed,
                            format!(
                                "drain did not complete within {}s, forcing eviction",
                                policy.drain_timeout_secs
                            ),
                            now,
                        ));
                        r.force_drain_issued = true;
                        continue;
                    }
                    let why = format!(
                        "drain of {} did not complete within {}s ({status:?})",
                        r.old_node, policy.drain_timeout_secs
                    );
                    store.emit(Event::new(old.object_ref(), EventReason::DrainFailed, why.clone(), now));
                    return Ok(self.replacement_failed(policy.rollback_on_failure, r, why, fx));
                }

                ReplacementStep::Drained => {
                    let new = match &r.new_node {
                        Some(name) => store.get_node(group, name)?,
                        None => None,
                    };
                    let Some(new) = new else {
                        let why = format!("replacement for {} vanished before verification", r.old_node);
                        return Ok(self.replacement_failed(true, r, why, fx));
                    };
                    let health = match cluster.workload_health(new.kube_name()).await {
                        Ok(h) => h,
                        Err(e) => return Ok(self.call_failed(r, "workload health", e, poll)),
                    };
                    match health {
                        WorkloadHealth::Healthy => {
                            debug!(new = %new.name, "workloads healthy on replacement");
                            r.step = ReplacementStep::Verified;
                            r.step_started_at = now;
                        }
                        WorkloadHealth::Pending { not_ready }
                            if now < r.step_started_at + policy.health_check_timeout_secs =>
                        {
                            debug!(new = %new.name, not_ready, "waiting for workloads");
                            return Ok(Advance::Wait(poll));
                        }
                        WorkloadHealth::Pending { not_ready } => {
                            let why = format!(
                                "{not_ready} workloads on {} not ready within {}s",
                                new.name, policy.health_check_timeout_secs
                            );
                            return Ok(self.replacement_failed(true, r, why, fx));
                        }
                        WorkloadHealth::Unhealthy { reason } => {
                            let why = format!("workloads unhealthy on {}: {reason}", new.name);
                            return Ok(self.replacement_failed(true, r, why, fx));
                        }
                    }
                }

                ReplacementStep::Verified => {
                    // The scaling count must not dip while the old node drains away.
                    self.hand_over(group, r)?;
                    if let Some(mut old) = store.get_node(group, &r.old_node)? {
                        let reason = format!(
                            "replaced by {} (plan {})",
                            r.new_node.as_deref().unwrap_or("-"),
                            pass.plan.id
                        );
                        self.lifecycle.request_termination(&mut old, &reason, now)?;
                    }
                    r.step = ReplacementStep::Terminating;
                    r.step_started_at = now;
                }

                ReplacementStep::Terminating => {
                    let Some(mut old) = store.get_node(group, &r.old_node)? else {
                        self.hand_over(group, r)?;
                        info!(plan = %pass.plan.id, old = %r.old_node, "replacement complete");
                        fx.completed.push(r.old_node.clone());
                        r.step = ReplacementStep::Done;
                        return Ok(Advance::Settled);
                    };
                    if !matches!(old.phase, NodePhase::Terminating | NodePhase::Deleting) {
                        self.lifecycle.request_termination(&mut old, "replaced", now)?;
                    }
                    match self.lifecycle.reconcile_node(spec, &mut old, now).await {
                        Ok(NodeProgress::Removed) => continue,
                        Ok(progress) => return Ok(Advance::Wait(progress.requeue_after().unwrap_or(poll))),
                        Err(e) => {
                            warn!(old = %r.old_node, error = %e, "old node teardown failed");
                            return Ok(Advance::Wait(poll));
                        }
                    }
                }

                ReplacementStep::Done
                | ReplacementStep::RolledBack
                | ReplacementStep::Failed
                | ReplacementStep::RollingBack => return Ok(Advance::Settled),
            }
        }
        Ok(Advance::Wait(poll))
    }

    /// A failed provisioning attempt: release the new node, then retry the
    /// same offering with backoff, move to the next acceptable offering, or
    /// give up on this replacement. The old node is untouched, so nothing
    /// is rolled back.
    fn retry_provisioning(
        &self,
        pass: &mut Pass<'_>,
        r: &mut Replacement,
        node: Option<ManagedNode>,
        why: &str,
        fx: &mut PassEffects,
    ) -> ExecutorResult<Advance> {
        let now = pass.now;
        if let Some(mut node) = node
            && !matches!(node.phase, NodePhase::Terminating | NodePhase::Deleting)
        {
            self.lifecycle
                .request_termination(&mut node, "replacement provisioning failed", now)?;
        }
        pass.provisioning = pass.provisioning.saturating_sub(1);
        r.new_node = None;
        warn!(
            plan = %pass.plan.id,
            old = %r.old_node,
            offering = %r.offering_id,
            attempt = r.offering_attempts,
            %why,
            "replacement provisioning failed"
        );

        if r.offering_attempts < self.config.max_offering_attempts {
            let delay = self.lifecycle.config().backoff.delay(r.offering_attempts);
            r.retry_at = now + delay;
            r.step = ReplacementStep::Pending;
            return Ok(Advance::Wait(delay.max(1)));
        }

        let spec = pass.spec;
        if spec.rebalancing.allow_mixed_instances
            && let Some(next) = next_offering(&spec.offering_ids, &r.offering_id, &r.old_offering_id)
        {
            info!(old = %r.old_node, from = %r.offering_id, to = %next, "falling back to another offering");
            r.offering_id = next;
            r.offering_attempts = 0;
            r.retry_at = now;
            r.step = ReplacementStep::Pending;
            return Ok(Advance::Wait(1));
        }

        let message = format!(
            "replacement for {} failed after {} attempts: {why}",
            r.old_node, r.attempts
        );
        self.lifecycle.store().emit(Event::new(
            format!("node/{}", r.old_node),
            EventReason::ProvisioningFailed,
            message.clone(),
            now,
        ));
        r.step = ReplacementStep::Failed;
        fx.failed.push(r.old_node.clone());
        fx.errors.push(message);
        Ok(Advance::Settled)
    }

    /// A transient collaborator error waits; anything else fails the
    /// replacement and rolls its batch back.
    fn call_failed(&self, r: &Replacement, what: &str, error: ProviderError, poll: u64) -> Advance {
        if error.is_retryable() {
            warn!(old = %r.old_node, what, error = %error, "call failed, retrying");
            return Advance::Wait(poll);
        }
        Advance::RollbackBatch(format!("{what} of {} failed: {error}", r.old_node))
    }

    fn replacement_failed(
        &self,
        rollback: bool,
        r: &mut Replacement,
        why: String,
        fx: &mut PassEffects,
    ) -> Advance {
        if rollback {
            return Advance::RollbackBatch(why);
        }
        warn!(old = %r.old_node, %why, "replacement failed, rollback disabled");
        r.step = ReplacementStep::Failed;
        fx.failed.push(r.old_node.clone());
        fx.errors.push(why);
        Advance::Settled
    }

    /// A finished replacement joins the scaling engine's node pool.
    fn hand_over(&self, group: &str, r: &Replacement) -> ExecutorResult<()> {
        let store = self.lifecycle.store();
        let Some(name) = &r.new_node else { return Ok(()) };
        if let Some(mut node) = store.get_node(group, name)?
            && node.owner != NodeOwner::Scaling
        {
            node.owner = NodeOwner::Scaling;
            store.update_node(&mut node)?;
        }
        Ok(())
    }

    // ── Rollback ───────────────────────────────────────────────────

    async fn roll_back_batch(
        &self,
        pass: &Pass<'_>,
        exec: &mut ExecutionState,
        bi: usize,
        reason: &str,
        fx: &mut PassEffects,
    ) {
        let number = exec.batches[bi].number;
        warn!(plan = %pass.plan.id, batch = number, %reason, "rolling back batch");
        for r in exec.batches[bi].replacements.iter_mut() {
            if !matches!(r.step, ReplacementStep::RolledBack | ReplacementStep::Failed) {
                r.step = ReplacementStep::RollingBack;
                r.step_started_at = pass.now;
            }
        }
        // Checkpointed as RollingBack before touching anything.
        if let Err(e) = self.checkpoint(exec) {
            warn!(plan = %pass.plan.id, error = %e, "could not checkpoint rollback");
        }

        for r in exec.batches[bi].replacements.iter_mut() {
            if r.step != ReplacementStep::RollingBack {
                continue;
            }
            match self.roll_back(pass, number, r).await {
                Ok(()) => {
                    info!(plan = %pass.plan.id, old = %r.old_node, "replacement rolled back");
                    r.step = ReplacementStep::RolledBack;
                }
                Err(e) => {
                    let message = format!("rollback of {} failed: {e}", r.old_node);
                    error!(plan = %pass.plan.id, batch = number, %message, "rollback failed");
                    self.lifecycle.store().emit(Event::new(
                        format!("plan/{}", pass.plan.id),
                        EventReason::RollbackFailed,
                        message.clone(),
                        pass.now,
                    ));
                    r.step = ReplacementStep::Failed;
                    fx.failed.push(r.old_node.clone());
                    fx.errors.push(message);
                }
            }
        }
    }

    /// Apply the batch's recorded inverse actions that match the live
    /// state of one replacement's nodes.
    async fn roll_back(&self, pass: &Pass<'_>, batch: u32, r: &Replacement) -> ExecutorResult<()> {
        let store = self.lifecycle.store();
        let group = pass.spec.name.as_str();
        let now = pass.now;
        let actions = pass
            .plan
            .rollback
            .for_batch(batch)
            .map(|s| s.actions.as_slice())
            .unwrap_or_default();

        for action in actions {
            match action {
                RollbackAction::Uncordon { node } if *node == r.old_node => {
                    let Some(mut old) = store.get_node(group, node)? else { continue };
                    match old.phase {
                        NodePhase::Terminating if !old.drained => {
                            self.lifecycle.rollback_termination(&mut old, now).await?;
                        }
                        NodePhase::Ready if old.cordoned || old.drained => {
                            self.lifecycle.cluster().uncordon_node(old.kube_name()).await?;
                            old.cordoned = false;
                            old.drained = false;
                            store.update_node(&mut old)?;
                        }
                        _ => {}
                    }
                }
                RollbackAction::RecreateOld { node, offering_id } if *node == r.old_node => {
                    let gone = store
                        .get_node(group, node)?
                        .is_none_or(|old| {
                            old.phase == NodePhase::Deleting
                                || (old.phase == NodePhase::Terminating && old.drained)
                        });
                    if !gone {
                        continue;
                    }
                    let name = format!("{node}-restored");
                    let mut fresh = ManagedNode::pending(&name, group, offering_id, NodeOwner::Scaling, now);
                    match store.create_node(&mut fresh) {
                        Ok(()) | Err(StateError::AlreadyExists(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                    info!(old = %node, restored = %name, "recreating terminated node");
                }
                RollbackAction::CancelReplacement { old_node } if *old_node == r.old_node => {
                    let Some(name) = &r.new_node else { continue };
                    if let Some(mut new) = store.get_node(group, name)?
                        && !matches!(new.phase, NodePhase::Terminating | NodePhase::Deleting)
                    {
                        self.lifecycle
                            .request_termination(&mut new, "rebalance rolled back", now)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn checkpoint(&self, exec: &mut ExecutionState) -> ExecutorResult<()> {
        self.lifecycle.store().update_execution(exec)?;
        Ok(())
    }

    fn result(&self, exec: &ExecutionState, requeue_after_secs: Option<u64>) -> RebalanceResult {
        RebalanceResult {
            plan_id: exec.plan_id.clone(),
            status: exec.status,
            completed_nodes: exec.completed_nodes.clone(),
            failed_nodes: exec.failed_nodes.clone(),
            requeue_after_secs,
        }
    }
}

/// Nodes this plan provisioned, including discarded attempts still being
/// torn down.
fn owned_by(node: &ManagedNode, plan_id: &str) -> bool {
    matches!(&node.owner, NodeOwner::Rebalance { plan_id: p, .. } if p == plan_id)
}

/// Every new node of every batch still in play has reached `Provisioned`.
fn replacements_ready(exec: &ExecutionState) -> bool {
    exec.batches
        .iter()
        .filter(|b| matches!(b.status, BatchStatus::Pending | BatchStatus::Running))
        .flat_map(|b| &b.replacements)
        .all(|r| !r.step.is_provisioning())
}

fn disrupted(exec: &ExecutionState) -> u32 {
    exec.batches
        .iter()
        .flat_map(|b| &b.replacements)
        .filter(|r| {
            matches!(
                r.step,
                ReplacementStep::Cordoned
                    | ReplacementStep::Draining
                    | ReplacementStep::Drained
                    | ReplacementStep::Verified
            )
        })
        .count() as u32
}

/// The next offering after `current` in preference order, never the one
/// being replaced.
fn next_offering(offering_ids: &[String], current: &str, old: &str) -> Option<String> {
    let start = offering_ids
        .iter()
        .position(|o| o == current)
        .map_or(0, |i| i + 1);
    offering_ids[start..]
        .iter()
        .find(|o| o.as_str() != old && o.as_str() != current)
        .cloned()
}

fn apply_effects(exec: &mut ExecutionState, bi: usize, fx: PassEffects, now: u64) {
    let batch = exec.batches[bi].number;
    exec.provisioned_nodes.extend(fx.provisioned);
    exec.completed_nodes.extend(fx.completed);
    exec.failed_nodes.extend(fx.failed);
    for message in fx.errors {
        exec.record_error(now, Some(batch), message);
    }
}

/// Close a running batch once all of its replacements are terminal.
fn settle_batch(exec: &mut ExecutionState, bi: usize, now: u64) {
    let batch = &mut exec.batches[bi];
    let terminal = |s: ReplacementStep| {
        matches!(
            s,
            ReplacementStep::Done | ReplacementStep::RolledBack | ReplacementStep::Failed
        )
    };
    if batch.status != BatchStatus::Running || !batch.replacements.iter().all(|r| terminal(r.step)) {
        return;
    }
    batch.status = if batch.replacements.iter().all(|r| r.step == ReplacementStep::Done) {
        BatchStatus::Succeeded
    } else if batch.replacements.iter().any(|r| r.step == ReplacementStep::Failed) {
        BatchStatus::Failed
    } else {
        BatchStatus::RolledBack
    };
    batch.finished_at = Some(now);
    info!(plan = %exec.plan_id, batch = batch.number, status = ?batch.status, "batch finished");
}
