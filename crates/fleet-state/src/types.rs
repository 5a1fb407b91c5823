//! Domain types for the fleet state store.
//!
//! These types represent the persisted state of node groups, managed nodes,
//! rebalance opportunities, plans, and execution checkpoints. All types are
//! serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Annotation that suspends scaling and rebalance execution for a group.
pub const ANNOTATION_PAUSED: &str = "fleet.io/paused";
/// Annotation that temporarily replaces `min_nodes`.
pub const ANNOTATION_MIN_OVERRIDE: &str = "fleet.io/min-nodes-override";
/// Annotation that temporarily replaces `max_nodes`.
pub const ANNOTATION_MAX_OVERRIDE: &str = "fleet.io/max-nodes-override";
/// Node annotation that excludes a node from scale-down and rebalancing.
pub const ANNOTATION_DO_NOT_DELETE: &str = "fleet.io/do-not-delete";

/// Records stored with optimistic concurrency.
pub trait Versioned {
    fn table_key(&self) -> String;
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

macro_rules! versioned {
    ($ty:ty, |$s:ident| $key:expr) => {
        impl Versioned for $ty {
            fn table_key(&self) -> String {
                let $s = self;
                $key
            }
            fn version(&self) -> u64 {
                self.version
            }
            fn set_version(&mut self, version: u64) {
                self.version = version;
            }
        }
    };
}

/// Persisted retry bookkeeping for an operation with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RetryState {
    /// Consecutive failed attempts.
    pub attempts: u32,
    /// Unix time before which the operation must not be retried.
    pub next_attempt_at: u64,
}

// ── Node group ────────────────────────────────────────────────────

/// Declared capacity range and policy set for a pool of equivalent nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeGroupSpec {
    pub name: String,
    pub datacenter_id: String,
    pub image_id: String,
    /// Acceptable instance offerings, most preferred first.
    pub offering_ids: Vec<String>,
    pub min_nodes: u32,
    pub max_nodes: u32,
    #[serde(default)]
    pub scale_up: ScaleUpPolicy,
    #[serde(default)]
    pub scale_down: ScaleDownPolicy,
    #[serde(default)]
    pub rebalancing: RebalancePolicy,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScaleUpPolicy {
    pub enabled: bool,
    pub stabilization_window_secs: u64,
    /// Aggregated CPU percent above which the group scales up.
    pub cpu_threshold: f64,
    /// Aggregated memory percent above which the group scales up.
    pub memory_threshold: f64,
    /// Nodes added per scale-up.
    pub increment: u32,
}

impl Default for ScaleUpPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            stabilization_window_secs: 60,
            cpu_threshold: 80.0,
            memory_threshold: 80.0,
            increment: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScaleDownPolicy {
    pub enabled: bool,
    pub stabilization_window_secs: u64,
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    /// How long utilization must stay below both thresholds.
    pub unneeded_time_secs: u64,
    /// Nodes removed per scale-down.
    pub decrement: u32,
}

impl Default for ScaleDownPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            stabilization_window_secs: 300,
            cpu_threshold: 30.0,
            memory_threshold: 30.0,
            unneeded_time_secs: 600,
            decrement: 1,
        }
    }
}

/// How replacement batches are shaped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RebalanceStrategy {
    /// Batches run strictly one after another.
    #[default]
    Rolling,
    /// Provision across batches first, drain once every new node is Ready.
    Surge,
    /// One batch, drained only after a full parallel set is Ready.
    BlueGreen,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RebalancePolicy {
    pub enabled: bool,
    pub strategy: RebalanceStrategy,
    pub batch_size: u32,
    pub max_concurrent: u32,
    pub provision_timeout_secs: u64,
    pub drain_timeout_secs: u64,
    pub health_check_timeout_secs: u64,
    /// Minimum time between the end of one rebalance and the next analysis.
    pub cooldown_secs: u64,
    /// Percentage of nodes that must stay Ready throughout (0-100).
    /// Headroom is `floor(total * (100 - pct) / 100)`; with the default of
    /// 80, groups of fewer than 5 nodes have none and rolling or surge
    /// plans are refused. Lower it for small groups.
    pub min_healthy_percent: u32,
    pub respect_pdbs: bool,
    /// Force-evict remaining pods when a drain times out.
    pub force_drain: bool,
    pub rollback_on_failure: bool,
    /// Fall back to other offerings when provisioning the target fails.
    pub allow_mixed_instances: bool,
    pub skip_nodes_with_local_storage: bool,
    pub maintenance_window: Option<MaintenanceWindow>,
    pub peak_hours: Option<HourRange>,
}

impl Default for RebalancePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: RebalanceStrategy::Rolling,
            batch_size: 1,
            max_concurrent: 1,
            provision_timeout_secs: 600,
            drain_timeout_secs: 300,
            health_check_timeout_secs: 300,
            cooldown_secs: 3600,
            min_healthy_percent: 80,
            respect_pdbs: true,
            force_drain: false,
            rollback_on_failure: true,
            allow_mixed_instances: false,
            skip_nodes_with_local_storage: true,
            maintenance_window: None,
            peak_hours: None,
        }
    }
}

/// A daily UTC hour range; wraps past midnight when `start_hour > end_hour`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HourRange {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl HourRange {
    /// Whether `hour` (0-23) falls inside `[start_hour, end_hour)`.
    pub fn contains(&self, hour: u8) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Window during which disruptive operations may run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MaintenanceWindow {
    pub hours: HourRange,
    /// Allowed weekdays, 0 = Monday. Empty means every day.
    #[serde(default)]
    pub days: Vec<u8>,
}

impl MaintenanceWindow {
    /// Whether the unix time `now` falls inside the window.
    pub fn contains(&self, now: u64) -> bool {
        let (weekday, hour) = weekday_and_hour(now);
        (self.days.is_empty() || self.days.contains(&weekday)) && self.hours.contains(hour)
    }
}

/// UTC weekday (0 = Monday) and hour for a unix timestamp.
pub fn weekday_and_hour(now: u64) -> (u8, u8) {
    let days = now / 86_400;
    // 1970-01-01 was a Thursday.
    let weekday = ((days + 3) % 7) as u8;
    let hour = ((now % 86_400) / 3600) as u8;
    (weekday, hour)
}

/// Kind of condition reported on a node group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionKind {
    Ready,
    ScaleLimitReached,
    ProvisioningBlocked,
    InvalidConfiguration,
    RebalanceBlocked,
    ScaleDownBlocked,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    pub kind: ConditionKind,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub last_transition_time: u64,
}

/// Observed state of a node group, written only by the controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct NodeGroupStatus {
    pub current_nodes: u32,
    pub ready_nodes: u32,
    pub desired_nodes: u32,
    pub last_scale_up_time: u64,
    pub last_scale_down_time: u64,
    pub last_scale_time: u64,
    pub last_rebalance_time: u64,
    /// Start of the current continuous below-threshold period.
    pub below_threshold_since: Option<u64>,
    pub provisioning_retry: RetryState,
    /// Plan whose execution is in progress, if any.
    pub active_plan: Option<String>,
    pub conditions: Vec<Condition>,
}

impl NodeGroupStatus {
    /// Set a condition. Returns true if its status or reason changed.
    pub fn set_condition(
        &mut self,
        kind: ConditionKind,
        status: bool,
        reason: &str,
        message: &str,
        now: u64,
    ) -> bool {
        match self.conditions.iter_mut().find(|c| c.kind == kind) {
            Some(existing) => {
                let changed = existing.status != status || existing.reason != reason;
                if existing.status != status {
                    existing.last_transition_time = now;
                }
                existing.status = status;
                existing.reason = reason.to_string();
                existing.message = message.to_string();
                changed
            }
            None => {
                self.conditions.push(Condition {
                    kind,
                    status,
                    reason: reason.to_string(),
                    message: message.to_string(),
                    last_transition_time: now,
                });
                true
            }
        }
    }

    pub fn condition(&self, kind: ConditionKind) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    pub fn has_condition(&self, kind: ConditionKind) -> bool {
        self.condition(kind).is_some_and(|c| c.status)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeGroup {
    pub spec: NodeGroupSpec,
    #[serde(default)]
    pub status: NodeGroupStatus,
    #[serde(default)]
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl NodeGroup {
    pub fn new(spec: NodeGroupSpec, now: u64) -> Self {
        Self {
            spec,
            status: NodeGroupStatus::default(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn is_paused(&self) -> bool {
        self.spec
            .annotations
            .get(ANNOTATION_PAUSED)
            .is_some_and(|v| v == "true")
    }

    /// Event/log object reference for this group.
    pub fn object_ref(&self) -> String {
        format!("nodegroup/{}", self.spec.name)
    }
}

versioned!(NodeGroup, |g| g.spec.name.clone());

// ── Managed node ──────────────────────────────────────────────────

/// Lifecycle phase of a managed node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NodePhase {
    Pending,
    Provisioning,
    Provisioned,
    Joining,
    Ready,
    Terminating,
    Deleting,
    Failed,
}

impl NodePhase {
    /// Forward order used to enforce monotone transitions.
    fn rank(self) -> u8 {
        match self {
            NodePhase::Pending => 0,
            NodePhase::Provisioning => 1,
            NodePhase::Provisioned => 2,
            NodePhase::Joining => 3,
            NodePhase::Ready => 4,
            NodePhase::Terminating => 5,
            NodePhase::Deleting => 6,
            NodePhase::Failed => 7,
        }
    }

    /// Whether the node counts towards group capacity.
    pub fn is_live(self) -> bool {
        !matches!(
            self,
            NodePhase::Terminating | NodePhase::Deleting | NodePhase::Failed
        )
    }

    /// Whether `self -> next` is a legal forward transition.
    ///
    /// `Terminating -> Ready` (rollback) is not covered here; it has its own
    /// guarded entry point.
    pub fn can_transition_to(self, next: NodePhase) -> bool {
        match (self, next) {
            (NodePhase::Deleting, _) => false,
            (NodePhase::Failed, NodePhase::Terminating) => true,
            (NodePhase::Failed, _) => false,
            (_, NodePhase::Failed) => true,
            (_, NodePhase::Terminating) => self != NodePhase::Terminating,
            (NodePhase::Terminating, NodePhase::Deleting) => true,
            (from, to) => to.rank() == from.rank() + 1 && to.rank() <= NodePhase::Ready.rank(),
        }
    }
}

impl std::fmt::Display for NodePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Resources allocated to a node by its offering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NodeResources {
    pub cpu_millis: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub bandwidth_mbps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct NodeTimestamps {
    pub created_at: u64,
    pub create_requested_at: Option<u64>,
    pub provisioned_at: Option<u64>,
    pub join_started_at: Option<u64>,
    pub joined_at: Option<u64>,
    pub ready_at: Option<u64>,
    pub terminating_at: Option<u64>,
    pub failed_at: Option<u64>,
}

/// Engine responsible for a node's existence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeOwner {
    #[default]
    Scaling,
    Rebalance { plan_id: String, batch: u32 },
}

/// One cloud instance plus its Kubernetes node identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagedNode {
    /// Node name; also used as the instance idempotency token.
    pub name: String,
    pub group: String,
    pub instance_id: Option<String>,
    /// Name the node registered under in the cluster, once joined.
    #[serde(default)]
    pub kube_node_name: Option<String>,
    pub offering_id: String,
    pub phase: NodePhase,
    #[serde(default)]
    pub resources: NodeResources,
    #[serde(default)]
    pub timestamps: NodeTimestamps,
    pub last_error: Option<String>,
    #[serde(default)]
    pub retry: RetryState,
    #[serde(default)]
    pub owner: NodeOwner,
    #[serde(default)]
    pub cordoned: bool,
    /// Workloads were already moved off by the rebalance executor.
    #[serde(default)]
    pub drained: bool,
    #[serde(default)]
    pub has_local_storage: bool,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub version: u64,
}

impl ManagedNode {
    /// A fresh node record in `Pending`.
    pub fn pending(name: &str, group: &str, offering_id: &str, owner: NodeOwner, now: u64) -> Self {
        Self {
            name: name.to_string(),
            group: group.to_string(),
            instance_id: None,
            kube_node_name: None,
            offering_id: offering_id.to_string(),
            phase: NodePhase::Pending,
            resources: NodeResources::default(),
            timestamps: NodeTimestamps {
                created_at: now,
                ..Default::default()
            },
            last_error: None,
            retry: RetryState::default(),
            owner,
            cordoned: false,
            drained: false,
            has_local_storage: false,
            annotations: HashMap::new(),
            version: 0,
        }
    }

    pub fn is_do_not_delete(&self) -> bool {
        self.annotations
            .get(ANNOTATION_DO_NOT_DELETE)
            .is_some_and(|v| v == "true")
    }

    /// Cluster-side node name; falls back to the managed name before join.
    pub fn kube_name(&self) -> &str {
        self.kube_node_name.as_deref().unwrap_or(&self.name)
    }

    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.timestamps.created_at)
    }

    pub fn object_ref(&self) -> String {
        format!("node/{}", self.name)
    }
}

versioned!(ManagedNode, |n| format!("{}/{}", n.group, n.name));

// ── Rebalancing ───────────────────────────────────────────────────

/// A proposed instance-type substitution for nodes of one group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Opportunity {
    pub id: String,
    pub group: String,
    pub target_offering_id: String,
    /// Restrict the substitution to these nodes. Empty means any node.
    #[serde(default)]
    pub node_names: Vec<String>,
    pub estimated_savings_percent: f64,
    #[serde(default)]
    pub estimated_monthly_savings: f64,
    #[serde(default)]
    pub performance_delta_percent: f64,
    pub created_at: u64,
    #[serde(default)]
    pub expires_at: Option<u64>,
    #[serde(default)]
    pub version: u64,
}

impl Opportunity {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|t| now >= t)
    }
}

versioned!(Opportunity, |o| format!("{}/{}", o.group, o.id));

/// A node selected by the analyzer for replacement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateNode {
    pub node_name: String,
    pub instance_id: Option<String>,
    pub current_offering_id: String,
    pub target_offering_id: String,
    pub age_secs: u64,
    pub priority_score: f64,
    pub safe_to_rebalance: bool,
    pub reason: String,
}

/// A set of candidates replaced together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeBatch {
    /// 1-based batch number.
    pub number: u32,
    pub nodes: Vec<CandidateNode>,
    /// Batches that must succeed before this one starts.
    pub depends_on: Vec<u32>,
}

/// Inverse operation for part of a batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RollbackAction {
    /// Allow scheduling again on an old node that was not yet terminated.
    Uncordon { node: String },
    /// Terminate the replacement provisioned for `old_node`.
    CancelReplacement { old_node: String },
    /// Best-effort: recreate an old node that was already terminated.
    RecreateOld { node: String, offering_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollbackStep {
    pub batch: u32,
    pub actions: Vec<RollbackAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RollbackPlan {
    pub steps: Vec<RollbackStep>,
}

impl RollbackPlan {
    pub fn for_batch(&self, batch: u32) -> Option<&RollbackStep> {
        self.steps.iter().find(|s| s.batch == batch)
    }
}

/// Batched, reversible execution plan for one opportunity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RebalancePlan {
    pub id: String,
    pub group: String,
    pub opportunity: Opportunity,
    pub batches: Vec<NodeBatch>,
    pub strategy: RebalanceStrategy,
    pub max_concurrent: u32,
    /// Old nodes that may be out of service at once, from
    /// `min_healthy_percent` over the group size when planned.
    #[serde(default)]
    pub max_disrupted: u32,
    pub rollback: RollbackPlan,
    pub estimated_duration_secs: u64,
    pub created_at: u64,
    #[serde(default)]
    pub version: u64,
}

impl RebalancePlan {
    pub fn batch(&self, number: u32) -> Option<&NodeBatch> {
        self.batches.iter().find(|b| b.number == number)
    }

    pub fn object_ref(&self) -> String {
        format!("plan/{}", self.id)
    }
}

versioned!(RebalancePlan, |p| p.id.clone());

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Succeeded,
    Failed,
    RolledBack,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::RolledBack
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BatchStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    RolledBack,
    /// A dependency did not succeed; the batch never starts.
    Skipped,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BatchStatus::Pending | BatchStatus::Running)
    }
}

/// Exact sub-step reached by a single old → new replacement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplacementStep {
    Pending,
    Provisioning,
    Provisioned,
    Cordoned,
    Draining,
    Drained,
    Verified,
    Terminating,
    Done,
    RollingBack,
    RolledBack,
    Failed,
}

impl ReplacementStep {
    /// The old node may already be gone.
    pub fn old_node_terminated(self) -> bool {
        matches!(self, ReplacementStep::Terminating | ReplacementStep::Done)
    }

    /// The old node was cordoned and is still present.
    pub fn old_node_cordoned(self) -> bool {
        matches!(
            self,
            ReplacementStep::Cordoned
                | ReplacementStep::Draining
                | ReplacementStep::Drained
                | ReplacementStep::Verified
        )
    }

    pub fn is_provisioning(self) -> bool {
        matches!(self, ReplacementStep::Pending | ReplacementStep::Provisioning)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Replacement {
    pub old_node: String,
    pub old_offering_id: String,
    pub new_node: Option<String>,
    /// Offering used for the current provisioning attempt.
    pub offering_id: String,
    /// Total provisioning attempts so far.
    pub attempts: u32,
    /// Attempts against `offering_id`.
    pub offering_attempts: u32,
    pub retry_at: u64,
    pub step: ReplacementStep,
    pub step_started_at: u64,
    #[serde(default)]
    pub force_drain_issued: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchProgress {
    pub number: u32,
    pub status: BatchStatus,
    pub replacements: Vec<Replacement>,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    pub blocked_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionError {
    pub at: u64,
    pub batch: Option<u32>,
    pub message: String,
}

/// Persisted progress of a plan; the executor resumes from this alone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionState {
    pub plan_id: String,
    pub group: String,
    pub status: ExecutionStatus,
    /// Highest batch number started; never decreases while running.
    pub current_batch: u32,
    pub batches: Vec<BatchProgress>,
    pub completed_nodes: Vec<String>,
    pub failed_nodes: Vec<String>,
    pub provisioned_nodes: Vec<String>,
    pub errors: Vec<ExecutionError>,
    pub paused_reason: Option<String>,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    /// Set once `max_concurrent` batches have failed; the plan ends Failed.
    #[serde(default)]
    pub aborted: bool,
    #[serde(default)]
    pub version: u64,
}

impl ExecutionState {
    /// Initial checkpoint for a plan: every batch pending.
    pub fn new(plan: &RebalancePlan) -> Self {
        let batches = plan
            .batches
            .iter()
            .map(|b| BatchProgress {
                number: b.number,
                status: BatchStatus::Pending,
                replacements: b
                    .nodes
                    .iter()
                    .map(|c| Replacement {
                        old_node: c.node_name.clone(),
                        old_offering_id: c.current_offering_id.clone(),
                        new_node: None,
                        offering_id: c.target_offering_id.clone(),
                        attempts: 0,
                        offering_attempts: 0,
                        retry_at: 0,
                        step: ReplacementStep::Pending,
                        step_started_at: 0,
                        force_drain_issued: false,
                    })
                    .collect(),
                started_at: None,
                finished_at: None,
                blocked_reason: None,
            })
            .collect();

        Self {
            plan_id: plan.id.clone(),
            group: plan.group.clone(),
            status: ExecutionStatus::Pending,
            current_batch: 0,
            batches,
            completed_nodes: Vec::new(),
            failed_nodes: Vec::new(),
            provisioned_nodes: Vec::new(),
            errors: Vec::new(),
            paused_reason: None,
            started_at: None,
            completed_at: None,
            aborted: false,
            version: 0,
        }
    }

    pub fn batch(&self, number: u32) -> Option<&BatchProgress> {
        self.batches.iter().find(|b| b.number == number)
    }

    pub fn record_error(&mut self, at: u64, batch: Option<u32>, message: impl Into<String>) {
        self.errors.push(ExecutionError {
            at,
            batch,
            message: message.into(),
        });
    }

    /// Every node touched by this execution (old and new).
    pub fn involved_nodes(&self) -> Vec<String> {
        let mut out = Vec::new();
        for batch in &self.batches {
            for r in &batch.replacements {
                out.push(r.old_node.clone());
                if let Some(n) = &r.new_node {
                    out.push(n.clone());
                }
            }
        }
        out
    }
}

versioned!(ExecutionState, |e| e.plan_id.clone());

// ── Leader lease ──────────────────────────────────────────────────

/// Lease contended for by controller replicas.
pub const CONTROLLER_LEASE: &str = "fleet-controller";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub holder: String,
    pub acquired_at: u64,
    pub renewed_at: u64,
    pub ttl_secs: u64,
    #[serde(default)]
    pub version: u64,
}

impl Lease {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.renewed_at + self.ttl_secs
    }
}

versioned!(Lease, |l| l.name.clone());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_are_monotone() {
        use NodePhase::*;
        assert!(Pending.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(Provisioned));
        assert!(Provisioned.can_transition_to(Joining));
        assert!(Joining.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Terminating));
        assert!(Terminating.can_transition_to(Deleting));

        assert!(!Ready.can_transition_to(Joining));
        assert!(!Pending.can_transition_to(Ready));
        assert!(!Deleting.can_transition_to(Failed));
        assert!(!Terminating.can_transition_to(Ready));
    }

    #[test]
    fn failed_reachable_from_non_terminal_and_only_leads_to_termination() {
        use NodePhase::*;
        for p in [Pending, Provisioning, Provisioned, Joining, Ready, Terminating] {
            assert!(p.can_transition_to(Failed), "{p} -> Failed");
        }
        assert!(Failed.can_transition_to(Terminating));
        assert!(!Failed.can_transition_to(Ready));
    }

    #[test]
    fn hour_range_wraps_midnight() {
        let night = HourRange {
            start_hour: 22,
            end_hour: 4,
        };
        assert!(night.contains(23));
        assert!(night.contains(0));
        assert!(!night.contains(4));
        assert!(!night.contains(12));

        let day = HourRange {
            start_hour: 9,
            end_hour: 17,
        };
        assert!(day.contains(9));
        assert!(!day.contains(17));
    }

    #[test]
    fn weekday_from_epoch() {
        // 1970-01-01 00:00 UTC, Thursday.
        assert_eq!(weekday_and_hour(0), (3, 0));
        // 1970-01-05 13:00 UTC, Monday.
        assert_eq!(weekday_and_hour(4 * 86_400 + 13 * 3600), (0, 13));
    }

    #[test]
    fn maintenance_window_respects_days() {
        let window = MaintenanceWindow {
            hours: HourRange {
                start_hour: 1,
                end_hour: 5,
            },
            days: vec![5, 6],
        };
        // Saturday 1970-01-03 02:00.
        assert!(window.contains(2 * 86_400 + 2 * 3600));
        // Thursday 1970-01-01 02:00.
        assert!(!window.contains(2 * 3600));
    }

    #[test]
    fn set_condition_reports_changes() {
        let mut status = NodeGroupStatus::default();
        assert!(status.set_condition(ConditionKind::Paused, true, "Annotated", "", 10));
        assert!(!status.set_condition(ConditionKind::Paused, true, "Annotated", "again", 20));
        assert_eq!(
            status.condition(ConditionKind::Paused).unwrap().last_transition_time,
            10
        );
        assert!(status.set_condition(ConditionKind::Paused, false, "Resumed", "", 30));
        assert!(!status.has_condition(ConditionKind::Paused));
    }

    #[test]
    fn strategy_serializes_kebab_case() {
        let json = serde_json::to_string(&RebalanceStrategy::BlueGreen).unwrap();
        assert_eq!(json, "\"blue-green\"");
    }
}
