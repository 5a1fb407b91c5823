//! Rebalancing error types.

use thiserror::Error;

/// Reasons the planner refuses to produce a plan.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("group is not safe to rebalance: {0}")]
    NotSafe(String),

    #[error("no candidate node is individually safe to rebalance")]
    NoSafeCandidates,

    #[error("minHealthyPercent {min_healthy_percent} leaves no disruption headroom across {total_nodes} nodes")]
    NoHeadroom {
        min_healthy_percent: u32,
        total_nodes: u32,
    },
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("plan not found: {0}")]
    PlanNotFound(String),

    #[error("execution not found for plan: {0}")]
    ExecutionNotFound(String),

    #[error("state store error: {0}")]
    State(#[from] fleet_state::StateError),

    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] fleet_lifecycle::LifecycleError),

    #[error("provider error: {0}")]
    Provider(#[from] fleet_provider::ProviderError),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
