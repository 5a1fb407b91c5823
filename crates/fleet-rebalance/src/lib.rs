//! fleet-rebalance — replaces live nodes with better-fit offerings.
//!
//! The pipeline has three stages:
//!
//! - **`analyzer`**: scores every eligible node of a group against an
//!   [`Opportunity`](fleet_state::Opportunity) and runs the group-wide
//!   safety gate.
//! - **`planner`**: partitions the safe candidates into batches shaped by
//!   the strategy (rolling, surge, blue-green), capped by the disruption
//!   headroom, and records the inverse of every batch.
//! - **`executor`**: advances a persisted
//!   [`ExecutionState`](fleet_state::ExecutionState) one step per call:
//!   provision, cordon, drain, verify, terminate, or roll back. Every
//!   sub-step is checkpointed, so a restarted controller resumes exactly
//!   where the previous one stopped.

pub mod analyzer;
pub mod error;
pub mod executor;
pub mod planner;

pub use analyzer::{RebalanceAnalysis, RebalanceAnalyzer, RecommendedAction, ScoreWeights};
pub use error::{ExecutorError, ExecutorResult, PlanError};
pub use executor::{ExecutorConfig, RebalanceExecutor, RebalanceResult, replacement_name};
pub use planner::{RebalancePlanner, headroom};
