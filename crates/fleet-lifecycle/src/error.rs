//! Lifecycle error types.

use fleet_state::NodePhase;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("node {node}: illegal transition {from} -> {to}")]
    InvalidTransition {
        node: String,
        from: NodePhase,
        to: NodePhase,
    },

    #[error("state store error: {0}")]
    State(#[from] fleet_state::StateError),

    #[error("provider error: {0}")]
    Provider(#[from] fleet_provider::ProviderError),
}

impl LifecycleError {
    /// A concurrent writer won; re-read and retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, LifecycleError::State(e) if e.is_conflict())
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
