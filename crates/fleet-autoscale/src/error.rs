//! Scaling error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScaleError {
    #[error("state store error: {0}")]
    State(#[from] fleet_state::StateError),

    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] fleet_lifecycle::LifecycleError),

    #[error("provider error: {0}")]
    Provider(#[from] fleet_provider::ProviderError),
}

pub type ScaleResult<T> = Result<T, ScaleError>;
