//! Collaborator error taxonomy.

use thiserror::Error;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Network, auth, or rate-limit hiccup.
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The requested offering cannot be provisioned in this datacenter.
    #[error("offering unavailable: {0}")]
    OfferingUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The provider refused the request outright.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ProviderError {
    /// Whether the same request may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_) | ProviderError::QuotaExceeded(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::Transient("timeout".into()).is_retryable());
        assert!(ProviderError::QuotaExceeded("cpu".into()).is_retryable());
        assert!(!ProviderError::OfferingUnavailable("xl".into()).is_retryable());
        assert!(!ProviderError::Rejected("bad image".into()).is_retryable());
    }
}
