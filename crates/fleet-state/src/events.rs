//! Observability events emitted by the controller engines.
//!
//! Events are persisted to the `events` table (see
//! [`StateStore::record_event`](crate::StateStore::record_event)) and mirrored
//! to the tracing log so that no failure goes without a recorded reason.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// Machine-readable event reason.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventReason {
    ScalingUp,
    ScalingDown,
    ScaleLimitReached,
    ProvisioningFailed,
    InvalidConfiguration,
    #[serde(rename = "VPSCreated")]
    VpsCreated,
    #[serde(rename = "VPSReady")]
    VpsReady,
    NodeJoined,
    NodeReady,
    Terminating,
    NodeDeleted,
    DeletionFailed,
    JoinFailed,
    DrainFailed,
    SafetyCheckFailed,
    RebalanceStarted,
    RebalanceCompleted,
    RebalanceFailed,
    RollbackFailed,
}

impl EventReason {
    pub fn kind(self) -> EventKind {
        match self {
            EventReason::ScaleLimitReached
            | EventReason::ProvisioningFailed
            | EventReason::InvalidConfiguration
            | EventReason::DeletionFailed
            | EventReason::JoinFailed
            | EventReason::DrainFailed
            | EventReason::SafetyCheckFailed
            | EventReason::RebalanceFailed
            | EventReason::RollbackFailed => EventKind::Warning,
            _ => EventKind::Normal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventReason::ScalingUp => "ScalingUp",
            EventReason::ScalingDown => "ScalingDown",
            EventReason::ScaleLimitReached => "ScaleLimitReached",
            EventReason::ProvisioningFailed => "ProvisioningFailed",
            EventReason::InvalidConfiguration => "InvalidConfiguration",
            EventReason::VpsCreated => "VPSCreated",
            EventReason::VpsReady => "VPSReady",
            EventReason::NodeJoined => "NodeJoined",
            EventReason::NodeReady => "NodeReady",
            EventReason::Terminating => "Terminating",
            EventReason::NodeDeleted => "NodeDeleted",
            EventReason::DeletionFailed => "DeletionFailed",
            EventReason::JoinFailed => "JoinFailed",
            EventReason::DrainFailed => "DrainFailed",
            EventReason::SafetyCheckFailed => "SafetyCheckFailed",
            EventReason::RebalanceStarted => "RebalanceStarted",
            EventReason::RebalanceCompleted => "RebalanceCompleted",
            EventReason::RebalanceFailed => "RebalanceFailed",
            EventReason::RollbackFailed => "RollbackFailed",
        }
    }
}

impl std::fmt::Display for EventReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Object reference, e.g. `nodegroup/web` or `node/web-7f3a`.
    pub object: String,
    pub reason: EventReason,
    pub kind: EventKind,
    pub message: String,
    pub at: u64,
}

impl Event {
    pub fn new(object: impl Into<String>, reason: EventReason, message: impl Into<String>, at: u64) -> Self {
        Self {
            object: object.into(),
            reason,
            kind: reason.kind(),
            message: message.into(),
            at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_reasons() {
        assert_eq!(EventReason::DrainFailed.kind(), EventKind::Warning);
        assert_eq!(EventReason::NodeReady.kind(), EventKind::Normal);
    }

    #[test]
    fn vps_reasons_keep_wire_names() {
        let json = serde_json::to_string(&EventReason::VpsCreated).unwrap();
        assert_eq!(json, "\"VPSCreated\"");
        assert_eq!(EventReason::VpsReady.to_string(), "VPSReady");
    }
}
