//! fleet-lifecycle — drives each managed node from `Pending` to removal.
//!
//! ```text
//! Pending → Provisioning → Provisioned → Joining → Ready → Terminating → Deleting → (removed)
//!                          Failed  (from any non-terminal phase)
//! ```
//!
//! [`NodeLifecycle::reconcile_node`] performs at most one external step
//! per phase and persists the result before returning. Anything that has
//! to wait on the remote side (boot, join, drain, delete) returns
//! [`NodeProgress::Waiting`] with a requeue delay; nothing blocks.
//!
//! Both the scaling engine and the rebalance executor create nodes and
//! request their termination through this crate.

pub mod backoff;
pub mod error;
pub mod machine;

pub use backoff::Backoff;
pub use error::{LifecycleError, LifecycleResult};
pub use machine::{GROUP_LABEL, LifecycleConfig, NodeLifecycle, NodeProgress};
