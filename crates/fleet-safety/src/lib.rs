//! fleet-safety — the precondition library gating disruptive operations.
//!
//! Every check is a pure function over a [`SafetyContext`] and returns a
//! [`CheckResult`] carrying pass/fail and a reason string. Checks are
//! evaluated as a conjunction:
//!
//! - before a rebalance analysis (`evaluate_group`), including cooldown
//! - before every rebalance batch starts (`evaluate_batch`), where a
//!   cluster-wide failure pauses the whole plan and any other failure
//!   blocks only the affected batch
//! - in reduced form before a scale-down (`evaluate_scale_down`)
//!
//! External observations (control-plane health, disruption budgets,
//! offerings, quota) are gathered once per pass by [`collect_signals`] so
//! the checks themselves never touch the network.

pub mod check;
pub mod gate;
pub mod signals;

pub use check::{CheckName, CheckResult, CheckScope, Verdict};
pub use gate::{
    BatchVerdict, SafetyContext, check_cluster_health, check_cooldown, check_disruption,
    check_group_health, check_maintenance_window, check_peak_hours, check_resources,
    evaluate_batch, evaluate_group, evaluate_node, evaluate_scale_down,
};
pub use signals::{SafetySignals, collect_signals};
