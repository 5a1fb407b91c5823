//! fleet-autoscale — the scaling decision engine.
//!
//! Converts utilization into a desired node count per group:
//!
//! - **`decision`**: pure evaluation: thresholds, stabilization windows,
//!   the continuous below-threshold timer, and clamping to the effective
//!   `[minNodes, maxNodes]`.
//! - **`engine`**: applies a decision: picks an offering, creates
//!   `Pending` node records for the lifecycle machine, selects scale-down
//!   victims, and persists the group status.

pub mod decision;
pub mod engine;
pub mod error;

pub use decision::{ScaleDecision, ScaleDirection, Utilization, aggregate, evaluate};
pub use engine::{Autoscaler, ScaleOutcome, select_victims};
pub use error::{ScaleError, ScaleResult};
