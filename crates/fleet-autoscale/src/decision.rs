//! Pure scaling evaluation.
//!
//! `evaluate` never touches the store or the providers; everything it needs
//! (policy, effective bounds, persisted status, current count, aggregated
//! utilization, time) is passed in so that decisions are reproducible and
//! survive restarts through `NodeGroupStatus`.

use fleet_provider::NodeUtilization;
use fleet_state::{EffectiveBounds, NodeGroupSpec, NodeGroupStatus};

/// Group-wide utilization, averaged over Ready nodes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Utilization {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Mean CPU and memory over `samples`; `None` without samples.
pub fn aggregate(samples: &[NodeUtilization]) -> Option<Utilization> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f64;
    Some(Utilization {
        cpu_percent: samples.iter().map(|s| s.cpu_percent).sum::<f64>() / n,
        memory_percent: samples.iter().map(|s| s.memory_percent).sum::<f64>() / n,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleDecision {
    pub current: u32,
    pub desired: u32,
    pub direction: Option<ScaleDirection>,
    /// Demand exceeded `maxNodes`.
    pub limit_reached: bool,
    /// New value for the persisted below-threshold marker.
    pub below_threshold_since: Option<u64>,
    /// Seconds until a stabilization window or the unneeded timer elapses.
    pub recheck_after_secs: Option<u64>,
    pub reason: String,
}

impl ScaleDecision {
    fn hold(current: u32, below: Option<u64>, reason: impl Into<String>) -> Self {
        Self {
            current,
            desired: current,
            direction: None,
            limit_reached: false,
            below_threshold_since: below,
            recheck_after_secs: None,
            reason: reason.into(),
        }
    }

    pub fn is_change(&self) -> bool {
        self.desired != self.current
    }
}

fn window_remaining(last: u64, window: u64, now: u64) -> Option<u64> {
    if last == 0 {
        return None;
    }
    let due = last + window;
    (now < due).then(|| due - now)
}

/// Decide the desired node count for one reconcile pass.
///
/// Bounds are enforced first and regardless of policy flags. Scale-up and
/// scale-down are mutually exclusive: scale-down is only considered when
/// scale-up demand is absent.
pub fn evaluate(
    spec: &NodeGroupSpec,
    bounds: &EffectiveBounds,
    status: &NodeGroupStatus,
    current: u32,
    utilization: Option<Utilization>,
    now: u64,
) -> ScaleDecision {
    let (min, max) = (bounds.min_nodes, bounds.max_nodes);

    if current < min {
        return ScaleDecision {
            desired: min,
            direction: Some(ScaleDirection::Up),
            ..ScaleDecision::hold(current, None, format!("{current} nodes below minNodes {min}"))
        };
    }
    if current > max {
        return ScaleDecision {
            desired: max,
            direction: Some(ScaleDirection::Down),
            ..ScaleDecision::hold(current, None, format!("{current} nodes above maxNodes {max}"))
        };
    }

    let Some(u) = utilization else {
        return ScaleDecision::hold(current, status.below_threshold_since, "no utilization samples");
    };

    let up = &spec.scale_up;
    let down = &spec.scale_down;

    let wants_up = u.cpu_percent > up.cpu_threshold || u.memory_percent > up.memory_threshold;
    if wants_up {
        if !up.enabled {
            return ScaleDecision::hold(current, None, "scale-up disabled");
        }
        if let Some(wait) = window_remaining(status.last_scale_up_time, up.stabilization_window_secs, now) {
            return ScaleDecision {
                recheck_after_secs: Some(wait),
                ..ScaleDecision::hold(current, None, format!("scale-up stabilizing for {wait}s"))
            };
        }
        let wanted = current.saturating_add(up.increment);
        let desired = wanted.min(max);
        let reason = format!(
            "cpu {:.1}% / memory {:.1}% above thresholds {:.0}% / {:.0}%",
            u.cpu_percent, u.memory_percent, up.cpu_threshold, up.memory_threshold
        );
        return ScaleDecision {
            desired,
            direction: (desired > current).then_some(ScaleDirection::Up),
            limit_reached: wanted > max,
            ..ScaleDecision::hold(current, None, reason)
        };
    }

    let wants_down = u.cpu_percent < down.cpu_threshold && u.memory_percent < down.memory_threshold;
    if !wants_down {
        return ScaleDecision::hold(current, None, "utilization within thresholds");
    }
    if !down.enabled {
        return ScaleDecision::hold(current, None, "scale-down disabled");
    }

    let since = status.below_threshold_since.unwrap_or(now);
    let below = Some(since);
    let unneeded_due = since + down.unneeded_time_secs;
    if now < unneeded_due {
        return ScaleDecision {
            recheck_after_secs: Some(unneeded_due - now),
            ..ScaleDecision::hold(current, below, "below thresholds, waiting for unneeded time")
        };
    }
    if let Some(wait) = window_remaining(status.last_scale_down_time, down.stabilization_window_secs, now) {
        return ScaleDecision {
            recheck_after_secs: Some(wait),
            ..ScaleDecision::hold(current, below, format!("scale-down stabilizing for {wait}s"))
        };
    }

    let desired = current.saturating_sub(down.decrement).max(min);
    if desired == current {
        return ScaleDecision::hold(current, below, format!("at minNodes {min}"));
    }
    ScaleDecision {
        desired,
        direction: Some(ScaleDirection::Down),
        ..ScaleDecision::hold(
            current,
            None,
            format!(
                "cpu {:.1}% / memory {:.1}% below thresholds for {}s",
                u.cpu_percent,
                u.memory_percent,
                now - since
            ),
        )
    }
}
