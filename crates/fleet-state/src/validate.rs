//! Admission validation for node group specs.
//!
//! Validation errors are never retried automatically: the API rejects the
//! spec, and a group that somehow holds an invalid spec is surfaced with an
//! `InvalidConfiguration` condition instead of being reconciled.

use thiserror::Error;

use crate::types::{
    ANNOTATION_MAX_OVERRIDE, ANNOTATION_MIN_OVERRIDE, HourRange, NodeGroupSpec,
};

/// One or more field-level validation failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid node group spec: {}", .errors.join("; "))]
pub struct ValidationError {
    pub errors: Vec<String>,
}

/// Validate a node group spec, collecting every failing rule.
pub fn validate_group_spec(spec: &NodeGroupSpec) -> Result<(), ValidationError> {
    let mut errors = Vec::new();

    if let Err(e) = validate_name(&spec.name) {
        errors.push(e);
    }
    if spec.max_nodes < 1 {
        errors.push("maxNodes must be >= 1".to_string());
    }
    if spec.max_nodes < spec.min_nodes {
        errors.push(format!(
            "maxNodes ({}) must be >= minNodes ({})",
            spec.max_nodes, spec.min_nodes
        ));
    }
    if spec.datacenter_id.trim().is_empty() {
        errors.push("datacenterId must not be empty".to_string());
    }
    if spec.image_id.trim().is_empty() {
        errors.push("imageId must not be empty".to_string());
    }
    if spec.offering_ids.is_empty() {
        errors.push("offeringIds must list at least one offering".to_string());
    }
    if spec.offering_ids.iter().any(|o| o.trim().is_empty()) {
        errors.push("offeringIds must not contain empty ids".to_string());
    }

    for (field, value) in [
        ("scaleUp.cpuThreshold", spec.scale_up.cpu_threshold),
        ("scaleUp.memoryThreshold", spec.scale_up.memory_threshold),
        ("scaleDown.cpuThreshold", spec.scale_down.cpu_threshold),
        ("scaleDown.memoryThreshold", spec.scale_down.memory_threshold),
    ] {
        if !(0.0..=100.0).contains(&value) {
            errors.push(format!("{field} must be within [0, 100], got {value}"));
        }
    }

    if spec.scale_up.stabilization_window_secs == 0 {
        errors.push("scaleUp.stabilizationWindowSeconds must be > 0".to_string());
    }
    if spec.scale_down.stabilization_window_secs == 0 {
        errors.push("scaleDown.stabilizationWindowSeconds must be > 0".to_string());
    }
    if spec.scale_up.increment == 0 {
        errors.push("scaleUp.increment must be >= 1".to_string());
    }
    if spec.scale_down.decrement == 0 {
        errors.push("scaleDown.decrement must be >= 1".to_string());
    }

    let rb = &spec.rebalancing;
    if rb.batch_size == 0 {
        errors.push("rebalancing.batchSize must be >= 1".to_string());
    }
    if rb.max_concurrent == 0 {
        errors.push("rebalancing.maxConcurrent must be >= 1".to_string());
    }
    if rb.min_healthy_percent > 100 {
        errors.push("rebalancing.minHealthyPercent must be within [0, 100]".to_string());
    }
    for (field, value) in [
        ("rebalancing.provisionTimeout", rb.provision_timeout_secs),
        ("rebalancing.drainTimeout", rb.drain_timeout_secs),
        ("rebalancing.healthCheckTimeout", rb.health_check_timeout_secs),
    ] {
        if value == 0 {
            errors.push(format!("{field} must be > 0"));
        }
    }
    if let Some(window) = &rb.maintenance_window {
        check_hours("rebalancing.maintenanceWindow", &window.hours, &mut errors);
        if window.days.iter().any(|d| *d > 6) {
            errors.push("rebalancing.maintenanceWindow.days must be within 0-6".to_string());
        }
    }
    if let Some(peak) = &rb.peak_hours {
        check_hours("rebalancing.peakHours", peak, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { errors })
    }
}

fn check_hours(field: &str, range: &HourRange, errors: &mut Vec<String>) {
    if range.start_hour > 23 || range.end_hour > 23 {
        errors.push(format!("{field} hours must be within 0-23"));
    }
}

/// Validate a resource name: lowercase `[a-z0-9-]`, max 63 chars, no
/// leading/trailing hyphens.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name must not be empty".to_string());
    }
    if name.len() > 63 {
        return Err(format!(
            "name '{}' exceeds 63 characters (got {})",
            name,
            name.len()
        ));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(format!("name '{name}' must not start or end with a hyphen"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(format!(
            "name '{name}' must contain only lowercase letters, digits, and hyphens"
        ));
    }
    Ok(())
}

/// Bounds after applying override annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveBounds {
    pub min_nodes: u32,
    pub max_nodes: u32,
    /// Overrides that were present but ignored.
    pub ignored: Vec<String>,
}

/// Resolve `min_nodes`/`max_nodes`, honouring override annotations without
/// touching the persisted spec. Unparseable or bound-inverting overrides are
/// ignored and reported.
pub fn effective_bounds(spec: &NodeGroupSpec) -> EffectiveBounds {
    let mut ignored = Vec::new();
    let mut parse = |key: &str| -> Option<u32> {
        let raw = spec.annotations.get(key)?;
        match raw.trim().parse::<u32>() {
            Ok(v) => Some(v),
            Err(_) => {
                ignored.push(format!("{key}={raw} is not a non-negative integer"));
                None
            }
        }
    };
    let min_override = parse(ANNOTATION_MIN_OVERRIDE);
    let max_override = parse(ANNOTATION_MAX_OVERRIDE);

    let min = min_override.unwrap_or(spec.min_nodes);
    let max = max_override.unwrap_or(spec.max_nodes);

    if max < 1 || min > max {
        ignored.push(format!(
            "override bounds [{min}, {max}] are invalid; using spec [{}, {}]",
            spec.min_nodes, spec.max_nodes
        ));
        return EffectiveBounds {
            min_nodes: spec.min_nodes,
            max_nodes: spec.max_nodes,
            ignored,
        };
    }

    EffectiveBounds {
        min_nodes: min,
        max_nodes: max,
        ignored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use std::collections::HashMap;

    fn spec() -> NodeGroupSpec {
        NodeGroupSpec {
            name: "web".to_string(),
            datacenter_id: "dc-1".to_string(),
            image_id: "img-ubuntu".to_string(),
            offering_ids: vec!["small".to_string()],
            min_nodes: 1,
            max_nodes: 5,
            scale_up: ScaleUpPolicy::default(),
            scale_down: ScaleDownPolicy::default(),
            rebalancing: RebalancePolicy::default(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
        }
    }

    #[test]
    fn valid_spec_passes() {
        assert!(validate_group_spec(&spec()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut s = spec();
        s.min_nodes = 4;
        s.max_nodes = 2;
        s.datacenter_id = String::new();
        s.scale_up.cpu_threshold = 120.0;
        s.scale_down.stabilization_window_secs = 0;

        let err = validate_group_spec(&s).unwrap_err();
        assert_eq!(err.errors.len(), 4, "{err}");
    }

    #[test]
    fn max_nodes_must_be_positive() {
        let mut s = spec();
        s.min_nodes = 0;
        s.max_nodes = 0;
        let err = validate_group_spec(&s).unwrap_err();
        assert!(err.errors.iter().any(|e| e.contains(">= 1")));
    }

    #[test]
    fn rejects_empty_offering() {
        let mut s = spec();
        s.offering_ids = vec![String::new()];
        assert!(validate_group_spec(&s).is_err());
    }

    #[test]
    fn names() {
        assert!(validate_name("web-1").is_ok());
        assert!(validate_name("Web").is_err());
        assert!(validate_name("-web").is_err());
        assert!(validate_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn overrides_apply_without_mutating_spec() {
        let mut s = spec();
        s.annotations
            .insert(ANNOTATION_MIN_OVERRIDE.to_string(), "3".to_string());
        s.annotations
            .insert(ANNOTATION_MAX_OVERRIDE.to_string(), "8".to_string());

        let b = effective_bounds(&s);
        assert_eq!((b.min_nodes, b.max_nodes), (3, 8));
        assert!(b.ignored.is_empty());
        assert_eq!((s.min_nodes, s.max_nodes), (1, 5));
    }

    #[test]
    fn inverted_override_is_ignored() {
        let mut s = spec();
        s.annotations
            .insert(ANNOTATION_MIN_OVERRIDE.to_string(), "9".to_string());
        let b = effective_bounds(&s);
        assert_eq!((b.min_nodes, b.max_nodes), (1, 5));
        assert_eq!(b.ignored.len(), 1);
    }

    #[test]
    fn garbage_override_is_ignored() {
        let mut s = spec();
        s.annotations
            .insert(ANNOTATION_MAX_OVERRIDE.to_string(), "lots".to_string());
        let b = effective_bounds(&s);
        assert_eq!(b.max_nodes, 5);
        assert_eq!(b.ignored.len(), 1);
    }
}
