//! REST API handlers.
//!
//! Each handler reads/writes via `StateStore` and returns JSON responses in
//! a common `{success, data, error}` envelope.

use std::sync::atomic::{AtomicU64, Ordering};

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::{info, warn};

use fleet_state::validate::validate_name;
use fleet_state::*;

use crate::ApiState;

/// Default and maximum number of events returned per request.
const DEFAULT_EVENT_LIMIT: usize = 50;
const MAX_EVENT_LIMIT: usize = 256;

static OPPORTUNITY_SEQ: AtomicU64 = AtomicU64::new(0);

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    details: Vec<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            details: Vec::new(),
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> axum::response::Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
            details: Vec::new(),
        }),
    )
        .into_response()
}

fn invalid(msg: &str, details: Vec<String>) -> axum::response::Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
            details,
        }),
    )
        .into_response()
}

fn store_error(e: &StateError) -> axum::response::Response {
    let status = match e {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::AlreadyExists(_)
        | StateError::Conflict { .. }
        | StateError::ExecutionActive { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

// ── Health ─────────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}

/// GET /api/v1/leader
pub async fn get_leader(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.get_lease(CONTROLLER_LEASE) {
        Ok(Some(lease)) => {
            let expired = lease.is_expired(epoch_secs());
            ApiResponse::ok(serde_json::json!({
                "holder": lease.holder,
                "renewedAt": lease.renewed_at,
                "ttlSecs": lease.ttl_secs,
                "expired": expired,
            }))
            .into_response()
        }
        Ok(None) => error_response("no controller holds the lease", StatusCode::NOT_FOUND),
        Err(e) => store_error(&e),
    }
}

// ── Node groups ────────────────────────────────────────────────

/// GET /api/v1/nodegroups
pub async fn list_groups(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_groups() {
        Ok(groups) => ApiResponse::ok(groups).into_response(),
        Err(e) => store_error(&e),
    }
}

/// GET /api/v1/nodegroups/:name
pub async fn get_group(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.store.get_group(&name) {
        Ok(Some(group)) => ApiResponse::ok(group).into_response(),
        Ok(None) => error_response("node group not found", StatusCode::NOT_FOUND),
        Err(e) => store_error(&e),
    }
}

/// PUT /api/v1/nodegroups/:name
///
/// Creates the group or replaces its spec, keeping the status.
pub async fn apply_group(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(spec): Json<NodeGroupSpec>,
) -> impl IntoResponse {
    if spec.name != name {
        return error_response(
            &format!("name in path ({name}) and body ({}) differ", spec.name),
            StatusCode::BAD_REQUEST,
        );
    }
    if let Err(e) = validate_group_spec(&spec) {
        warn!(group = %name, error = %e, "node group spec rejected");
        return invalid("invalid node group spec", e.errors);
    }

    match state.store.apply_group_spec(spec, epoch_secs()) {
        Ok(group) if group.version == 1 => {
            info!(group = %name, "node group created");
            (StatusCode::CREATED, ApiResponse::ok(group)).into_response()
        }
        Ok(group) => {
            info!(group = %name, version = group.version, "node group spec updated");
            ApiResponse::ok(group).into_response()
        }
        Err(e) => store_error(&e),
    }
}

/// DELETE /api/v1/nodegroups/:name
///
/// Removes the group record and its pending opportunities. Managed node
/// records are kept; the controller stops reconciling them. Refused while a
/// rebalance is in progress.
pub async fn delete_group(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.store.active_execution(&name) {
        Ok(Some(exec)) => {
            return error_response(
                &format!("rebalance {} is in progress", exec.plan_id),
                StatusCode::CONFLICT,
            );
        }
        Ok(None) => {}
        Err(e) => return store_error(&e),
    }

    match state.store.delete_group(&name) {
        Ok(true) => {
            if let Ok(opportunities) = state.store.list_opportunities(&name) {
                for o in opportunities {
                    if let Err(e) = state.store.delete_opportunity(&name, &o.id) {
                        warn!(group = %name, opportunity = %o.id, error = %e, "failed to delete opportunity");
                    }
                }
            }
            info!(group = %name, "node group deleted");
            ApiResponse::ok("deleted").into_response()
        }
        Ok(false) => error_response("node group not found", StatusCode::NOT_FOUND),
        Err(e) => store_error(&e),
    }
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /api/v1/nodegroups/:name/nodes
pub async fn list_nodes(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.store.get_group(&name) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response("node group not found", StatusCode::NOT_FOUND),
        Err(e) => return store_error(&e),
    }
    match state.store.list_nodes(&name) {
        Ok(nodes) => ApiResponse::ok(nodes).into_response(),
        Err(e) => store_error(&e),
    }
}

// ── Opportunities ──────────────────────────────────────────────

/// Opportunity submission body.
#[derive(Debug, serde::Deserialize)]
pub struct SubmitOpportunity {
    /// Generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub target_offering_id: String,
    #[serde(default)]
    pub node_names: Vec<String>,
    pub estimated_savings_percent: f64,
    #[serde(default)]
    pub estimated_monthly_savings: f64,
    #[serde(default)]
    pub performance_delta_percent: f64,
    /// Seconds from now after which the opportunity is discarded.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// GET /api/v1/nodegroups/:name/opportunities
pub async fn list_opportunities(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.store.list_opportunities(&name) {
        Ok(list) => ApiResponse::ok(list).into_response(),
        Err(e) => store_error(&e),
    }
}

/// POST /api/v1/nodegroups/:name/opportunities
pub async fn submit_opportunity(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<SubmitOpportunity>,
) -> impl IntoResponse {
    let group = match state.store.get_group(&name) {
        Ok(Some(group)) => group,
        Ok(None) => return error_response("node group not found", StatusCode::NOT_FOUND),
        Err(e) => return store_error(&e),
    };

    let now = epoch_secs();
    let id = req.id.clone().unwrap_or_else(|| {
        let seq = OPPORTUNITY_SEQ.fetch_add(1, Ordering::Relaxed);
        format!("opp-{now:x}-{seq}")
    });

    let mut errors = Vec::new();
    if let Err(e) = validate_name(&id) {
        errors.push(format!("id: {e}"));
    }
    if !group.spec.offering_ids.contains(&req.target_offering_id) {
        errors.push(format!(
            "target_offering_id {} is not one of the group's offering_ids",
            req.target_offering_id
        ));
    }
    if !req.estimated_savings_percent.is_finite() {
        errors.push("estimated_savings_percent must be a finite number".to_string());
    }
    if !errors.is_empty() {
        return invalid("invalid opportunity", errors);
    }

    let mut opportunity = Opportunity {
        id,
        group: name.clone(),
        target_offering_id: req.target_offering_id,
        node_names: req.node_names,
        estimated_savings_percent: req.estimated_savings_percent,
        estimated_monthly_savings: req.estimated_monthly_savings,
        performance_delta_percent: req.performance_delta_percent,
        created_at: now,
        expires_at: req.ttl_secs.map(|ttl| now + ttl),
        version: 0,
    };
    match state.store.create_opportunity(&mut opportunity) {
        Ok(()) => {
            info!(group = %name, opportunity = %opportunity.id, target = %opportunity.target_offering_id, "opportunity submitted");
            (StatusCode::CREATED, ApiResponse::ok(opportunity)).into_response()
        }
        Err(e) => store_error(&e),
    }
}

/// DELETE /api/v1/nodegroups/:name/opportunities/:id
pub async fn delete_opportunity(
    State(state): State<ApiState>,
    Path((name, id)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.store.delete_opportunity(&name, &id) {
        Ok(true) => ApiResponse::ok("deleted").into_response(),
        Ok(false) => error_response("opportunity not found", StatusCode::NOT_FOUND),
        Err(e) => store_error(&e),
    }
}

// ── Events ─────────────────────────────────────────────────────

#[derive(Debug, Default, serde::Deserialize)]
pub struct EventQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// GET /api/v1/nodegroups/:name/events
pub async fn list_group_events(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(query): Query<EventQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .min(MAX_EVENT_LIMIT);
    match state.store.list_events(&format!("nodegroup/{name}"), limit) {
        Ok(events) => ApiResponse::ok(events).into_response(),
        Err(e) => store_error(&e),
    }
}

// ── Plans ──────────────────────────────────────────────────────

#[derive(serde::Serialize)]
pub struct PlanView {
    pub plan: RebalancePlan,
    pub execution: Option<ExecutionState>,
    pub events: Vec<Event>,
}

/// GET /api/v1/plans/:id
pub async fn get_plan(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let plan = match state.store.get_plan(&id) {
        Ok(Some(plan)) => plan,
        Ok(None) => return error_response("plan not found", StatusCode::NOT_FOUND),
        Err(e) => return store_error(&e),
    };
    let execution = match state.store.get_execution(&id) {
        Ok(execution) => execution,
        Err(e) => return store_error(&e),
    };
    let events = state
        .store
        .list_events(&plan.object_ref(), DEFAULT_EVENT_LIMIT)
        .unwrap_or_default();
    ApiResponse::ok(PlanView {
        plan,
        execution,
        events,
    })
    .into_response()
}
