//! fleet-api — REST admission surface for the fleet controller.
//!
//! Handlers only read and write the [`StateStore`]; the controller picks up
//! changes on its next reconcile pass. Specs are validated on admission and
//! rejected with `422` rather than stored and surfaced later.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/healthz` | Liveness |
//! | GET | `/api/v1/leader` | Current controller lease |
//! | GET | `/api/v1/nodegroups` | List node groups |
//! | PUT | `/api/v1/nodegroups/{name}` | Create or replace a group spec |
//! | GET | `/api/v1/nodegroups/{name}` | Group spec and status |
//! | DELETE | `/api/v1/nodegroups/{name}` | Delete a group record |
//! | GET | `/api/v1/nodegroups/{name}/nodes` | Managed nodes |
//! | GET | `/api/v1/nodegroups/{name}/opportunities` | Pending opportunities |
//! | POST | `/api/v1/nodegroups/{name}/opportunities` | Submit an opportunity |
//! | DELETE | `/api/v1/nodegroups/{name}/opportunities/{id}` | Withdraw an opportunity |
//! | GET | `/api/v1/nodegroups/{name}/events` | Recent group events |
//! | GET | `/api/v1/plans/{id}` | Plan with its execution state |

pub mod handlers;

use axum::Router;
use axum::routing::{delete, get};
use fleet_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
}

/// Build the complete API router.
pub fn build_router(store: StateStore) -> Router {
    let state = ApiState { store };

    let api_routes = Router::new()
        .route("/leader", get(handlers::get_leader))
        .route("/nodegroups", get(handlers::list_groups))
        .route(
            "/nodegroups/{name}",
            get(handlers::get_group)
                .put(handlers::apply_group)
                .delete(handlers::delete_group),
        )
        .route("/nodegroups/{name}/nodes", get(handlers::list_nodes))
        .route(
            "/nodegroups/{name}/opportunities",
            get(handlers::list_opportunities).post(handlers::submit_opportunity),
        )
        .route(
            "/nodegroups/{name}/opportunities/{id}",
            delete(handlers::delete_opportunity),
        )
        .route("/nodegroups/{name}/events", get(handlers::list_group_events))
        .route("/plans/{id}", get(handlers::get_plan))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
