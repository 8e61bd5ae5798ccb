//! rollgrid-api — REST API for rollgrid.
//!
//! Users declare rollouts and edit their plans here; the reconciler picks
//! the edits up from the store. Revisions and workloads are registered
//! through the same API by whatever renders them.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/rollouts` | List rollouts |
//! | POST | `/api/v1/rollouts` | Create or replace a rollout |
//! | GET | `/api/v1/rollouts/{ns}/{name}` | Get a rollout with its status |
//! | DELETE | `/api/v1/rollouts/{ns}/{name}` | Delete a rollout |
//! | PUT | `/api/v1/rollouts/{ns}/{name}/plan` | Replace the plan |
//! | POST | `/api/v1/rollouts/{ns}/{name}/pause` | Pause the rollout |
//! | POST | `/api/v1/rollouts/{ns}/{name}/resume` | Resume the rollout |
//! | POST | `/api/v1/rollouts/{ns}/{name}/partition` | Move the batch partition |
//! | GET | `/api/v1/rollouts/{ns}/{name}/batches` | Resolved per-batch targets |
//! | GET | `/api/v1/revisions` | List revisions |
//! | POST | `/api/v1/revisions` | Register a revision |
//! | GET | `/api/v1/revisions/{ns}/{name}` | Get a revision |
//! | GET | `/api/v1/workloads` | List workloads |
//! | POST | `/api/v1/workloads` | Register a workload |
//! | GET | `/api/v1/workloads/{ns}/{name}` | Get a workload |
//! | PUT | `/api/v1/workloads/{ns}/{name}/status` | Report replica counts |

pub mod handlers;
pub mod rollout_handlers;

use axum::Router;
use axum::routing::{get, post, put};
use rollgrid_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
}

/// Build the complete API router.
pub fn build_router(store: StateStore) -> Router {
    let api_state = ApiState { store };

    let api_routes = Router::new()
        .route(
            "/rollouts",
            get(rollout_handlers::list_rollouts).post(rollout_handlers::create_rollout),
        )
        .route(
            "/rollouts/{namespace}/{name}",
            get(rollout_handlers::get_rollout).delete(rollout_handlers::delete_rollout),
        )
        .route("/rollouts/{namespace}/{name}/plan", put(rollout_handlers::update_plan))
        .route("/rollouts/{namespace}/{name}/pause", post(rollout_handlers::pause_rollout))
        .route("/rollouts/{namespace}/{name}/resume", post(rollout_handlers::resume_rollout))
        .route(
            "/rollouts/{namespace}/{name}/partition",
            post(rollout_handlers::set_partition),
        )
        .route("/rollouts/{namespace}/{name}/batches", get(rollout_handlers::batch_targets))
        .route(
            "/revisions",
            get(handlers::list_revisions).post(handlers::register_revision),
        )
        .route("/revisions/{namespace}/{name}", get(handlers::get_revision))
        .route(
            "/workloads",
            get(handlers::list_workloads).post(handlers::register_workload),
        )
        .route("/workloads/{namespace}/{name}", get(handlers::get_workload))
        .route(
            "/workloads/{namespace}/{name}/status",
            put(handlers::report_workload_status),
        )
        .with_state(api_state);

    Router::new().nest("/api/v1", api_routes)
}
