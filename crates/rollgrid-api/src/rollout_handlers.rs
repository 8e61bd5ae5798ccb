//! REST API handlers for rollout management.
//!
//! Handlers only edit the user-owned half of a rollout record (its spec);
//! the status is written by the reconciler alone.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rollgrid_core::epoch_secs;
use rollgrid_rollout::{batch_targets as resolve_targets, validate_plan};
use rollgrid_state::*;
use tracing::info;

use crate::handlers::{error_response, internal_error, ApiResponse};
use crate::ApiState;

/// Request body to create or replace a rollout.
#[derive(serde::Deserialize)]
pub struct CreateRolloutRequest {
    pub namespace: String,
    pub name: String,
    pub target_revision: String,
    #[serde(default)]
    pub source_revision: Option<String>,
    pub plan: RolloutPlan,
}

/// Request body to move the batch partition. `null` removes it.
#[derive(serde::Deserialize)]
pub struct PartitionRequest {
    pub batch_partition: Option<u32>,
}

/// Resolved replica target of one batch.
#[derive(Debug, serde::Serialize)]
pub struct BatchTarget {
    pub batch: u32,
    pub replicas: u32,
}

fn plan_error(e: impl std::fmt::Display) -> Response {
    error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response()
}

fn not_found() -> Response {
    error_response("rollout not found", StatusCode::NOT_FOUND).into_response()
}

/// Apply a spec edit and answer with the updated record.
fn edit_spec<F>(state: &ApiState, namespace: &str, name: &str, f: F) -> Response
where
    F: FnOnce(&mut RolloutSpec),
{
    let key = object_key(namespace, name);
    match state.store.update_rollout_spec(&key, |spec| {
        f(spec);
        spec.updated_at = epoch_secs();
    }) {
        Ok(record) => {
            info!(%key, version = record.version, "rollout spec updated");
            ApiResponse::ok(record).into_response()
        }
        Err(StateError::NotFound(_)) => not_found(),
        Err(e) => internal_error(e),
    }
}

/// GET /api/v1/rollouts
pub async fn list_rollouts(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_rollouts() {
        Ok(rollouts) => ApiResponse::ok(rollouts).into_response(),
        Err(e) => internal_error(e),
    }
}

/// GET /api/v1/rollouts/{namespace}/{name}
pub async fn get_rollout(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.store.get_rollout(&object_key(&namespace, &name)) {
        Ok(Some(record)) => ApiResponse::ok(record).into_response(),
        Ok(None) => not_found(),
        Err(e) => internal_error(e),
    }
}

/// POST /api/v1/rollouts
///
/// Replacing an existing rollout keeps its status; a new revision pair
/// makes the engine restart it.
pub async fn create_rollout(
    State(state): State<ApiState>,
    Json(req): Json<CreateRolloutRequest>,
) -> impl IntoResponse {
    if let Err(e) = validate_plan(&req.plan) {
        return plan_error(e);
    }
    let now = epoch_secs();
    let spec = RolloutSpec {
        namespace: req.namespace,
        name: req.name,
        target_revision: req.target_revision,
        source_revision: req.source_revision,
        plan: req.plan,
        deletion_requested_at: None,
        created_at: now,
        updated_at: now,
    };
    match state.store.put_rollout(&spec) {
        Ok(record) => {
            info!(
                key = %spec.table_key(),
                target = %spec.target_revision,
                source = ?spec.source_revision,
                "rollout declared"
            );
            (StatusCode::CREATED, ApiResponse::ok(record)).into_response()
        }
        Err(e) => internal_error(e),
    }
}

/// DELETE /api/v1/rollouts/{namespace}/{name}
///
/// Only requests the deletion. The reconciler hands any claimed workload
/// back to its natural controller and then removes the record.
pub async fn delete_rollout(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    let key = object_key(&namespace, &name);
    let now = epoch_secs();
    match state.store.update_rollout_spec(&key, |spec| {
        spec.deletion_requested_at.get_or_insert(now);
    }) {
        Ok(record) => {
            info!(%key, version = record.version, "rollout deletion requested");
            (StatusCode::ACCEPTED, ApiResponse::ok(record)).into_response()
        }
        Err(StateError::NotFound(_)) => not_found(),
        Err(e) => internal_error(e),
    }
}

/// PUT /api/v1/rollouts/{namespace}/{name}/plan
pub async fn update_plan(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(plan): Json<RolloutPlan>,
) -> impl IntoResponse {
    if let Err(e) = validate_plan(&plan) {
        return plan_error(e);
    }
    edit_spec(&state, &namespace, &name, |spec| spec.plan = plan)
}

/// POST /api/v1/rollouts/{namespace}/{name}/pause
pub async fn pause_rollout(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    edit_spec(&state, &namespace, &name, |spec| spec.plan.paused = true)
}

/// POST /api/v1/rollouts/{namespace}/{name}/resume
pub async fn resume_rollout(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    edit_spec(&state, &namespace, &name, |spec| spec.plan.paused = false)
}

/// POST /api/v1/rollouts/{namespace}/{name}/partition
pub async fn set_partition(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(req): Json<PartitionRequest>,
) -> impl IntoResponse {
    let key = object_key(&namespace, &name);
    let record = match state.store.get_rollout(&key) {
        Ok(Some(record)) => record,
        Ok(None) => return not_found(),
        Err(e) => return internal_error(e),
    };
    let mut plan = record.spec.plan;
    plan.batch_partition = req.batch_partition;
    if let Err(e) = validate_plan(&plan) {
        return plan_error(e);
    }
    edit_spec(&state, &namespace, &name, |spec| {
        spec.plan.batch_partition = req.batch_partition
    })
}

/// GET /api/v1/rollouts/{namespace}/{name}/batches
///
/// Resolves against the last observed target size.
pub async fn batch_targets(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    let record = match state.store.get_rollout(&object_key(&namespace, &name)) {
        Ok(Some(record)) => record,
        Ok(None) => return not_found(),
        Err(e) => return internal_error(e),
    };
    let Some(total) = record.status.rollout_target_size else {
        return error_response("target size not observed yet", StatusCode::CONFLICT)
            .into_response();
    };
    match resolve_targets(&record.spec.plan.batches, total) {
        Ok(targets) => {
            let targets: Vec<BatchTarget> = targets
                .into_iter()
                .enumerate()
                .map(|(batch, replicas)| BatchTarget {
                    batch: batch as u32,
                    replicas,
                })
                .collect();
            ApiResponse::ok(targets).into_response()
        }
        Err(e) => plan_error(e),
    }
}
