//! REST API handlers for revisions and workloads.
//!
//! Each handler reads/writes via `StateStore` and returns JSON responses.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use rollgrid_core::epoch_secs;
use rollgrid_state::*;
use tracing::info;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

pub(crate) fn internal_error(e: StateError) -> axum::response::Response {
    error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
}

// ── Revisions ──────────────────────────────────────────────────

/// Request body to register a revision.
#[derive(serde::Deserialize)]
pub struct RegisterRevisionRequest {
    pub namespace: String,
    pub name: String,
    pub workload: String,
    #[serde(default = "default_true")]
    pub ready_for_rolling: bool,
}

fn default_true() -> bool {
    true
}

/// GET /api/v1/revisions
pub async fn list_revisions(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_revisions() {
        Ok(revisions) => ApiResponse::ok(revisions).into_response(),
        Err(e) => internal_error(e),
    }
}

/// GET /api/v1/revisions/{namespace}/{name}
pub async fn get_revision(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.store.get_revision(&object_key(&namespace, &name)) {
        Ok(Some(revision)) => ApiResponse::ok(revision).into_response(),
        Ok(None) => error_response("revision not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => internal_error(e),
    }
}

/// POST /api/v1/revisions
///
/// Re-registering keeps the markers the rollout engine left on it.
pub async fn register_revision(
    State(state): State<ApiState>,
    Json(req): Json<RegisterRevisionRequest>,
) -> impl IntoResponse {
    let key = object_key(&req.namespace, &req.name);
    let existing = match state.store.get_revision(&key) {
        Ok(existing) => existing,
        Err(e) => return internal_error(e),
    };

    let result = match existing {
        Some(_) => state.store.update_revision(&key, |r| {
            r.workload = req.workload.clone();
            r.ready_for_rolling = req.ready_for_rolling;
            r.updated_at = epoch_secs();
            Ok(())
        }),
        None => {
            let revision = Revision {
                namespace: req.namespace.clone(),
                name: req.name.clone(),
                workload: req.workload.clone(),
                ready_for_rolling: req.ready_for_rolling,
                rolling_status: RevisionRollingStatus::default(),
                markers: RevisionMarkers::default(),
                updated_at: epoch_secs(),
            };
            state.store.put_revision(&revision).map(|()| revision)
        }
    };

    match result {
        Ok(revision) => {
            info!(%key, ready = revision.ready_for_rolling, "revision registered");
            (StatusCode::CREATED, ApiResponse::ok(revision)).into_response()
        }
        Err(e) => internal_error(e),
    }
}

// ── Workloads ──────────────────────────────────────────────────

/// Request body to register a workload.
#[derive(serde::Deserialize)]
pub struct RegisterWorkloadRequest {
    pub namespace: String,
    pub name: String,
    pub native_owner: String,
    pub replicas: u32,
    /// Create the workload frozen, as revisions rendered for a rollout are.
    #[serde(default)]
    pub paused: bool,
}

/// GET /api/v1/workloads
pub async fn list_workloads(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_workloads() {
        Ok(workloads) => ApiResponse::ok(workloads).into_response(),
        Err(e) => internal_error(e),
    }
}

/// GET /api/v1/workloads/{namespace}/{name}
pub async fn get_workload(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.store.get_workload(&object_key(&namespace, &name)) {
        Ok(Some(workload)) => ApiResponse::ok(workload).into_response(),
        Ok(None) => error_response("workload not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => internal_error(e),
    }
}

/// POST /api/v1/workloads
///
/// Re-registering updates size and owner only; ownership and pause state
/// stay with whoever holds the workload.
pub async fn register_workload(
    State(state): State<ApiState>,
    Json(req): Json<RegisterWorkloadRequest>,
) -> impl IntoResponse {
    let key = object_key(&req.namespace, &req.name);
    let existing = match state.store.get_workload(&key) {
        Ok(existing) => existing,
        Err(e) => return internal_error(e),
    };

    let result = match existing {
        Some(_) => state.store.update_workload(&key, |w| {
            w.replicas = req.replicas;
            w.native_owner = req.native_owner.clone();
            w.updated_at = epoch_secs();
            Ok(())
        }),
        None => {
            let workload = Workload {
                namespace: req.namespace.clone(),
                name: req.name.clone(),
                native_owner: req.native_owner.clone(),
                replicas: req.replicas,
                target_replicas: None,
                paused: req.paused,
                controlled_by: ControlledBy::NativeController {
                    owner: req.native_owner.clone(),
                },
                status: WorkloadStatus::default(),
                updated_at: epoch_secs(),
            };
            state.store.put_workload(&workload).map(|()| workload)
        }
    };

    match result {
        Ok(workload) => {
            info!(%key, replicas = workload.replicas, "workload registered");
            (StatusCode::CREATED, ApiResponse::ok(workload)).into_response()
        }
        Err(e) => internal_error(e),
    }
}

/// PUT /api/v1/workloads/{namespace}/{name}/status
pub async fn report_workload_status(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(status): Json<WorkloadStatus>,
) -> impl IntoResponse {
    let result = state
        .store
        .update_workload(&object_key(&namespace, &name), |w| {
            w.status = status;
            w.updated_at = epoch_secs();
            Ok(())
        });
    match result {
        Ok(workload) => ApiResponse::ok(workload).into_response(),
        Err(StateError::NotFound(_)) => {
            error_response("workload not found", StatusCode::NOT_FOUND).into_response()
        }
        Err(e) => internal_error(e),
    }
}
