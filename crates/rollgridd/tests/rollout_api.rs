//! End-to-end tests: rollouts declared and steered through the REST API,
//! driven by the reconciler against an in-memory store.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use rollgrid_api::build_router;
use rollgrid_core::EngineConfig;
use rollgrid_rollout::{Reconciler, Requeue, StoreBackend};
use rollgrid_state::*;
use serde_json::{Value, json};
use tower::ServiceExt;

const ID: &str = "prod/api";

fn test_store() -> StateStore {
    StateStore::open_in_memory().unwrap()
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn percents(values: &[i64]) -> Value {
    Value::Array(
        values
            .iter()
            .map(|p| json!({ "size": { "percent": p } }))
            .collect(),
    )
}

fn plan(values: &[i64]) -> Value {
    json!({ "batches": percents(values) })
}

/// Register both revisions with their workloads. The target renders frozen.
async fn register_fleet(router: &Router) {
    for (name, paused) in [("api-v1", false), ("api-v2", true)] {
        let (status, _) = send(
            router,
            "POST",
            "/api/v1/workloads",
            Some(json!({
                "namespace": "prod",
                "name": name,
                "native_owner": "app-controller",
                "replicas": 4,
                "paused": paused,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = send(
            router,
            "POST",
            "/api/v1/revisions",
            Some(json!({ "namespace": "prod", "name": name, "workload": name })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }
}

async fn declare(router: &Router, plan: Value) -> StatusCode {
    send(
        router,
        "POST",
        "/api/v1/rollouts",
        Some(json!({
            "namespace": "prod",
            "name": "api",
            "target_revision": "api-v2",
            "source_revision": "api-v1",
            "plan": plan,
        })),
    )
    .await
    .0
}

/// Natural controller reporting through the API: frozen workloads move to
/// their engine-set target, free ones to all replicas.
async fn converge(router: &Router, store: &StateStore) {
    for w in store.list_workloads().unwrap() {
        let goal = match (w.paused, w.target_replicas) {
            (false, _) => w.replicas,
            (true, Some(n)) => n,
            (true, None) => continue,
        };
        let uri = format!("/api/v1/workloads/{}/{}/status", w.namespace, w.name);
        let (status, _) = send(
            router,
            "PUT",
            &uri,
            Some(json!({
                "total_replicas": w.replicas,
                "updated_replicas": goal,
                "updated_ready_replicas": goal,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
}

async fn drive(reconciler: &Reconciler, router: &Router, store: &StateStore) {
    for _ in 0..100 {
        let requeue = reconciler.reconcile(ID).await.unwrap();
        converge(router, store).await;
        if requeue == Requeue::Never {
            return;
        }
    }
    panic!("rollout did not settle");
}

fn setup() -> (StateStore, Router, Reconciler) {
    let store = test_store();
    let router = build_router(store.clone());
    let reconciler =
        Reconciler::from_backend(StoreBackend::new(store.clone()), EngineConfig::default());
    (store, router, reconciler)
}

#[tokio::test]
async fn api_list_rollouts_empty() {
    let (_, router, _) = setup();
    let (status, body) = send(&router, "GET", "/api/v1/rollouts", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn api_get_missing_rollout() {
    let (_, router, _) = setup();
    let (status, body) = send(&router, "GET", "/api/v1/rollouts/prod/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn api_rejects_invalid_plans() {
    let (_, router, _) = setup();
    assert_eq!(declare(&router, plan(&[])).await, StatusCode::BAD_REQUEST);
    assert_eq!(declare(&router, plan(&[50, 120])).await, StatusCode::BAD_REQUEST);

    assert_eq!(declare(&router, plan(&[50, 100])).await, StatusCode::CREATED);
    let (status, _) = send(
        &router,
        "POST",
        "/api/v1/rollouts/prod/api/partition",
        Some(json!({ "batch_partition": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn api_pause_and_resume_edit_the_plan() {
    let (_, router, _) = setup();
    declare(&router, plan(&[50, 100])).await;

    let (status, body) = send(&router, "POST", "/api/v1/rollouts/prod/api/pause", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["spec"]["plan"]["paused"], true);
    assert_eq!(body["data"]["version"], 2);

    let (_, body) = send(&router, "POST", "/api/v1/rollouts/prod/api/resume", None).await;
    assert_eq!(body["data"]["spec"]["plan"]["paused"], false);

    let (status, _) = send(&router, "POST", "/api/v1/rollouts/prod/nope/pause", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn api_status_report_for_unknown_workload() {
    let (_, router, _) = setup();
    let (status, _) = send(
        &router,
        "PUT",
        "/api/v1/workloads/prod/nope/status",
        Some(json!({ "total_replicas": 1, "updated_replicas": 1, "updated_ready_replicas": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn canary_hold_then_full_rollout() {
    let (store, router, reconciler) = setup();
    register_fleet(&router).await;
    assert_eq!(
        declare(&router, json!({ "batches": percents(&[25, 50, 100]), "batch_partition": 0 })).await,
        StatusCode::CREATED
    );

    drive(&reconciler, &router, &store).await;

    let (_, body) = send(&router, "GET", "/api/v1/rollouts/prod/api", None).await;
    let status = &body["data"]["status"];
    assert_eq!(status["rolling_state"], "rolling_in_batches");
    assert_eq!(status["batch_rolling_state"], "batch_ready");
    assert_eq!(status["current_batch"], 0);
    assert_eq!(status["upgraded_ready_replicas"], 1);

    let (_, body) = send(&router, "GET", "/api/v1/rollouts/prod/api/batches", None).await;
    let replicas: Vec<u64> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["replicas"].as_u64().unwrap())
        .collect();
    assert_eq!(replicas, vec![1, 2, 4]);

    let (_, body) = send(&router, "GET", "/api/v1/workloads/prod/api-v2", None).await;
    assert_eq!(body["data"]["controlled_by"]["kind"], "rollout_engine");
    assert_eq!(body["data"]["controlled_by"]["rollout"], ID);
    assert_eq!(body["data"]["paused"], true);

    let (status, _) = send(
        &router,
        "POST",
        "/api/v1/rollouts/prod/api/partition",
        Some(json!({ "batch_partition": null })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    drive(&reconciler, &router, &store).await;

    let (_, body) = send(&router, "GET", "/api/v1/rollouts/prod/api", None).await;
    assert_eq!(body["data"]["status"]["rolling_state"], "rollout_succeeded");
    assert_eq!(body["data"]["status"]["current_batch"], 2);

    let (_, body) = send(&router, "GET", "/api/v1/workloads/prod/api-v2", None).await;
    assert_eq!(body["data"]["controlled_by"]["kind"], "native_controller");
    assert_eq!(body["data"]["paused"], false);

    let (_, body) = send(&router, "GET", "/api/v1/revisions/prod/api-v1", None).await;
    assert_eq!(body["data"]["markers"]["superseded"], true);
    assert_eq!(body["data"]["rolling_status"], "inactive_after_rolling_completed");
}

#[tokio::test]
async fn pause_holds_the_rollout_across_batches() {
    let (store, router, reconciler) = setup();
    register_fleet(&router).await;
    declare(&router, json!({ "batches": percents(&[25, 50, 100]), "paused": true })).await;

    drive(&reconciler, &router, &store).await;
    let record = store.get_rollout(ID).unwrap().unwrap();
    assert_eq!(record.status.batch_rolling_state, BatchRollingState::BatchPaused);
    assert!(record.status.is_condition_true(ConditionType::BatchPaused));
    let workload = store.get_workload("prod/api-v2").unwrap().unwrap();
    assert_eq!(workload.status.updated_replicas, 0);

    send(&router, "POST", "/api/v1/rollouts/prod/api/resume", None).await;
    drive(&reconciler, &router, &store).await;
    let record = store.get_rollout(ID).unwrap().unwrap();
    assert_eq!(record.status.rolling_state, RollingState::RolloutSucceeded);
}

#[tokio::test]
async fn deleted_rollout_is_left_alone() {
    let (store, router, reconciler) = setup();
    register_fleet(&router).await;
    declare(&router, plan(&[50, 100])).await;

    let (status, body) = send(&router, "DELETE", "/api/v1/rollouts/prod/api", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["data"]["spec"]["deletion_requested_at"].is_u64());
    assert_eq!(reconciler.reconcile(ID).await.unwrap(), Requeue::Never);
    assert!(store.get_rollout(ID).unwrap().is_none());

    // Never claimed: the frozen target is not touched.
    let (_, body) = send(&router, "GET", "/api/v1/workloads/prod/api-v2", None).await;
    assert_eq!(body["data"]["paused"], true);
    assert_eq!(body["data"]["controlled_by"]["kind"], "native_controller");

    let (status, _) = send(&router, "DELETE", "/api/v1/rollouts/prod/api", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deleting_a_held_rollout_hands_the_workload_back() {
    let (store, router, reconciler) = setup();
    register_fleet(&router).await;
    declare(&router, json!({ "batches": percents(&[25, 50, 100]), "batch_partition": 0 })).await;
    drive(&reconciler, &router, &store).await;

    let (_, body) = send(&router, "GET", "/api/v1/workloads/prod/api-v2", None).await;
    assert_eq!(body["data"]["controlled_by"]["kind"], "rollout_engine");

    let (status, _) = send(&router, "DELETE", "/api/v1/rollouts/prod/api", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    // Still listed until the engine has cleaned up.
    let (status, _) = send(&router, "GET", "/api/v1/rollouts/prod/api", None).await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(reconciler.reconcile(ID).await.unwrap(), Requeue::Never);
    let (status, _) = send(&router, "GET", "/api/v1/rollouts/prod/api", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = send(&router, "GET", "/api/v1/workloads/prod/api-v2", None).await;
    assert_eq!(body["data"]["paused"], false);
    assert_eq!(body["data"]["controlled_by"]["kind"], "native_controller");
    assert_eq!(body["data"]["controlled_by"]["owner"], "app-controller");

    let (_, body) = send(&router, "GET", "/api/v1/revisions/prod/api-v2", None).await;
    assert_eq!(body["data"]["markers"]["under_rollout"], false);
}

#[tokio::test]
async fn status_survives_a_daemon_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rollgrid.redb");
    {
        let store = StateStore::open(&path).unwrap();
        let router = build_router(store.clone());
        let reconciler =
            Reconciler::from_backend(StoreBackend::new(store.clone()), EngineConfig::default());
        register_fleet(&router).await;
        declare(&router, json!({ "batches": percents(&[25, 50, 100]), "batch_partition": 1 }))
            .await;
        drive(&reconciler, &router, &store).await;
    }

    let store = StateStore::open(&path).unwrap();
    let router = build_router(store.clone());
    let reconciler =
        Reconciler::from_backend(StoreBackend::new(store.clone()), EngineConfig::default());
    let before = store.get_rollout(ID).unwrap().unwrap();
    assert_eq!(before.status.current_batch, 1);

    // Re-running after the restart neither rewinds nor re-claims.
    assert_eq!(reconciler.reconcile(ID).await.unwrap(), Requeue::Never);
    assert_eq!(store.get_rollout(ID).unwrap().unwrap(), before);

    send(
        &router,
        "POST",
        "/api/v1/rollouts/prod/api/partition",
        Some(json!({ "batch_partition": null })),
    )
    .await;
    drive(&reconciler, &router, &store).await;
    let record = store.get_rollout(ID).unwrap().unwrap();
    assert_eq!(record.status.rolling_state, RollingState::RolloutSucceeded);
}
