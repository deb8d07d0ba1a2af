//! HTTP surface tests wired to the real handlers over an in-memory store.


use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use gpuflow::api::{router, ApiState};
use gpuflow::registry::{SupervisorState, SupervisorStatus};
use test_harness::TestPipeline;

fn create_test_app(pipeline: &TestPipeline) -> Router {
    router(ApiState {
        scheduler: pipeline.scheduler.clone(),
        registry: pipeline.registry.clone(),
    })
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_endpoint_responds() {
    let pipeline = TestPipeline::new();
    let app = create_test_app(&pipeline);

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "healthy");
}

#[tokio::test]
async fn submit_job_returns_accepted_with_id() {
    let pipeline = TestPipeline::new();
    let app = create_test_app(&pipeline);

    let response = app
        .clone()
        .oneshot(post_json(
            "/jobs",
            json!({"type": "train", "gpu": "AMD", "payload": {"task_id": 1}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let body = body_json(response).await;
    let job_id = body["job_id"].as_str().expect("job_id in response");

    // The job is immediately visible through the status endpoint.
    let response = app
        .oneshot(get(&format!("/jobs/status?id={job_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let job = body_json(response).await;
    assert_eq!(job["id"], job_id);
    assert_eq!(job["type"], "train");
    assert_eq!(job["gpu"], "AMD");
    assert_eq!(job["state"], "scheduled");
    assert_eq!(job["retries"], 0);
    assert_eq!(job["payload"]["task_id"], 1);
}

#[tokio::test]
async fn job_status_for_unknown_id_is_not_found() {
    let pipeline = TestPipeline::new();
    let app = create_test_app(&pipeline);

    let response = app
        .oneshot(get("/jobs/status?id=missing"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn jobs_can_be_listed_by_state() {
    let pipeline = TestPipeline::new();
    let app = create_test_app(&pipeline);

    for i in 0..3 {
        let response = app
            .clone()
            .oneshot(post_json(
                "/jobs",
                json!({"type": "train", "gpu": "AMD", "payload": {"task_id": i}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    let response = app
        .clone()
        .oneshot(get("/jobs?state=scheduled"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["count"], 3);
    assert_eq!(body["state"], "scheduled");
    assert_eq!(body["jobs"].as_array().unwrap().len(), 3);

    let response = app.oneshot(get("/jobs?state=bogus")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn supervisor_listings_and_lookup() {
    let pipeline = TestPipeline::new();
    let app = create_test_app(&pipeline);

    let now = Utc::now();
    for (id, gpu, state, last_seen) in [
        ("w_amd", "AMD", SupervisorState::Active, now),
        ("w_nv", "NVIDIA", SupervisorState::Active, now),
        (
            "w_tt",
            "TT",
            SupervisorState::Active,
            now - chrono::Duration::minutes(5),
        ),
    ] {
        pipeline
            .registry
            .update_supervisor_status(&SupervisorStatus {
                consumer_id: id.to_string(),
                gpu_type: gpu.to_string(),
                state,
                started_at: now - chrono::Duration::hours(1),
                last_seen,
            })
            .await
            .expect("update");
    }

    let response = app
        .clone()
        .oneshot(get("/supervisors?active=false"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["count"], 3);
    assert_eq!(body["active_only"], false);

    // The stale TT supervisor drops out of the active listing.
    let response = app
        .clone()
        .oneshot(get("/supervisors?active=true"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["count"], 2);
    assert_eq!(body["active_only"], true);

    let response = app
        .clone()
        .oneshot(get("/supervisors/status"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["count"], 3);
    assert!(body.get("active_only").is_none());

    let response = app
        .clone()
        .oneshot(get("/supervisors/status/w_amd"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["consumer_id"], "w_amd");
    assert_eq!(body["gpu_type"], "AMD");
    assert_eq!(body["state"], "active");

    let response = app
        .oneshot(get("/supervisors/status/ghost"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
