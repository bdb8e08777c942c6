//! Integration tests for batch submission, status, cancellation and the
//! engine status endpoints.

mod common;

use axum::http::{Method, StatusCode};
use common::{body_json, build_test_app, get, post, send_json, TestApp};
use serde_json::json;

fn image_request(prompt: &str) -> serde_json::Value {
    json!({ "scene_id": "scene-1", "media_type": "image", "prompt": prompt })
}

/// Submit a batch and wait for it to finish; returns its id.
async fn run_batch(app: &TestApp, requests: Vec<serde_json::Value>) -> String {
    let response = send_json(
        app,
        Method::POST,
        "/api/v1/batches",
        json!({ "project_id": "proj", "requests": requests }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    let batch_id = json["data"]["batch_id"].as_str().unwrap().to_string();

    app.service.wait(batch_id.parse().unwrap()).await.unwrap();
    batch_id
}

// ---------------------------------------------------------------------------
// Test: submit + status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submitted_batch_completes_with_summary() {
    let app = build_test_app();
    let batch_id = run_batch(
        &app,
        vec![image_request("a red fox"), image_request("a blue jay")],
    )
    .await;

    let response = get(&app, &format!("/api/v1/batches/{batch_id}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let data = &json["data"];

    assert_eq!(data["state"], "completed");
    assert_eq!(data["project_id"], "proj");
    assert_eq!(data["summary"]["total"], 2);
    assert_eq!(data["summary"]["delivered"], 2);
    assert_eq!(data["outcomes"].as_object().unwrap().len(), 2);
    for outcome in data["outcomes"].as_object().unwrap().values() {
        assert_eq!(outcome["status"], "delivered");
        assert_eq!(outcome["asset"]["provider_id"], "fixture");
    }
}

#[tokio::test]
async fn submit_returns_request_ids_in_order() {
    let app = build_test_app();
    let response = send_json(
        &app,
        Method::POST,
        "/api/v1/batches",
        json!({
            "project_id": "proj",
            "requests": [
                {
                    "id": "0190a0c0-0000-7000-8000-000000000001",
                    "scene_id": "s",
                    "media_type": "audio",
                    "prompt": "hello"
                },
                {
                    "id": "0190a0c0-0000-7000-8000-000000000002",
                    "scene_id": "s",
                    "media_type": "image",
                    "prompt": "a cat"
                }
            ]
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    assert_eq!(
        json["data"]["request_ids"],
        json!(["0190a0c0-0000-7000-8000-000000000001", "0190a0c0-0000-7000-8000-000000000002"])
    );
}

#[tokio::test]
async fn list_includes_submitted_batches() {
    let app = build_test_app();
    let batch_id = run_batch(&app, vec![image_request("a heron")]).await;

    let json = body_json(get(&app, "/api/v1/batches").await).await;
    let batches = json["data"].as_array().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0]["batch_id"], batch_id);
    assert!(batches[0].get("outcomes").is_none());
}

// ---------------------------------------------------------------------------
// Test: validation and lookup errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_batch_is_rejected_with_400() {
    let app = build_test_app();
    let response = send_json(
        &app,
        Method::POST,
        "/api/v1/batches",
        json!({ "project_id": "proj", "requests": [image_request("   ")] }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "VALIDATION_ERROR");
    assert!(app.service.list().is_empty());
}

#[tokio::test]
async fn empty_batch_is_rejected_with_400() {
    let app = build_test_app();
    let response = send_json(
        &app,
        Method::POST,
        "/api/v1/batches",
        json!({ "project_id": "proj", "requests": [] }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_batch_returns_404() {
    let app = build_test_app();
    let id = "0190a0c0-0000-7000-8000-00000000abcd";

    let response = get(&app, &format!("/api/v1/batches/{id}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["code"], "NOT_FOUND");

    let response = post(&app, &format!("/api/v1/batches/{id}/cancel")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = get(&app, &format!("/api/v1/batches/{id}/errors")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_batch_id_returns_400() {
    let app = build_test_app();
    let response = get(&app, "/api/v1/batches/not-a-uuid").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancelling_a_finished_batch_conflicts() {
    let app = build_test_app();
    let batch_id = run_batch(&app, vec![image_request("a pier")]).await;

    let response = post(&app, &format!("/api/v1/batches/{batch_id}/cancel")).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let json = body_json(response).await;
    assert_eq!(json["code"], "CONFLICT");
}

// ---------------------------------------------------------------------------
// Test: degradation, providers, cache
// ---------------------------------------------------------------------------

#[tokio::test]
async fn degradation_can_be_inspected_and_forced() {
    let app = build_test_app();

    let json = body_json(get(&app, "/api/v1/system/degradation").await).await;
    assert_eq!(json["data"]["current"]["level"], "full");
    assert_eq!(json["data"]["history"], json!([]));

    let response = send_json(
        &app,
        Method::PUT,
        "/api/v1/system/degradation",
        json!({ "level": "emergency", "reason": "maintenance" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["current"]["level"], "emergency");
    assert_eq!(json["data"]["current"]["effects"]["max_concurrent_jobs"], 1);
    assert_eq!(json["data"]["history"][0]["reason"], "maintenance");
    assert_eq!(json["data"]["history"][0]["from"], "full");
}

#[tokio::test]
async fn unknown_degradation_level_is_rejected() {
    let app = build_test_app();
    let response = send_json(
        &app,
        Method::PUT,
        "/api/v1/system/degradation",
        json!({ "level": "panic" }),
    )
    .await;
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn offline_engine_fails_misses_with_service_unavailable() {
    let app = build_test_app();
    send_json(
        &app,
        Method::PUT,
        "/api/v1/system/degradation",
        json!({ "level": "offline" }),
    )
    .await;

    let batch_id = run_batch(&app, vec![image_request("a dark room")]).await;
    let json = body_json(get(&app, &format!("/api/v1/batches/{batch_id}")).await).await;
    let outcome = json["data"]["outcomes"].as_object().unwrap().values().next().unwrap().clone();
    assert_eq!(outcome["status"], "failed");
    assert_eq!(outcome["error"]["kind"], "service_unavailable");

    let errors = body_json(get(&app, &format!("/api/v1/batches/{batch_id}/errors")).await).await;
    assert_eq!(errors["data"].as_array().unwrap().len(), 1);
    assert_eq!(errors["data"][0]["component"], "orchestrator");
}

#[tokio::test]
async fn providers_report_health_and_breaker_state() {
    let app = build_test_app();
    let json = body_json(get(&app, "/api/v1/providers").await).await;
    let providers = json["data"].as_array().unwrap();

    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0]["id"], "fixture");
    assert_eq!(providers[0]["healthy"], true);
    assert_eq!(providers[0]["breaker"]["state"], "closed");
    assert_eq!(providers[0]["media_types"], json!(["image", "audio", "video"]));
}

#[tokio::test]
async fn cache_stats_count_reuse() {
    let app = build_test_app();
    run_batch(&app, vec![image_request("a windmill")]).await;
    run_batch(&app, vec![image_request("a windmill")]).await;

    let json = body_json(get(&app, "/api/v1/cache/stats").await).await;
    assert_eq!(json["data"]["entries"], 1);
    assert_eq!(json["data"]["exact_hits"], 1);
    assert_eq!(json["data"]["inserts"], 1);
}
