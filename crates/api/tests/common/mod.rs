#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use reelgen_core::config::{CostModel, EngineConfig};
use reelgen_core::media::MediaType;
use reelgen_events::{ErrorLog, EventBus};
use reelgen_pipeline::{BatchService, Orchestrator};
use reelgen_providers::{FixtureProvider, ProviderRegistry};
use tempfile::TempDir;
use tower::ServiceExt;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use reelgen_api::config::ServerConfig;
use reelgen_api::routes;
use reelgen_api::state::AppState;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
        json_logs: false,
    }
}

/// The router plus the engine behind it. The temp dir holds every output.
pub struct TestApp {
    pub router: Router,
    pub service: Arc<BatchService>,
    pub dir: TempDir,
}

/// Build the full application router with the production middleware stack
/// over a single fixture provider serving every media type.
pub fn build_test_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = EngineConfig::default();
    engine.storage.output_root = dir.path().join("out");
    engine.storage.quarantine_root = dir.path().join("quarantine");

    let registry = ProviderRegistry::new()
        .with(Arc::new(FixtureProvider::new(
            "fixture",
            MediaType::ALL.to_vec(),
            CostModel {
                per_request_usd: 0.02,
                per_second_usd: 0.0,
            },
        )))
        .unwrap();
    let orchestrator = Orchestrator::new(
        engine,
        registry,
        Arc::new(EventBus::default()),
        Arc::new(ErrorLog::new()),
    );
    let service = Arc::new(BatchService::new(orchestrator));

    let state = AppState {
        config: Arc::new(test_config()),
        service: Arc::clone(&service),
    };

    let request_id_header = HeaderName::from_static("x-request-id");
    let router = Router::new()
        .merge(routes::health::router())
        .nest("/api/v1", routes::api_routes())
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .layer(
            CorsLayer::new()
                .allow_origin(["http://localhost:5173".parse().unwrap()])
                .allow_methods([Method::GET, Method::POST, Method::PUT])
                .allow_headers([CONTENT_TYPE]),
        )
        .with_state(state);

    TestApp { router, service, dir }
}

pub async fn get(app: &TestApp, uri: &str) -> Response {
    app.router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn send_json(
    app: &TestApp,
    method: Method,
    uri: &str,
    body: serde_json::Value,
) -> Response {
    app.router
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
}

pub async fn post(app: &TestApp, uri: &str) -> Response {
    app.router
        .clone()
        .oneshot(Request::builder().method(Method::POST).uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
