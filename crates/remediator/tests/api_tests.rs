//! Integration tests for the remediator API endpoints

#[path = "../src/api.rs"]
#[allow(dead_code)]
mod api;

use api::{create_router, AppState};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use remediator_lib::{
    health::{components, HealthRegistry},
    observability::RemediatorMetrics,
};
use std::sync::Arc;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, HealthRegistry) {
    let health_registry = HealthRegistry::with_default_components().await;
    let state = Arc::new(AppState::new(health_registry.clone()));
    (create_router(state), health_registry)
}

async fn get(app: Router, uri: &str) -> (StatusCode, String) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn test_healthz_all_healthy() {
    let (app, _) = setup_test_app().await;

    let (status, body) = get(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["components"]["control_loop"]["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_degraded_still_ok() {
    let (app, health) = setup_test_app().await;
    health
        .set_degraded(components::RECORDER, "3 incident(s) pending")
        .await;

    let (status, body) = get(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "degraded");
    assert_eq!(
        json["components"]["recorder"]["message"],
        "3 incident(s) pending"
    );
}

#[tokio::test]
async fn test_healthz_unhealthy_returns_503() {
    let (app, health) = setup_test_app().await;
    health
        .set_unhealthy(components::CONTROL_LOOP, "loop exited")
        .await;

    let (status, _) = get(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_readyz_before_and_after_first_cycle() {
    let (app, health) = setup_test_app().await;

    let (status, body) = get(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["ready"], false);

    health.set_ready(true).await;

    let (status, body) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["ready"], true);
}

#[tokio::test]
async fn test_metrics_exposes_remediator_series() {
    let metrics = RemediatorMetrics::new();
    metrics.inc_remediations();
    metrics.set_pending_incidents(1);

    let (app, _) = setup_test_app().await;
    let (status, body) = get(app, "/metrics").await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("remediator_remediations_total"));
    assert!(body.contains("remediator_pending_incidents"));
    assert!(body.contains("remediator_cycle_duration_seconds"));
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (app, _) = setup_test_app().await;

    let (status, _) = get(app, "/nope").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}
