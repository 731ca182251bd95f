//! Integration tests for observability
//!
//! These tests verify that metrics, timers and health checks work
//! correctly when integrated together.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use switchyard_observability::{
    CircuitBreakerState, HealthState, Metrics, ReadinessChecker, TimerRegistry, health_router,
};
use tower::ServiceExt;

// Readiness checker driven by a route count that tests can change
struct RouteCountChecker {
    routes: AtomicUsize,
}

impl ReadinessChecker for RouteCountChecker {
    fn is_ready(&self) -> bool {
        self.routes.load(Ordering::SeqCst) > 0
    }

    fn route_count(&self) -> usize {
        self.routes.load(Ordering::SeqCst)
    }
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_recorded_values() {
    let metrics = Arc::new(Metrics::new().unwrap());

    metrics.record_request("api", 200, 0.020);
    metrics.record_request("api", 502, 0.001);
    metrics.record_upstream_error("api", "dial");
    metrics.record_circuit_breaker_transition(
        "http://10.0.0.9/",
        CircuitBreakerState::Closed,
        CircuitBreakerState::Open,
    );
    metrics.record_table_published(2);
    metrics.record_tcp_connection("proxied");

    let app = health_router(HealthState::new(metrics));
    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_string(response).await;
    assert!(body.contains("switchyard_requests_total{service=\"api\",status=\"2xx\"} 1"));
    assert!(body.contains("switchyard_requests_total{service=\"api\",status=\"5xx\"} 1"));
    assert!(body.contains("switchyard_upstream_errors_total{kind=\"dial\",service=\"api\"} 1"));
    assert!(body.contains("switchyard_circuit_breaker_state{target=\"http://10.0.0.9/\"} 1"));
    assert!(body.contains("switchyard_routes 2"));
    assert!(body.contains("switchyard_tcp_connections_total{outcome=\"proxied\"} 1"));
}

#[tokio::test]
async fn test_readiness_follows_route_count() {
    let metrics = Arc::new(Metrics::new().unwrap());
    let checker = Arc::new(RouteCountChecker {
        routes: AtomicUsize::new(0),
    });
    let app = health_router(HealthState::with_readiness_checker(
        metrics,
        checker.clone(),
    ));

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    checker.routes.store(5, Ordering::SeqCst);
    let response = app
        .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("\"routes\":5"));
}

#[tokio::test]
async fn test_timers_are_safe_under_concurrent_updates() {
    let registry = Arc::new(TimerRegistry::new());
    let mut handles = Vec::new();
    for _ in 0..8 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..500u64 {
                registry
                    .timer("svc|http://h1/")
                    .update(Duration::from_micros(i));
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let snapshot = registry.snapshot("svc|http://h1/").unwrap();
    assert_eq!(snapshot.count, 4000);
    assert!(snapshot.p99 > 0.0);
}
