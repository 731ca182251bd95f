//! Admin JSON API
//!
//! - `GET /api/routes`: the active table, one entry per target
//! - `GET /api/paths`: manual entry paths
//! - `GET /api/manual[/{path}]`: a manual entry with its version
//! - `PUT /api/manual[/{path}]`: replace a manual entry; 409 when the
//!   supplied version is stale

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use switchyard_core::{Error as CoreError, ManualEntry, Registry, parse_program};
use switchyard_observability::TimerRegistry;
use switchyard_routing::TablePublisher;
use tracing::{info, warn};

/// Shared state of the admin handlers
#[derive(Clone)]
pub struct AdminState {
    pub publisher: Arc<TablePublisher>,
    pub registry: Arc<dyn Registry>,
    pub timers: Arc<TimerRegistry>,
}

/// One target of the active table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub service: String,
    pub host: String,
    pub path: String,
    pub dst: String,
    /// Normalized share of the route's traffic
    pub weight: f64,
    pub tags: Vec<String>,
    /// Canonical `route add` command for the target
    pub cmd: String,
    /// Requests per second, one-minute moving average
    pub rate1: f64,
    /// 99th percentile latency in milliseconds
    pub pct99: f64,
}

#[derive(Debug, Deserialize)]
pub struct ManualUpdate {
    pub value: String,
    #[serde(default)]
    pub version: u64,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Admin API error
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error(transparent)]
    Registry(#[from] CoreError),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let AdminError::Registry(err) = &self;
        let status = match err {
            CoreError::VersionConflict { .. } => StatusCode::CONFLICT,
            CoreError::ManualNotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Parse(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %err, "admin request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: err.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/api/routes", get(list_routes))
        .route("/api/paths", get(list_paths))
        .route("/api/manual", get(read_root).put(write_root))
        .route("/api/manual/{*path}", get(read_path).put(write_path))
        .with_state(state)
}

/// Flatten the active table into admin entries
pub fn route_entries(publisher: &TablePublisher, timers: &TimerRegistry) -> Vec<RouteEntry> {
    let table = publisher.load();
    let mut entries = Vec::new();
    for route in table.routes() {
        let weights = route.normalized_weights();
        for (i, target) in route.targets.iter().enumerate() {
            let snapshot = timers.snapshot(target.key());
            entries.push(RouteEntry {
                service: target.service.clone(),
                host: route.host.clone(),
                path: route.path.clone(),
                dst: target.dst().to_string(),
                weight: weights.get(i).copied().unwrap_or_default(),
                tags: target.tags.clone(),
                cmd: route.command_for(target).to_string(),
                rate1: snapshot.map(|s| s.rate1).unwrap_or_default(),
                pct99: snapshot.map(|s| s.p99).unwrap_or_default(),
            });
        }
    }
    entries
}

async fn list_routes(State(state): State<AdminState>) -> Json<Vec<RouteEntry>> {
    Json(route_entries(&state.publisher, &state.timers))
}

async fn list_paths(State(state): State<AdminState>) -> Result<Json<Vec<String>>, AdminError> {
    Ok(Json(state.registry.manual_paths().await?))
}

async fn read_root(State(state): State<AdminState>) -> Result<Json<ManualEntry>, AdminError> {
    read_manual(&state, "").await
}

async fn read_path(
    State(state): State<AdminState>,
    Path(path): Path<String>,
) -> Result<Json<ManualEntry>, AdminError> {
    read_manual(&state, &path).await
}

async fn write_root(
    State(state): State<AdminState>,
    Json(update): Json<ManualUpdate>,
) -> Result<Json<ManualEntry>, AdminError> {
    write_manual(&state, "", update).await
}

async fn write_path(
    State(state): State<AdminState>,
    Path(path): Path<String>,
    Json(update): Json<ManualUpdate>,
) -> Result<Json<ManualEntry>, AdminError> {
    write_manual(&state, &path, update).await
}

async fn read_manual(state: &AdminState, path: &str) -> Result<Json<ManualEntry>, AdminError> {
    Ok(Json(state.registry.read_manual(path).await?))
}

async fn write_manual(
    state: &AdminState,
    path: &str,
    update: ManualUpdate,
) -> Result<Json<ManualEntry>, AdminError> {
    // a stored entry that fails to parse would block every later table build
    parse_program(&update.value).map_err(CoreError::from)?;
    let version = state
        .registry
        .write_manual(path, &update.value, update.version)
        .await?;
    info!(path = %path, version, "manual overrides updated");
    Ok(Json(ManualEntry {
        value: update.value,
        version,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use switchyard_registry::MemoryRegistry;
    use switchyard_routing::{MatcherKind, Table};
    use tower::ServiceExt;

    fn state(program: &str) -> AdminState {
        let publisher = Arc::new(TablePublisher::new(None));
        publisher.publish(Table::compile(program, MatcherKind::Prefix).unwrap());
        AdminState {
            publisher,
            registry: Arc::new(MemoryRegistry::new("manual")),
            timers: Arc::new(TimerRegistry::new()),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn put(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn test_route_entries() {
        let state = state(
            "route add a app.com/ http://h1:8081/ weight 0.25 tags \"blue,v1\"\n\
             route add a app.com/ http://h2:8082/ weight 0.75",
        );
        let key = {
            let table = state.publisher.load();
            table.lookup("app.com", "/").unwrap().targets[0].key().to_string()
        };
        state.timers.timer(&key).update(Duration::from_millis(20));

        let entries = route_entries(&state.publisher, &state.timers);
        assert_eq!(entries.len(), 2);
        let h1 = entries.iter().find(|e| e.dst == "http://h1:8081/").unwrap();
        assert_eq!(h1.host, "app.com");
        assert_eq!(h1.path, "/");
        assert!((h1.weight - 0.25).abs() < 1e-9);
        assert_eq!(h1.tags, vec!["blue", "v1"]);
        assert!(h1.cmd.starts_with("route add a app.com/ http://h1:8081/"));
        assert!(h1.pct99 > 0.0);

        let h2 = entries.iter().find(|e| e.dst == "http://h2:8082/").unwrap();
        assert_eq!(h2.rate1, 0.0);
    }

    #[tokio::test]
    async fn test_get_routes() {
        let router = admin_router(state("route add svc / http://10.0.0.1:8080/"));
        let response = router
            .oneshot(Request::get("/api/routes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json[0]["service"], "svc");
        assert_eq!(json[0]["dst"], "http://10.0.0.1:8080/");
        assert_eq!(json[0]["weight"], 1.0);
    }

    #[tokio::test]
    async fn test_manual_read_write_and_conflict() {
        let router = admin_router(state(""));

        let response = router
            .clone()
            .oneshot(Request::get("/api/manual").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["value"], "");
        assert_eq!(json["version"], 0);

        let response = router
            .clone()
            .oneshot(put(
                "/api/manual",
                serde_json::json!({"value": "route del s0", "version": 0}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let version = body_json(response).await["version"].as_u64().unwrap();
        assert!(version > 0);

        let response = router
            .clone()
            .oneshot(put(
                "/api/manual",
                serde_json::json!({"value": "route del s1", "version": 0}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(body_json(response).await["error"].is_string());

        let response = router
            .oneshot(Request::get("/api/manual").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["value"], "route del s0");
        assert_eq!(json["version"], version);
    }

    #[tokio::test]
    async fn test_invalid_manual_program_is_rejected() {
        let router = admin_router(state(""));
        let response = router
            .clone()
            .oneshot(put(
                "/api/manual",
                serde_json::json!({"value": "route del s0", "version": 0}),
            ))
            .await
            .unwrap();
        let version = body_json(response).await["version"].as_u64().unwrap();

        let response = router
            .clone()
            .oneshot(put(
                "/api/manual",
                serde_json::json!({"value": "route weight s / 0.1", "version": version}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error = body_json(response).await["error"].as_str().unwrap().to_string();
        assert!(error.contains("line 1"), "{}", error);

        let response = router
            .oneshot(Request::get("/api/manual").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["value"], "route del s0");
        assert_eq!(json["version"], version);
    }

    #[tokio::test]
    async fn test_manual_subpaths() {
        let router = admin_router(state(""));
        let response = router
            .clone()
            .oneshot(put(
                "/api/manual/canary/eu",
                serde_json::json!({"value": "route weight s / weight 0.1 tags \"canary\"", "version": 0}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(Request::get("/api/paths").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json, serde_json::json!(["canary/eu"]));
    }
}
