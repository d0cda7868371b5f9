/**
 * HTTP API - trigger, status and read endpoints of the sync service
 *
 * ROUTES:
 * - GET  /health         plain liveness probe
 * - GET  /system/health  uptime, roster size, sync phase, cycle counters
 * - GET  /sync           last sync log and snapshot row counts
 * - POST /sync           run a cycle plus retention (x-api-key required)
 * - GET  /db/pnodes      latest node snapshot group
 * - GET  /db/network     latest network snapshot
 * - GET  /prpc           live proxy: `?ip=<addr>` or `?all=true`
 *
 * SECURITY:
 * Only the trigger is guarded. With no key configured it answers 401.
 */

use crate::health::{HealthTracker, ServiceHealth};
use crate::store::StoreError;
use crate::sync::SyncService;
use axum::extract::{Query, Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{error, warn};

const NO_DATA: &str = "No data available. Run sync first.";

#[derive(Clone)]
pub struct AppState {
    pub sync: Arc<SyncService>,
    pub health_tracker: HealthTracker,
    pub api_key: Option<String>,
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

fn store_failure(e: StoreError) -> Response {
    error!(error = %e, "store read failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "error": e.to_string(), "timestamp": now_rfc3339() })),
    )
        .into_response()
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": "Unauthorized - Invalid API key" }))).into_response()
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Response {
    // only the trigger mutates anything
    if !(*req.method() == Method::POST && req.uri().path() == "/sync") {
        return next.run(req).await;
    }

    let Some(expected) = app.api_key.as_deref().filter(|k| !k.is_empty()) else {
        warn!("SYNC_API_KEY not set, trigger refused");
        return unauthorized();
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!("trigger refused: bad or missing x-api-key");
        return unauthorized();
    }
    next.run(req).await
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/sync", get(get_sync_status).post(trigger_sync))
        .route("/db/pnodes", get(get_latest_pnodes))
        .route("/db/network", get(get_latest_network))
        .route("/prpc", get(proxy_prpc))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<ServiceHealth> {
    Json(app.health_tracker.get_health(&app.sync))
}

// GET /sync
async fn get_sync_status(State(app): State<AppState>) -> Response {
    match app.sync.status().await {
        Ok(status) => Json(json!({
            "success": true,
            "lastSync": status.last_sync,
            "snapshotCounts": status.snapshot_counts,
            "timestamp": now_rfc3339(),
        }))
        .into_response(),
        Err(e) => store_failure(e),
    }
}

// POST /sync
async fn trigger_sync(State(app): State<AppState>) -> Response {
    match app.sync.trigger().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            error!(error = %e, "manual sync aborted");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": e.to_string(), "timestamp": now_rfc3339() })),
            )
                .into_response()
        }
    }
}

// GET /db/pnodes
async fn get_latest_pnodes(State(app): State<AppState>) -> Response {
    let nodes = match app.sync.latest_nodes().await {
        Ok(nodes) => nodes,
        Err(e) => return store_failure(e),
    };
    let mut body = json!({
        "success": true,
        "total": nodes.len(),
        "timestamp": now_rfc3339(),
    });
    match nodes.first().map(|n| n.created_at.format(&Rfc3339).unwrap_or_default()) {
        Some(last) => body["lastUpdated"] = Value::String(last),
        None => body["message"] = Value::from(NO_DATA),
    }
    body["pnodes"] = json!(nodes);
    Json(body).into_response()
}

// GET /db/network
async fn get_latest_network(State(app): State<AppState>) -> Response {
    let stats = match app.sync.latest_network().await {
        Ok(stats) => stats,
        Err(e) => return store_failure(e),
    };
    let mut body = json!({ "success": true, "stats": stats, "timestamp": now_rfc3339() });
    match stats {
        Some(s) => body["lastUpdated"] = Value::String(s.created_at.format(&Rfc3339).unwrap_or_default()),
        None => body["message"] = Value::from(NO_DATA),
    }
    Json(body).into_response()
}

#[derive(Debug, Deserialize)]
struct ProxyParams {
    ip: Option<String>,
    all: Option<String>,
}

// GET /prpc?ip=<addr> | ?all=true
async fn proxy_prpc(State(app): State<AppState>, Query(params): Query<ProxyParams>) -> Response {
    if params.all.as_deref() == Some("true") {
        let live = app.sync.probe_all().await;
        return Json(json!({
            "success": true,
            "totalNodes": live.total_nodes,
            "activeNodes": live.active_nodes,
            "nodes": live.nodes,
        }))
        .into_response();
    }

    let Some(ip) = params.ip.filter(|ip| !ip.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Missing 'ip' parameter. Use ?ip=<ip_address> or ?all=true" })),
        )
            .into_response();
    };
    if !app.sync.on_roster(&ip) {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "Invalid pNode IP address" }))).into_response();
    }

    match app.sync.probe(&ip).await {
        Ok(stats) => Json(json!({ "success": true, "ip": ip, "stats": stats })).into_response(),
        Err(e) => {
            warn!(error = %e, "live probe failed");
            (StatusCode::BAD_GATEWAY, Json(json!({ "error": "Failed to fetch pNode stats", "ip": ip })))
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::tests::{Reply, ScriptedSource};
    use crate::prpc::tests::sample_stats;
    use crate::retention::RetentionPolicy;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app(api_key: Option<&str>) -> Router {
        let source = Arc::new(ScriptedSource::new([
            ("192.190.136.36", Reply::Stats(sample_stats(104_857_600, 86_400))),
            ("161.97.97.41", Reply::Down),
        ]));
        let sync = SyncService::new(
            vec!["192.190.136.36".into(), "161.97.97.41".into()],
            source,
            Arc::new(MemoryStore::new()),
            RetentionPolicy::default(),
            35.0,
        );
        build_router(AppState {
            sync: Arc::new(sync),
            health_tracker: HealthTracker::new(),
            api_key: api_key.map(str::to_string),
        })
    }

    async fn send(router: &Router, method: &str, uri: &str, key: Option<&str>) -> (StatusCode, Value) {
        let mut req = HttpRequest::builder().method(method).uri(uri);
        if let Some(key) = key {
            req = req.header("x-api-key", key);
        }
        let resp = router.clone().oneshot(req.body(Body::empty()).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_health_is_plain_ok() {
        let resp = app(None)
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn test_trigger_requires_key() {
        let router = app(Some("secret"));
        let (status, body) = send(&router, "POST", "/sync", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Unauthorized - Invalid API key");
        assert_eq!(send(&router, "POST", "/sync", Some("wrong")).await.0, StatusCode::UNAUTHORIZED);
        // nothing ran
        let (_, status) = send(&router, "GET", "/sync", None).await;
        assert!(status["lastSync"].is_null());
    }

    #[tokio::test]
    async fn test_trigger_refused_without_configured_key() {
        let router = app(None);
        let (status, body) = send(&router, "POST", "/sync", Some("")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Unauthorized - Invalid API key");
    }

    #[tokio::test]
    async fn test_trigger_then_read_back() {
        let router = app(Some("secret"));

        let (_, empty) = send(&router, "GET", "/db/pnodes", None).await;
        assert_eq!(empty["total"], 0);
        assert_eq!(empty["message"], NO_DATA);
        let (_, empty) = send(&router, "GET", "/db/network", None).await;
        assert!(empty["stats"].is_null());
        assert_eq!(empty["message"], NO_DATA);

        let (status, report) = send(&router, "POST", "/sync", Some("secret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["success"], true);
        assert_eq!(report["sync"]["nodesQueried"], 2);
        assert_eq!(report["sync"]["nodesSuccess"], 1);
        assert_eq!(report["sync"]["nodesFailed"], 1);
        assert_eq!(report["cleanup"]["deletedPNodes"], 0);
        assert!(report["timestamp"].is_string());

        let (_, pnodes) = send(&router, "GET", "/db/pnodes", None).await;
        assert_eq!(pnodes["total"], 1);
        assert_eq!(pnodes["pnodes"][0]["ipAddress"], "192.190.136.36");
        assert_eq!(pnodes["pnodes"][0]["region"], "US East");
        assert!(pnodes.get("message").is_none());

        let (_, network) = send(&router, "GET", "/db/network", None).await;
        assert_eq!(network["stats"]["totalPNodes"], 2);
        assert_eq!(network["stats"]["activePNodes"], 1);
        assert_eq!(network["stats"]["totalStorage"], 136_314_880u64);
        assert_eq!(network["stats"]["averageUptime"], 95.5);

        let (_, status) = send(&router, "GET", "/sync", None).await;
        assert_eq!(status["lastSync"]["nodesSuccess"], 1);
        assert_eq!(status["snapshotCounts"]["pnodes"], 1);
        assert_eq!(status["snapshotCounts"]["networkStats"], 1);

        let (_, health) = send(&router, "GET", "/system/health", None).await;
        assert_eq!(health["roster_size"], 2);
        assert_eq!(health["sync_phase"], "completed");
        assert_eq!(health["cycles_completed"], 1);
    }

    #[tokio::test]
    async fn test_prpc_proxy() {
        let router = app(None);

        let (status, body) = send(&router, "GET", "/prpc?ip=192.190.136.36", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stats"]["file_size"], 104_857_600u64);

        let (status, _) = send(&router, "GET", "/prpc", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, body) = send(&router, "GET", "/prpc?ip=10.0.0.1", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid pNode IP address");
        let (status, body) = send(&router, "GET", "/prpc?ip=161.97.97.41", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["ip"], "161.97.97.41");

        let (status, all) = send(&router, "GET", "/prpc?all=true", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(all["totalNodes"], 2);
        assert_eq!(all["activeNodes"], 1);
        assert_eq!(all["nodes"][0]["ip"], "192.190.136.36");
    }
}
