use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use beacon_core::ids::IncidentId;
use beacon_core::incident::{IncidentEvent, IncidentPatch, NewIncident};
use beacon_settings::{BeaconSettings, FanoutSettings};
use beacon_telemetry::{MetricSample, MetricsRecorder};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::alerts::{AlertReport, AlertService};
use crate::broker::SignalingBroker;
use crate::collab::{Authenticator, IncidentStore, NoopPush, PushNotifier};
use crate::errors::ServerError;
use crate::gateway::Gateway;
use crate::health::{self, HealthResponse};
use crate::registry::ConnectionRegistry;
use crate::router::FanoutRouter;
use crate::transport;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub max_send_drops: u64,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub require_token: bool,
    pub fanout: FanoutSettings,
}

impl ServerConfig {
    pub fn from_settings(settings: &BeaconSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_send_queue: settings.server.max_send_queue,
            max_send_drops: settings.server.max_send_drops,
            idle_timeout: Duration::from_secs(settings.server.idle_timeout_secs),
            sweep_interval: Duration::from_secs(settings.server.sweep_interval_secs),
            require_token: settings.auth.require_token,
            fanout: settings.fanout.clone(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&BeaconSettings::default())
    }
}

/// External services the relay is wired to.
pub struct Collaborators {
    pub store: Arc<dyn IncidentStore>,
    pub push: Arc<dyn PushNotifier>,
    pub auth: Option<Arc<dyn Authenticator>>,
    pub metrics: Option<Arc<MetricsRecorder>>,
}

impl Collaborators {
    pub fn new(store: Arc<dyn IncidentStore>) -> Self {
        Self {
            store,
            push: Arc::new(NoopPush),
            auth: None,
            metrics: None,
        }
    }
}

/// Shared application state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub alerts: Arc<AlertService>,
    pub metrics: Option<Arc<MetricsRecorder>>,
    pub start_time: Instant,
}

impl AppState {
    /// Construct the registry, router, broker, gateway and alert service.
    pub fn new(config: &ServerConfig, collab: Collaborators) -> Self {
        let metrics = collab.metrics;
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(FanoutRouter::new(
            registry,
            config.max_send_drops,
            metrics.clone(),
        ));
        let broker = Arc::new(
            SignalingBroker::new(metrics.clone()).with_max_send_drops(config.max_send_drops),
        );

        let mut gateway = Gateway::new(
            router.clone(),
            broker,
            config.max_send_queue,
            metrics.clone(),
        );
        if let Some(auth) = collab.auth {
            gateway = gateway.with_auth(auth, config.require_token);
        } else if config.require_token {
            warn!("requireToken is set but no authenticator is configured; registers will be dropped");
            gateway = gateway.with_auth(Arc::new(crate::collab::StaticTokenAuth::default()), true);
        }

        let alerts = AlertService::new(
            collab.store,
            router,
            collab.push,
            config.fanout.clone(),
            metrics.clone(),
        );

        Self {
            gateway: Arc::new(gateway),
            alerts: Arc::new(alerts),
            metrics,
            start_time: Instant::now(),
        }
    }
}

/// Build the axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/incidents", post(report_handler))
        .route("/incidents/active", get(active_handler))
        .route("/incidents/{id}", patch(update_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind, spawn the server and the idle sweep, and return a handle.
pub async fn start(config: ServerConfig, collab: Collaborators) -> Result<ServerHandle, ServerError> {
    let state = AppState::new(&config, collab);
    let gateway = state.gateway.clone();
    let shutdown = CancellationToken::new();

    let sweep = transport::start_sweep_task(
        gateway.clone(),
        config.sweep_interval,
        config.idle_timeout,
        shutdown.clone(),
    );

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local_addr = listener.local_addr()?;

    let router = build_router(state);
    let serve_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
            .await
        {
            warn!(error = %e, "server exited with error");
        }
    });

    info!(
        host = %config.host,
        port = local_addr.port(),
        radius_km = config.fanout.radius_km,
        "beacon relay started"
    );

    Ok(ServerHandle {
        port: local_addr.port(),
        gateway,
        shutdown,
        server,
        sweep,
    })
}

/// Handle returned by [`start`]; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    gateway: Arc<Gateway>,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    sweep: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Stop accepting, close every connection, and wait for tasks to drain.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.gateway.close_all();

        let drain = futures::future::join_all([self.server, self.sweep]);
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
            warn!("shutdown timed out after {SHUTDOWN_TIMEOUT:?}");
        } else {
            info!("beacon relay stopped");
        }
    }
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| transport::handle_ws_connection(socket, state.gateway))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.gateway.connection_count(),
        state.gateway.room_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(m) => Json::<Vec<MetricSample>>(m.snapshot()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "metrics disabled" })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportRequest {
    #[serde(flatten)]
    incident: NewIncident,
    radius_km: Option<f64>,
}

/// POST /incidents
async fn report_handler(
    State(state): State<AppState>,
    Json(req): Json<ReportRequest>,
) -> Result<(StatusCode, Json<AlertReport>), ServerError> {
    let report = state.alerts.report(&req.incident, req.radius_km)?;
    Ok((StatusCode::CREATED, Json(report)))
}

/// PATCH /incidents/{id}
async fn update_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<IncidentPatch>,
) -> Result<Response, ServerError> {
    let id = IncidentId::from_raw(id);
    Ok(match state.alerts.update(&id, &patch)? {
        Some(event) => Json(event).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("incident {id} not found") })),
        )
            .into_response(),
    })
}

/// GET /incidents/active
async fn active_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<IncidentEvent>>, ServerError> {
    Ok(Json(state.alerts.active()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use beacon_store::{Database, IncidentRepo};
    use tower::ServiceExt;

    fn state_with_metrics(metrics: Option<Arc<MetricsRecorder>>) -> AppState {
        let store = Arc::new(IncidentRepo::new(Database::in_memory().unwrap()));
        let mut collab = Collaborators::new(store);
        collab.metrics = metrics;
        AppState::new(&ServerConfig::default(), collab)
    }

    async fn call(app: Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn config_from_settings() {
        let mut settings = BeaconSettings::default();
        settings.server.port = 0;
        settings.fanout.radius_km = 1.5;
        settings.auth.require_token = true;
        let config = ServerConfig::from_settings(&settings);
        assert_eq!(config.port, 0);
        assert_eq!(config.fanout.radius_km, 1.5);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
        assert!(config.require_token);
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let state = state_with_metrics(None);
        let (_conn, _rx) = state.gateway.connect();
        let app = build_router(state);

        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = call(app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 1);
        assert_eq!(body["rooms"], 0);
    }

    #[tokio::test]
    async fn report_update_and_list_incidents() {
        let state = state_with_metrics(None);
        let app = build_router(state);

        let (status, report) = call(
            app.clone(),
            json_request(
                "POST",
                "/incidents",
                serde_json::json!({"lat": 37.7749, "lng": -122.4194, "category": "fire", "radiusKm": 1.0}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(report["radiusKm"], 1.0);
        let id = report["incident"]["id"].as_str().unwrap().to_string();

        let (status, active) = call(
            app.clone(),
            Request::builder().uri("/incidents/active").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(active.as_array().unwrap().len(), 1);

        let (status, updated) = call(
            app.clone(),
            json_request(
                "PATCH",
                &format!("/incidents/{id}"),
                serde_json::json!({"status": "resolved"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["status"], "resolved");

        let (_, active) = call(
            app,
            Request::builder().uri("/incidents/active").body(Body::empty()).unwrap(),
        )
        .await;
        assert!(active.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_report_is_bad_request() {
        let app = build_router(state_with_metrics(None));
        let (status, body) = call(
            app,
            json_request(
                "POST",
                "/incidents",
                serde_json::json!({"lat": 91.0, "lng": 0.0, "category": "fire"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("latitude"));
    }

    #[tokio::test]
    async fn patch_unknown_incident_is_not_found() {
        let app = build_router(state_with_metrics(None));
        let (status, _) = call(
            app,
            json_request(
                "PATCH",
                "/incidents/inc_missing",
                serde_json::json!({"status": "resolved"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_endpoint() {
        let metrics = Arc::new(MetricsRecorder::new());
        let state = state_with_metrics(Some(metrics));
        let (_conn, _rx) = state.gateway.connect();
        let (status, body) = call(
            build_router(state),
            Request::builder().uri("/metrics").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let samples = body.as_array().unwrap();
        assert!(samples
            .iter()
            .any(|s| s["name"] == "ws_connections_active" && s["value"] == 1.0));

        let (status, _) = call(
            build_router(state_with_metrics(None)),
            Request::builder().uri("/metrics").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let app = build_router(state_with_metrics(None));
        let req = Request::builder().uri("/nonexistent").body(Body::empty()).unwrap();
        let (status, _) = call(app, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        };
        let store = Arc::new(IncidentRepo::new(Database::in_memory().unwrap()));
        let handle = start(config, Collaborators::new(store)).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");

        handle.shutdown().await;
    }
}
