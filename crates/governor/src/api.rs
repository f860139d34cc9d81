//! HTTP API for health checks, Prometheus metrics, status and configuration

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use governor_lib::{
    config::TimeSlotReservation,
    control::ControlLoop,
    health::{ComponentStatus, HealthRegistry},
    sink::MemoryLogSink,
    ConfigError, ConfigStore, GovernorLogger, LogCategory,
};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

/// Entries returned by `/logs` when no limit is given
const DEFAULT_LOG_LIMIT: usize = 100;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub control: ControlLoop,
    pub config: ConfigStore,
    pub logs: Arc<MemoryLogSink>,
    pub logger: GovernorLogger,
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        // monitor-only mode lands here and is still operational
        ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Latest governor status, 503 until the first cycle completes
async fn status(State(state): State<Arc<AppState>>) -> Response {
    match state.control.latest_status() {
        Some(status) => Json(status).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "no adjustment cycle has completed yet" })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
    category: Option<LogCategory>,
}

/// Recent scheduler log entries, newest first
async fn logs(State(state): State<Arc<AppState>>, Query(query): Query<LogsQuery>) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    Json(state.logs.recent(limit, query.category))
}

async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let settings = state.config.snapshot();
    Json(settings.as_ref().clone())
}

/// Merge the given window fields onto the current window configuration
async fn put_window(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<serde_json::Value>,
) -> Response {
    let result = state.config.patch_window(&patch);
    config_update_response(&state, result)
}

async fn put_time_slots(
    State(state): State<Arc<AppState>>,
    Json(time_slots): Json<Vec<TimeSlotReservation>>,
) -> Response {
    let result = state.config.replace_time_slots(time_slots);
    config_update_response(&state, result)
}

fn config_update_response(state: &AppState, result: Result<(), ConfigError>) -> Response {
    match result {
        Ok(()) => {
            state.logger.log_config_reload("api", None);
            Json(state.config.snapshot().as_ref().clone()).into_response()
        }
        Err(e) => {
            let message = e.to_string();
            state.logger.log_config_reload("api", Some(&message));
            (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
        }
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .route("/logs", get(logs))
        .route("/config", get(get_config))
        .route("/config/window", put(put_window))
        .route("/config/time-slots", put(put_time_slots))
        .with_state(state)
}

/// Start the API server
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use governor_lib::{
        controller::CgroupController,
        health::components,
        sink::LogSink,
        store::MemorySampleStore,
        GovernorSettings, LogLevel, SchedulerLogEntry,
    };
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApp {
        state: Arc<AppState>,
        // keeps the fake cgroup root alive
        _cgroup_root: TempDir,
    }

    impl TestApp {
        fn router(&self) -> Router {
            create_router(self.state.clone())
        }
    }

    async fn setup_test_app() -> TestApp {
        // no cgroup.controllers file, so the controller runs monitor-only
        let cgroup_root = TempDir::new().unwrap();
        let health_registry = HealthRegistry::new();
        for name in components::ALL {
            health_registry.register(name).await;
        }

        let config = ConfigStore::new(GovernorSettings::default()).unwrap();
        let logs = Arc::new(MemoryLogSink::default());
        let controller = CgroupController::new(cgroup_root.path(), "quota-governor");

        let control = ControlLoop::builder()
            .config(config.clone())
            .sample_store(Arc::new(MemorySampleStore::default()))
            .controller(Arc::new(controller))
            .sink(logs.clone())
            .health(health_registry.clone())
            .node_name("test-node")
            .build()
            .unwrap();

        let state = Arc::new(AppState {
            health_registry,
            control,
            config,
            logs,
            logger: GovernorLogger::new("test-node"),
        });

        TestApp {
            state,
            _cgroup_root: cgroup_root,
        }
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
        };
        (status, value)
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn put_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_healthz_returns_ok_when_healthy() {
        let app = setup_test_app().await;

        let (status, health) = send(app.router(), get_request("/healthz")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["status"], "healthy");
        assert!(health["components"]["controller"].is_object());
    }

    #[tokio::test]
    async fn test_healthz_returns_503_when_unhealthy() {
        let app = setup_test_app().await;
        app.state
            .health_registry
            .set_unhealthy(components::SAMPLER, "no /proc/stat")
            .await;

        let (status, health) = send(app.router(), get_request("/healthz")).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(health["status"], "unhealthy");
    }

    #[tokio::test]
    async fn test_monitor_only_is_degraded_but_ready() {
        let app = setup_test_app().await;
        app.state.control.start().await;

        let (status, health) = send(app.router(), get_request("/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["status"], "degraded");

        let (status, readiness) = send(app.router(), get_request("/readyz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(readiness["ready"], true);
    }

    #[tokio::test]
    async fn test_readyz_returns_503_before_start() {
        let app = setup_test_app().await;

        let (status, readiness) = send(app.router(), get_request("/readyz")).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(readiness["ready"], false);
    }

    #[tokio::test]
    async fn test_status_is_unavailable_before_first_cycle() {
        let app = setup_test_app().await;

        let (status, body) = send(app.router(), get_request("/status")).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_status_reports_advisory_limit_in_monitor_only_mode() {
        let app = setup_test_app().await;
        app.state.control.start().await;
        app.state.control.run_adjustment_cycle().await;

        let (status, body) = send(app.router(), get_request("/status")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_enforcing"], false);
        assert!(body["monitor_reason"].is_string());
        assert_eq!(body["algorithm_used"], "fallback");
        assert_eq!(body["applied_limit"]["enforcing"], false);
    }

    #[tokio::test]
    async fn test_logs_filters_by_category_and_limit() {
        let app = setup_test_app().await;
        for i in 0..3 {
            app.state.logs.append(SchedulerLogEntry::new(
                LogCategory::LimitAdjustment,
                LogLevel::Info,
                format!("adjustment {}", i),
            ));
        }
        app.state.logs.append(SchedulerLogEntry::new(
            LogCategory::ProcessSync,
            LogLevel::Info,
            "sync",
        ));

        let (status, body) = send(
            app.router(),
            get_request("/logs?limit=2&category=limit_adjustment"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let entries = body.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["message"], "adjustment 2");
        assert!(entries.iter().all(|e| e["category"] == "limit_adjustment"));
    }

    #[tokio::test]
    async fn test_get_config_returns_current_settings() {
        let app = setup_test_app().await;

        let (status, body) = send(app.router(), get_request("/config")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["window"]["target_average_limit_percent"], 30.0);
        assert_eq!(body["time_slots"], json!([]));
    }

    #[tokio::test]
    async fn test_put_window_applies_valid_update() {
        let app = setup_test_app().await;

        let (status, body) = send(
            app.router(),
            put_json(
                "/config/window",
                json!({ "window_length_secs": 3600, "max_load_percent": 50.0 }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["window"]["window_length_secs"], 3600);
        assert_eq!(app.state.config.snapshot().window.max_load_percent, 50.0);
    }

    #[tokio::test]
    async fn test_put_window_rejects_invalid_update() {
        let app = setup_test_app().await;

        let (status, body) = send(
            app.router(),
            put_json("/config/window", json!({ "step_length_secs": 0 })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("step_length_secs"));
        assert_eq!(app.state.config.snapshot().window.step_length_secs, 15);
    }

    #[tokio::test]
    async fn test_partial_window_update_keeps_other_fields() {
        let app = setup_test_app().await;
        send(
            app.router(),
            put_json("/config/window", json!({ "window_length_secs": 3600 })),
        )
        .await;

        let (status, body) = send(
            app.router(),
            put_json("/config/window", json!({ "max_load_percent": 50.0 })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["window"]["window_length_secs"], 3600);
        assert_eq!(body["window"]["max_load_percent"], 50.0);
    }

    #[tokio::test]
    async fn test_window_update_with_unknown_field_is_rejected() {
        let app = setup_test_app().await;

        let (status, body) = send(
            app.router(),
            put_json("/config/window", json!({ "target": 20.0 })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("unknown field"));
    }

    #[tokio::test]
    async fn test_put_time_slots_replaces_reservations() {
        let app = setup_test_app().await;

        let (status, body) = send(
            app.router(),
            put_json(
                "/config/time-slots",
                json!([{ "name": "batch", "start": "22:00", "end": "02:00", "required_load_percent": 30.0 }]),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["time_slots"][0]["name"], "batch");
        assert_eq!(app.state.config.snapshot().time_slots.len(), 1);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_returns_prometheus_format() {
        let app = setup_test_app().await;
        app.state.control.start().await;
        app.state.control.run_adjustment_cycle().await;

        let response = app.router().oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().contains("text/plain"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let metrics_text = String::from_utf8(body.to_vec()).unwrap();

        assert!(metrics_text.contains("quota_governor_final_limit_percent"));
        assert!(metrics_text.contains("quota_governor_cycle_latency_seconds_bucket"));
        assert!(metrics_text.contains("quota_governor_enforcing"));
    }
}
