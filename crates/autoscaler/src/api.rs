//! HTTP API for health checks, Prometheus metrics and the status summary

use autoscaler_lib::{ComponentStatus, HealthRegistry, StatusHandle};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub status: StatusHandle,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, status: StatusHandle) -> Self {
        Self {
            health_registry,
            status,
        }
    }
}

/// Health check response - returns 200 if healthy, 503 if degraded/unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
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

/// Latest published status summary
async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = state.status.read().await.clone();
    Json(status)
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoscaler_lib::{Collaborator, ScalerMetrics, ScalerStatus};
    use chrono::Utc;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn create_test_state() -> Arc<AppState> {
        let status = ScalerStatus::new("prod", "idle-based").handle();
        Arc::new(AppState::new(HealthRegistry::new(), status))
    }

    async fn get(state: Arc<AppState>, uri: &str) -> (StatusCode, serde_json::Value) {
        let app = create_router(state);
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let code = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (code, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn test_healthz_healthy() {
        let state = create_test_state();
        state
            .health_registry
            .register(Collaborator::Snapshot, Utc::now())
            .await;

        let (code, body) = get(state, "/healthz").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_healthz_degraded_is_still_ok() {
        let state = create_test_state();
        state
            .health_registry
            .set_degraded(
                Collaborator::Provisioner,
                "launch rejected",
                vec!["m5.xlarge".to_string()],
                Utc::now(),
            )
            .await;

        let (code, body) = get(state, "/healthz").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["components"]["provisioner"]["subjects"][0], "m5.xlarge");
    }

    #[tokio::test]
    async fn test_healthz_unhealthy() {
        let state = create_test_state();
        state
            .health_registry
            .set_unhealthy(Collaborator::Snapshot, "orchestrator unreachable", Utc::now())
            .await;

        let (code, _) = get(state, "/healthz").await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readyz_before_first_tick() {
        let (code, body) = get(create_test_state(), "/readyz").await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["ready"], false);
    }

    #[tokio::test]
    async fn test_readyz_after_first_tick() {
        let state = create_test_state();
        state.health_registry.record_tick(Utc::now()).await;

        let (code, body) = get(state, "/readyz").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["ready"], true);
    }

    #[tokio::test]
    async fn test_status_returns_published_summary() {
        let state = create_test_state();
        {
            let mut status = state.status.write().await;
            status.fleet_size = 3;
            status.launched_total = 2;
        }

        let (code, body) = get(state, "/status").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["cluster_id"], "prod");
        assert_eq!(body["fleet_size"], 3);
        assert_eq!(body["launched_total"], 2);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        ScalerMetrics::new().set_fleet_size(4);

        let app = create_router(create_test_state());
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("fleet_autoscaler_fleet_size"));
    }
}
