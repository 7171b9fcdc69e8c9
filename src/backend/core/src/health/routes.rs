//! Health check HTTP routes

use super::{HealthRegistry, ServingStatus};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Full registry view.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: ServingStatus,
    pub shutting_down: bool,
    pub uptime_seconds: u64,
    pub services: BTreeMap<String, ServingStatus>,
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    pub fn from_registry(registry: &HealthRegistry) -> Self {
        let services = registry.snapshot();
        let serving = !registry.is_shutting_down()
            && services.values().all(|status| *status == ServingStatus::Serving);

        Self {
            status: if serving {
                ServingStatus::Serving
            } else {
                ServingStatus::NotServing
            },
            shutting_down: registry.is_shutting_down(),
            uptime_seconds: registry.uptime().as_secs(),
            services,
            timestamp: Utc::now(),
        }
    }
}

/// Readiness probe response.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Services whose init has not completed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_services: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl ReadinessResponse {
    pub fn from_registry(registry: &HealthRegistry) -> Self {
        let pending_services: Vec<String> = registry
            .snapshot()
            .into_iter()
            .filter(|(name, status)| !name.is_empty() && *status != ServingStatus::Serving)
            .map(|(name, _)| name)
            .collect();

        let reason = if registry.is_shutting_down() {
            Some("shutting down".to_string())
        } else if !registry.is_ready() {
            Some("initialization has not completed".to_string())
        } else {
            None
        };

        Self {
            ready: reason.is_none(),
            reason,
            pending_services,
            timestamp: Utc::now(),
        }
    }
}

/// Liveness probe response.
#[derive(Debug, Clone, Serialize)]
pub struct LivenessResponse {
    pub alive: bool,
    pub timestamp: DateTime<Utc>,
}

/// Probe routes over a shared registry.
pub fn health_routes(registry: HealthRegistry) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(readiness_check))
        .route("/livez", get(liveness_check))
        .with_state(registry)
}

/// GET /healthz - Every registered service
pub async fn health_check(State(registry): State<HealthRegistry>) -> impl IntoResponse {
    let report = HealthReport::from_registry(&registry);
    let status = match report.status {
        ServingStatus::Serving => StatusCode::OK,
        ServingStatus::NotServing => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(report))
}

/// GET /readyz - The overall entry
pub async fn readiness_check(State(registry): State<HealthRegistry>) -> impl IntoResponse {
    let response = ReadinessResponse::from_registry(&registry);
    let status = if response.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

/// GET /livez - Process is up
pub async fn liveness_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(LivenessResponse {
            alive: true,
            timestamp: Utc::now(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get_status(router: Router, path: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_readyz_follows_overall_entry() {
        let registry = HealthRegistry::new();
        registry.prepare(true).await;
        registry.register("db").await;

        let (status, body) = get_status(health_routes(registry.clone()), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["ready"], false);
        assert_eq!(body["pending_services"][0], "db");

        registry.set_serving("db").await;
        registry.mark_ready().await;
        let (status, body) = get_status(health_routes(registry.clone()), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);

        registry.shutdown().await;
        let (status, body) = get_status(health_routes(registry), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["reason"], "shutting down");
    }

    #[tokio::test]
    async fn test_healthz_lists_services() {
        let registry = HealthRegistry::new();
        registry.prepare(false).await;
        registry.set_serving("cache").await;

        let (status, body) = get_status(health_routes(registry), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "SERVING");
        assert_eq!(body["services"]["cache"], "SERVING");
    }

    #[tokio::test]
    async fn test_livez_always_ok() {
        let registry = HealthRegistry::new();
        registry.shutdown().await;
        let (status, body) = get_status(health_routes(registry), "/livez").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["alive"], true);
    }
}
