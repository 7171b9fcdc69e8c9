//! Debug endpoint served by the lead server.
//!
//! - `GET /metrics`: Prometheus text from the installed recorder
//! - `GET /debug/health`: the shared health registry
//! - `GET /debug/leader`: tracked leadership plus a live elector query
//! - `GET /debug/jobs`: upcoming fire times per engine

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use crate::election::{LeaderElectionClient, LeaderElectionState, LeaderStatus, LeadershipTracker};
use crate::health::{HealthReport, HealthRegistry};
use crate::jobs::{JobInfo, JobTable};
use crate::telemetry::MetricsRegistry;

/// State behind the debug routes.
#[derive(Clone)]
pub(crate) struct DebugState {
    pub health: HealthRegistry,
    pub tracker: LeadershipTracker,
    pub jobs: JobTable,
    pub elector: Option<Arc<dyn LeaderElectionClient>>,
}

#[derive(Debug, Serialize)]
struct LeaderReport {
    tracked: LeaderElectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    elector: Option<LeaderStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    elector_error: Option<String>,
}

pub(crate) fn debug_routes(state: DebugState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/debug/health", get(health))
        .route("/debug/leader", get(leader))
        .route("/debug/jobs", get(jobs))
        .with_state(state)
}

async fn metrics() -> impl IntoResponse {
    let body = MetricsRegistry::global()
        .map(MetricsRegistry::render)
        .unwrap_or_default();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

async fn health(State(state): State<DebugState>) -> Json<HealthReport> {
    Json(HealthReport::from_registry(&state.health))
}

async fn leader(State(state): State<DebugState>) -> Json<LeaderReport> {
    let (elector, elector_error) = match &state.elector {
        Some(elector) => match elector.get_lead().await {
            Ok(status) => (Some(status), None),
            Err(e) => (None, Some(e.to_string())),
        },
        None => (None, None),
    };

    Json(LeaderReport {
        tracked: state.tracker.state(),
        elector,
        elector_error,
    })
}

async fn jobs(State(state): State<DebugState>) -> Json<BTreeMap<String, Vec<JobInfo>>> {
    Json(state.jobs.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::MockElector;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state(elector: Option<Arc<dyn LeaderElectionClient>>) -> DebugState {
        DebugState {
            health: HealthRegistry::new(),
            tracker: LeadershipTracker::new(),
            jobs: JobTable::new(),
            elector,
        }
    }

    async fn get_json(router: Router, path: &str) -> serde_json::Value {
        let response = router
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_leader_reports_tracked_and_live_state() {
        let state = state(Some(Arc::new(MockElector::fixed(true))));
        state.tracker.observe(true);

        let body = get_json(debug_routes(state), "/debug/leader").await;
        assert_eq!(body["tracked"]["currently_leader"], true);
        assert_eq!(body["elector"]["is_lead"], true);
        assert!(body.get("elector_error").is_none());
    }

    #[tokio::test]
    async fn test_leader_without_elector() {
        let body = get_json(debug_routes(state(None)), "/debug/leader").await;
        assert_eq!(body["tracked"]["currently_leader"], false);
        assert!(body.get("elector").is_none());
    }

    #[tokio::test]
    async fn test_health_and_jobs() {
        let state = state(None);
        state.health.prepare(false).await;
        state.health.set_serving("db").await;

        let body = get_json(debug_routes(state.clone()), "/debug/health").await;
        assert_eq!(body["services"]["db"], "SERVING");

        let body = get_json(debug_routes(state), "/debug/jobs").await;
        assert!(body.as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metrics_is_plain_text() {
        let response = debug_routes(state(None))
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
    }
}
