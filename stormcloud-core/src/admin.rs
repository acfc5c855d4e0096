use axum::{extract::State, routing::get, Json, Router};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Shared state for metrics
#[derive(Debug, Default)]
pub struct Metrics {
    pub total_requests: AtomicU64,
    pub bypassed: AtomicU64,
    pub rules_created: AtomicU64,
    pub create_conflicts: AtomicU64,
    pub delegated: AtomicU64,
    pub delayed: AtomicU64,
    pub configuration_errors: AtomicU64,
    pub upstream_failures: AtomicU64,
    /// Synthesized responses keyed by action kind
    responses: DashMap<&'static str, AtomicU64>,
}

impl Metrics {
    pub fn record_response(&self, kind: &'static str) {
        self.responses
            .entry(kind)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_failure(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsResponse {
        let responses = self
            .responses
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().load(Ordering::Relaxed)))
            .collect();

        MetricsResponse {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            rules_created: self.rules_created.load(Ordering::Relaxed),
            create_conflicts: self.create_conflicts.load(Ordering::Relaxed),
            delegated: self.delegated.load(Ordering::Relaxed),
            delayed: self.delayed.load(Ordering::Relaxed),
            configuration_errors: self.configuration_errors.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            responses,
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsResponse {
    pub total_requests: u64,
    pub bypassed: u64,
    pub rules_created: u64,
    pub create_conflicts: u64,
    pub delegated: u64,
    pub delayed: u64,
    pub configuration_errors: u64,
    pub upstream_failures: u64,
    pub responses: BTreeMap<String, u64>,
}

/// `/health` and `/metrics`, meant to be nested under the admin prefix
pub fn status_routes(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> Json<MetricsResponse> {
    Json(metrics.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[test]
    fn test_snapshot_groups_responses_by_kind() {
        let metrics = Metrics::default();
        metrics.record_response("flat");
        metrics.record_response("flat");
        metrics.record_response("live");
        metrics.record_upstream_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.responses.get("flat"), Some(&2));
        assert_eq!(snapshot.responses.get("live"), Some(&1));
        assert_eq!(snapshot.upstream_failures, 1);
    }

    #[tokio::test]
    async fn test_status_routes() {
        let metrics = Arc::new(Metrics::default());
        metrics.total_requests.fetch_add(3, Ordering::Relaxed);
        let app = status_routes(metrics);

        let resp = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("ok"));

        let resp = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["total_requests"], 3);
    }
}
