use crate::{
    admin::{status_routes, Metrics},
    config::ServerConfig,
    error::StubError,
    interceptor::{intercept, Interceptor},
    store::RuleStore,
    Result,
};
use axum::{
    http::{Method, StatusCode, Uri},
    middleware, Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct StubServer {
    config: ServerConfig,
    store: Arc<dyn RuleStore>,
    metrics: Arc<Metrics>,
    admin_routes: Option<Router>,
}

impl StubServer {
    pub fn new(config: ServerConfig, store: Arc<dyn RuleStore>) -> Self {
        Self {
            config,
            store,
            metrics: Arc::new(Metrics::default()),
            admin_routes: None,
        }
    }

    /// Extra admin routes, merged next to `/health` and `/metrics` under `/admin`
    pub fn with_admin_routes(mut self, routes: Router) -> Self {
        self.admin_routes = Some(routes);
        self
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// The full application: admin API, downstream fallback and the
    /// interceptor wrapped around both.
    pub fn router(&self) -> Result<Router> {
        let interceptor = Interceptor::new(
            self.store.clone(),
            &self.config.interceptor,
            self.metrics.clone(),
        )?;

        let mut admin = status_routes(self.metrics.clone());
        if let Some(routes) = &self.admin_routes {
            admin = admin.merge(routes.clone());
        }

        Ok(Router::new()
            .nest("/admin", admin)
            .fallback(downstream_handler)
            .layer(middleware::from_fn_with_state(interceptor, intercept))
            .layer(TraceLayer::new_for_http()))
    }

    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.listen_address, self.config.listen_port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            StubError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to bind {}: {}", addr, e),
            ))
        })?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let app = self.router()?;
        info!("Starting StormCloud stub server on {}", listener.local_addr()?);

        axum::serve(listener, app).await?;
        Ok(())
    }
}

/// Normal handling for requests the interceptor passes on
async fn downstream_handler(method: Method, uri: Uri) -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("No handler for {} {}", method, uri.path()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use axum::routing::get;
    use stormcloud_common::{RuleDraft, VariantDraft};
    use tower::ServiceExt;

    async fn get_text(app: &Router, uri: &str) -> (StatusCode, String) {
        let req = Request::get(uri)
            .header(header::HOST, "localhost:8000")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn test_admin_routes_are_bypassed() {
        let store = Arc::new(MemoryStore::new());
        let server = StubServer::new(ServerConfig::default(), store.clone())
            .with_admin_routes(Router::new().route("/ping", get(|| async { "pong" })));
        let app = server.router().unwrap();

        assert_eq!(get_text(&app, "/admin/ping").await, (StatusCode::OK, "pong".to_string()));
        let (status, body) = get_text(&app, "/admin/health").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("ok"));

        assert!(store.rules().await.is_empty());
    }

    #[tokio::test]
    async fn test_bare_admin_path_is_not_discovered() {
        let store = Arc::new(MemoryStore::new());
        let app = StubServer::new(ServerConfig::default(), store.clone())
            .router()
            .unwrap();

        let (status, _) = get_text(&app, "/admin").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(store.rules().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_endpoint_then_downstream() {
        let store = Arc::new(MemoryStore::new());
        let app = StubServer::new(ServerConfig::default(), store.clone())
            .router()
            .unwrap();

        assert_eq!(get_text(&app, "/stripe/post/").await, (StatusCode::OK, String::new()));
        assert_eq!(
            get_text(&app, "/stripe/post/").await,
            (StatusCode::NOT_FOUND, "No handler for GET /stripe/post/".to_string())
        );
        assert_eq!(store.rules().await.len(), 1);
    }

    #[tokio::test]
    async fn test_configured_rule_is_served_and_counted() {
        let store = Arc::new(MemoryStore::new());
        let rule = store
            .add_rule(RuleDraft {
                vendor_id: None,
                hostname: "localhost".to_string(),
                path: "/cat".to_string(),
                verb: "GET".to_string(),
                action: "flat".to_string(),
                delay_ms: None,
                live_url: None,
            })
            .await
            .unwrap();
        store
            .add_variant(rule.id, VariantDraft { body: "unicycle cat".to_string(), active: true })
            .await
            .unwrap();

        let server = StubServer::new(ServerConfig::default(), store);
        let metrics = server.metrics();
        let app = server.router().unwrap();

        assert_eq!(get_text(&app, "/cat").await, (StatusCode::OK, "unicycle cat".to_string()));
        let (_, body) = get_text(&app, "/admin/metrics").await;
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["responses"]["flat"], 1);
        assert_eq!(metrics.snapshot().bypassed, 1);
    }
}
