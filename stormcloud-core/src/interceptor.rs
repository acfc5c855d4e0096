//! Request interception
//!
//! Sits in front of all routing. For every request outside the bypass list it
//! resolves the vendor and rule, records a blank rule the first time an
//! endpoint is seen, applies any configured delay and synthesizes the
//! response. Requests with nothing to synthesize fall through to the
//! downstream handler untouched.

use crate::admin::Metrics;
use crate::config::InterceptorConfig;
use crate::error::{StoreError, StubError};
use crate::filter::BypassMatcher;
use crate::resolver::{resolve_rule, resolve_vendor, ResolvedRule};
use crate::store::RuleStore;
use crate::synthesizer::{LiveRequest, Synthesis, Synthesizer};
use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use std::sync::{atomic::Ordering, Arc};
use stormcloud_common::{NewRule, Vendor};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// What to do with an intercepted request
pub enum Interception {
    /// Hand the request to the downstream handler
    Forward(Request),
    /// Answer directly
    Respond(Response),
}

#[derive(Clone)]
pub struct Interceptor {
    store: Arc<dyn RuleStore>,
    synthesizer: Synthesizer,
    bypass: Arc<BypassMatcher>,
    metrics: Arc<Metrics>,
    max_forward_body_bytes: usize,
}

impl Interceptor {
    pub fn new(
        store: Arc<dyn RuleStore>,
        config: &InterceptorConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self, StubError> {
        Ok(Self {
            store,
            synthesizer: Synthesizer::new(config.synthesizer(), metrics.clone())?,
            bypass: Arc::new(BypassMatcher::new(&config.bypass)),
            metrics,
            max_forward_body_bytes: config.max_forward_body_bytes,
        })
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub async fn handle_request(&self, req: Request) -> Result<Interception, StubError> {
        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);

        // bypass for the admin API
        if self.bypass.is_bypassed(req.uri().path()) {
            debug!("StormCloud Ignoring Admin URL {}", req.uri().path());
            self.metrics.bypassed.fetch_add(1, Ordering::Relaxed);
            return Ok(Interception::Forward(req));
        }

        let request_id = Uuid::new_v4();
        let span = info_span!("intercept", %request_id);
        let result = self.process(req).instrument(span).await;

        if let Err(e) = &result {
            if e.is_configuration_error() {
                self.metrics.configuration_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    async fn process(&self, req: Request) -> Result<Interception, StubError> {
        let store = self.store.as_ref();
        let path = req.uri().path().to_string();
        let hostname = request_hostname(&req);
        let verb = req.method().as_str().to_string();

        info!(
            "StormCloud received request to URL: {} Hostname: {} Verb: {}",
            path, hostname, verb
        );
        let vendor = resolve_vendor(store, &hostname).await?;
        debug!("  Determined vendor as {}", describe(vendor.as_ref()));

        let resolved = match resolve_rule(store, vendor.as_ref(), &path, &verb).await? {
            Some(resolved) => resolved,
            None => match self.discover(vendor.as_ref(), &hostname, &path, &verb).await? {
                Some(resolved) if resolved.action.is_some() => resolved,
                // blank response initially
                _ => return Ok(Interception::Respond((StatusCode::OK, "").into_response())),
            },
        };

        let action = match &resolved.action {
            Some(action) => action.clone(),
            None => {
                info!(
                    "  No action was found for URL {} / Vendor {} / Hostname {} / Verb {}, passing request on to be handled normally.",
                    path, describe(vendor.as_ref()), hostname, verb
                );
                self.metrics.delegated.fetch_add(1, Ordering::Relaxed);
                return Ok(Interception::Forward(req));
            }
        };

        if let Some(delay) = resolved.rule.delay() {
            info!("  StormCloud initiating {} ms delay", delay.as_millis());
            self.metrics.delayed.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(delay).await;
        }

        let (parts, body) = req.into_parts();
        let mut live = LiveRequest {
            method: parts.method.clone(),
            query: parts.uri.query().map(str::to_string),
            content_type: parts
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            body: Bytes::new(),
        };

        let body = if action.needs_body() && parts.method != Method::GET && parts.method != Method::HEAD {
            match to_bytes(body, self.max_forward_body_bytes).await {
                Ok(bytes) => {
                    live.body = bytes.clone();
                    Body::from(bytes)
                }
                Err(e) => {
                    warn!(
                        "  Request body not forwarded (limit {} bytes): {}",
                        self.max_forward_body_bytes, e
                    );
                    Body::empty()
                }
            }
        } else {
            body
        };

        match self.synthesizer.synthesize(store, &resolved, live).await? {
            Synthesis::Respond(response) => Ok(Interception::Respond(response)),
            Synthesis::Delegate => {
                self.metrics.delegated.fetch_add(1, Ordering::Relaxed);
                Ok(Interception::Forward(Request::from_parts(parts, body)))
            }
        }
    }

    /// Record a blank rule for an endpoint seen for the first time.
    ///
    /// Returns `None` when this request created the rule. When another request
    /// created it first the store reports a conflict and the winner's rule is
    /// re-read and returned instead.
    async fn discover(
        &self,
        vendor: Option<&Vendor>,
        hostname: &str,
        path: &str,
        verb: &str,
    ) -> Result<Option<ResolvedRule>, StubError> {
        let new_rule = NewRule {
            vendor_id: vendor.map(|v| v.id),
            hostname: hostname.to_string(),
            path: path.to_string(),
            verb: verb.to_string(),
        };

        match self.store.create_rule(new_rule).await {
            Ok(rule) => {
                self.metrics.rules_created.fetch_add(1, Ordering::Relaxed);
                info!(
                    "  No rule was found for URL {} / Vendor {} / Hostname {} / Verb {}, rule {} was created.",
                    path, describe(vendor), hostname, verb, rule.id
                );
                Ok(None)
            }
            Err(StoreError::Conflict { .. }) => {
                self.metrics.create_conflicts.fetch_add(1, Ordering::Relaxed);
                info!(
                    "  Rule for URL {} / Vendor {} / Verb {} was created by a concurrent request, reselecting.",
                    path, describe(vendor), verb
                );
                resolve_rule(self.store.as_ref(), vendor, path, verb).await
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// axum middleware adapter for [`Interceptor`]
pub async fn intercept(
    State(interceptor): State<Interceptor>,
    req: Request,
    next: Next,
) -> Response {
    match interceptor.handle_request(req).await {
        Ok(Interception::Forward(req)) => next.run(req).await,
        Ok(Interception::Respond(response)) => response,
        Err(e) => e.into_response(),
    }
}

fn describe(vendor: Option<&Vendor>) -> String {
    vendor.map_or_else(|| "None".to_string(), |v| v.to_string())
}

/// Server name the request was addressed to, without any port
fn request_hostname(req: &Request) -> String {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())
        .unwrap_or("");
    strip_port(host).to_string()
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use axum::{middleware, Router};
    use std::time::{Duration, Instant};
    use stormcloud_common::{
        ResponseVariant, Rule, RuleDraft, Substitution, VariantDraft, VendorDraft,
    };
    use tower::ServiceExt;

    async fn downstream(req: Request) -> (StatusCode, String) {
        (StatusCode::NOT_FOUND, format!("downstream {}", req.uri().path()))
    }

    fn app(store: Arc<dyn RuleStore>) -> (Router, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::default());
        let interceptor =
            Interceptor::new(store, &InterceptorConfig::default(), metrics.clone()).unwrap();
        let router = Router::new()
            .fallback(downstream)
            .layer(middleware::from_fn_with_state(interceptor, intercept));
        (router, metrics)
    }

    fn request(method: &str, host: &str, uri: &str) -> Request {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    async fn send(app: &Router, req: Request) -> (StatusCode, String) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    fn rule_draft(vendor_id: Option<i64>, path: &str, action: &str, delay_ms: Option<u64>) -> RuleDraft {
        RuleDraft {
            vendor_id,
            hostname: "localhost".to_string(),
            path: path.to_string(),
            verb: "GET".to_string(),
            action: action.to_string(),
            delay_ms,
            live_url: None,
        }
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("api.stripe.com"), "api.stripe.com");
        assert_eq!(strip_port("localhost:8000"), "localhost");
        assert_eq!(strip_port("[::1]:8000"), "[::1]");
        assert_eq!(strip_port("weird:"), "weird:");
    }

    #[tokio::test]
    async fn test_first_contact_creates_blank_rule() {
        let store = Arc::new(MemoryStore::new());
        let (app, metrics) = app(store.clone());

        let (status, body) = send(&app, request("GET", "localhost:8000", "/stripe/post/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "");

        let rules = store.rules().await;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].vendor_id, None);
        assert_eq!(rules[0].hostname, "localhost");
        assert_eq!(rules[0].path, "/stripe/post/");
        assert_eq!(rules[0].verb, "GET");
        assert!(rules[0].action.is_empty());
        assert_eq!(metrics.snapshot().rules_created, 1);
    }

    #[tokio::test]
    async fn test_resolution_is_idempotent_after_creation() {
        let store = Arc::new(MemoryStore::new());
        let (app, metrics) = app(store.clone());

        send(&app, request("GET", "localhost", "/stripe/post/")).await;
        // The blank rule now exists, so the request is handled downstream
        let (status, body) = send(&app, request("GET", "localhost", "/stripe/post/")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "downstream /stripe/post/");

        assert_eq!(store.rules().await.len(), 1);
        assert_eq!(metrics.snapshot().delegated, 1);
    }

    #[tokio::test]
    async fn test_auto_created_rule_references_resolved_vendor() {
        let store = Arc::new(MemoryStore::new());
        let vendor = store
            .add_vendor(VendorDraft {
                name: "Stripe".to_string(),
                base_url: "api.stripe.com".to_string(),
                override_instructions: String::new(),
            })
            .await;
        let (app, _) = app(store.clone());

        send(&app, request("POST", "api.stripe.com", "/v1/charges")).await;

        let rules = store.rules().await;
        assert_eq!(rules[0].vendor_id, Some(vendor.id));
        assert_eq!(rules[0].hostname, "api.stripe.com");
        assert_eq!(rules[0].verb, "POST");
    }

    #[tokio::test]
    async fn test_bypass_never_creates_rules() {
        let store = Arc::new(MemoryStore::new());
        let (app, metrics) = app(store.clone());

        let (status, body) = send(&app, request("GET", "localhost", "/admin/rules")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "downstream /admin/rules");
        assert!(store.rules().await.is_empty());
        assert_eq!(metrics.snapshot().bypassed, 1);
    }

    #[tokio::test]
    async fn test_flat_rule_is_synthesized() {
        let store = Arc::new(MemoryStore::new());
        let rule = store.add_rule(rule_draft(None, "/cat", "flat", None)).await.unwrap();
        store
            .add_variant(rule.id, VariantDraft { body: "unicycle cat".to_string(), active: true })
            .await
            .unwrap();
        let (app, metrics) = app(store);

        let (status, body) = send(&app, request("GET", "localhost", "/cat")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "unicycle cat");
        assert_eq!(metrics.snapshot().responses.get("flat"), Some(&1));
    }

    #[tokio::test]
    async fn test_fixed_status_rule() {
        let store = Arc::new(MemoryStore::new());
        store.add_rule(rule_draft(None, "/teapot", "418", None)).await.unwrap();
        let (app, _) = app(store);

        let (status, body) = send(&app, request("GET", "localhost", "/teapot")).await;
        assert_eq!(status, StatusCode::IM_A_TEAPOT);
        assert_eq!(body, "");
    }

    #[tokio::test]
    async fn test_delay_holds_the_response() {
        let store = Arc::new(MemoryStore::new());
        store.add_rule(rule_draft(None, "/slow", "204", Some(200))).await.unwrap();
        let (app, metrics) = app(store);

        let started = Instant::now();
        let (status, _) = send(&app, request("GET", "localhost", "/slow")).await;
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(metrics.snapshot().delayed, 1);
    }

    #[tokio::test]
    async fn test_delay_does_not_block_other_requests() {
        let store = Arc::new(MemoryStore::new());
        store.add_rule(rule_draft(None, "/slow", "204", Some(400))).await.unwrap();
        store.add_rule(rule_draft(None, "/fast", "204", None)).await.unwrap();
        let (app, _) = app(store);

        let slow_app = app.clone();
        let slow = tokio::spawn(async move { send(&slow_app, request("GET", "localhost", "/slow")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        send(&app, request("GET", "localhost", "/fast")).await;
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(slow.await.unwrap().0, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_unrecognized_action_falls_through() {
        let store = Arc::new(MemoryStore::new());
        store.add_rule(rule_draft(None, "/wsdl", "wsdl_replaced", None)).await.unwrap();
        let (app, metrics) = app(store);

        let (status, body) = send(&app, request("GET", "localhost", "/wsdl")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "downstream /wsdl");
        assert_eq!(metrics.snapshot().delegated, 1);
    }

    #[tokio::test]
    async fn test_ambiguous_vendor_is_server_error() {
        let store = Arc::new(MemoryStore::new());
        for name in ["Stripe", "Stripe again"] {
            store
                .add_vendor(VendorDraft {
                    name: name.to_string(),
                    base_url: "api.stripe.com".to_string(),
                    override_instructions: String::new(),
                })
                .await;
        }
        let (app, metrics) = app(store.clone());

        let (status, body) = send(&app, request("GET", "api.stripe.com", "/v1/charges")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("more than one vendor"));
        assert!(store.rules().await.is_empty());
        assert_eq!(metrics.snapshot().configuration_errors, 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_contact_creates_one_rule() {
        let store = Arc::new(MemoryStore::new());
        let (app, _) = app(store.clone());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let app = app.clone();
                tokio::spawn(async move { send(&app, request("GET", "localhost", "/race")).await })
            })
            .collect();
        for handle in handles {
            let (status, _) = handle.await.unwrap();
            assert!(status == StatusCode::OK || status == StatusCode::NOT_FOUND);
        }

        assert_eq!(store.rules().await.len(), 1);
    }

    /// Loses every create race: another writer inserts the rule first
    struct RacingStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl RuleStore for RacingStore {
        async fn find_vendors_by_hostname(&self, hostname: &str) -> Result<Vec<Vendor>, StoreError> {
            self.inner.find_vendors_by_hostname(hostname).await
        }

        async fn find_rules(
            &self,
            vendor_id: Option<i64>,
            path: &str,
            verb: &str,
        ) -> Result<Vec<Rule>, StoreError> {
            self.inner.find_rules(vendor_id, path, verb).await
        }

        async fn create_rule(&self, new_rule: NewRule) -> Result<Rule, StoreError> {
            let mut winner: RuleDraft = new_rule.clone().into();
            winner.action = "flat".to_string();
            let rule = self.inner.add_rule(winner).await?;
            self.inner
                .add_variant(rule.id, VariantDraft { body: "winner".to_string(), active: true })
                .await?;
            self.inner.create_rule(new_rule).await
        }

        async fn list_active_variants(&self, rule_id: i64) -> Result<Vec<ResponseVariant>, StoreError> {
            self.inner.list_active_variants(rule_id).await
        }

        async fn list_active_substitutions(
            &self,
            rule_id: i64,
        ) -> Result<Vec<Substitution>, StoreError> {
            self.inner.list_active_substitutions(rule_id).await
        }
    }

    #[tokio::test]
    async fn test_create_conflict_reselects_instead_of_failing() {
        let store = Arc::new(RacingStore {
            inner: MemoryStore::new(),
        });
        let (app, metrics) = app(store.clone());

        let (status, body) = send(&app, request("GET", "localhost", "/race")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "winner");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.create_conflicts, 1);
        assert_eq!(snapshot.rules_created, 0);
        assert_eq!(store.inner.rules().await.len(), 1);
    }
}
