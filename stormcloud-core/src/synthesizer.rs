//! Response synthesis
//!
//! Turns a resolved rule into a concrete response. Variant selection and
//! substitution are plain functions; the live passthrough owns a pooled
//! HTTP client with a bounded timeout.

use crate::action::Action;
use crate::admin::Metrics;
use crate::config::SynthesizerConfig;
use crate::error::StubError;
use crate::resolver::ResolvedRule;
use crate::store::RuleStore;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use rand::seq::SliceRandom;
use std::sync::Arc;
use stormcloud_common::{ResponseVariant, Substitution};
use tracing::{debug, info, warn};

/// Outcome of synthesis
pub enum Synthesis {
    /// Send this response to the caller
    Respond(Response),
    /// Nothing could be synthesized; let the downstream handler answer
    Delegate,
}

/// The parts of the inbound request a live passthrough forwards
#[derive(Debug, Clone, Default)]
pub struct LiveRequest {
    pub method: Method,
    pub query: Option<String>,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Pick the body to serve from a rule's variants.
///
/// No active variant yields an empty body, one yields itself, several yield a
/// uniform random choice made fresh on every call.
pub fn select_variant(variants: &[ResponseVariant]) -> String {
    let active: Vec<&ResponseVariant> = variants.iter().filter(|v| v.active).collect();
    match active.as_slice() {
        [] => String::new(),
        [only] => only.body.clone(),
        many => many
            .choose(&mut rand::thread_rng())
            .map(|v| v.body.clone())
            .unwrap_or_default(),
    }
}

/// Apply active substitutions in order.
///
/// Each replace is literal and case-sensitive and runs on the output of the
/// previous one. An empty `find` is skipped.
pub fn apply_substitutions(body: String, substitutions: &[Substitution]) -> String {
    substitutions
        .iter()
        .filter(|s| s.active && !s.find.is_empty())
        .fold(body, |text, s| text.replace(&s.find, &s.replace))
}

/// Builds responses for resolved rules
#[derive(Clone)]
pub struct Synthesizer {
    client: reqwest::Client,
    metrics: Arc<Metrics>,
}

impl Synthesizer {
    pub fn new(config: SynthesizerConfig, metrics: Arc<Metrics>) -> Result<Self, StubError> {
        let client = reqwest::Client::builder()
            .timeout(config.live_timeout)
            .user_agent(concat!("stormcloud/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StubError::UpstreamUnavailable(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, metrics })
    }

    /// Produce the response for `resolved` according to its action
    pub async fn synthesize(
        &self,
        store: &dyn RuleStore,
        resolved: &ResolvedRule,
        live: LiveRequest,
    ) -> Result<Synthesis, StubError> {
        let rule = &resolved.rule;
        let action = match &resolved.action {
            Some(action) => action,
            None => return Ok(Synthesis::Delegate),
        };

        let response = match action {
            Action::Flat => {
                info!("  StormCloud returning flat response.");
                let body = self.variant_body(store, rule.id).await?;
                (StatusCode::OK, body).into_response()
            }
            Action::RedirectPermanent | Action::RedirectTemporary => {
                let status = if *action == Action::RedirectPermanent {
                    StatusCode::MOVED_PERMANENTLY
                } else {
                    StatusCode::FOUND
                };
                // Selected once so the log reports the URL actually sent
                let url = self.variant_body(store, rule.id).await?;
                info!("  StormCloud returning {} response to {}", status.as_u16(), url);
                redirect(status, &url)
            }
            Action::FixedStatus(status) => {
                info!("  StormCloud returning {} response", status.as_u16());
                (*status, String::new()).into_response()
            }
            Action::Live { url } => {
                info!("  StormCloud returning live response.");
                let substitutions = store.list_active_substitutions(rule.id).await?;
                let (body, content_type) = match self.fetch_live(url, live).await {
                    Ok(fetched) => fetched,
                    Err(e) => {
                        self.metrics.record_upstream_failure();
                        warn!("  {}. Falling back to an empty body.", e);
                        (String::new(), None)
                    }
                };
                let body = apply_substitutions(body, &substitutions);
                let mut response = (StatusCode::OK, body).into_response();
                if let Some(value) = content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
                    response.headers_mut().insert(header::CONTENT_TYPE, value);
                }
                response
            }
            Action::Unrecognized(text) => {
                warn!(
                    "  StormCloud could not interpret action {:?} for rule {}, so it can't infer what you want to do.",
                    text, rule
                );
                return Ok(Synthesis::Delegate);
            }
        };

        self.metrics.record_response(action.kind());
        Ok(Synthesis::Respond(response))
    }

    async fn variant_body(&self, store: &dyn RuleStore, rule_id: i64) -> Result<String, StubError> {
        let variants = store.list_active_variants(rule_id).await?;
        let substitutions = store.list_active_substitutions(rule_id).await?;
        Ok(apply_substitutions(select_variant(&variants), &substitutions))
    }

    /// Fetch the live target. Returns the body and content type on HTTP 200;
    /// any other status, a transport failure or a timeout is an error.
    async fn fetch_live(
        &self,
        live_url: &str,
        live: LiveRequest,
    ) -> Result<(String, Option<String>), StubError> {
        let url = merge_query(live_url, live.query.as_deref())?;
        let method = reqwest::Method::from_bytes(live.method.as_str().as_bytes())
            .map_err(|e| StubError::UpstreamUnavailable(format!("Invalid method {}: {}", live.method, e)))?;
        let forwards_body = live.method != Method::GET && live.method != Method::HEAD;

        debug!("  Live passthrough {} {} (forwarding body: {})", method, url, forwards_body);

        let mut request = self.client.request(method, url.clone());
        if forwards_body {
            if let Some(content_type) = &live.content_type {
                request = request.header(reqwest::header::CONTENT_TYPE, content_type.as_str());
            }
            request = request.body(live.body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StubError::UpstreamUnavailable(format!("Live target {} unreachable: {}", url, e)))?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(StubError::UpstreamUnavailable(format!(
                "Live target {} answered {}",
                url,
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| StubError::UpstreamUnavailable(format!("Failed to read live body from {}: {}", url, e)))?;

        Ok((String::from_utf8_lossy(&bytes).into_owned(), content_type))
    }
}

fn redirect(status: StatusCode, location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (status, [(header::LOCATION, value)]).into_response(),
        Err(_) => {
            warn!("  Redirect target {:?} is not a valid Location header, sending status only", location);
            status.into_response()
        }
    }
}

/// Append the inbound query string to the live URL, keeping any query the
/// live URL already carries.
fn merge_query(live_url: &str, inbound: Option<&str>) -> Result<url::Url, StubError> {
    let mut url = url::Url::parse(live_url)
        .map_err(|e| StubError::UpstreamUnavailable(format!("Invalid live_url {:?}: {}", live_url, e)))?;

    if let Some(inbound) = inbound.filter(|q| !q.is_empty()) {
        let merged = match url.query() {
            Some(existing) if !existing.is_empty() => format!("{}&{}", existing, inbound),
            _ => inbound.to_string(),
        };
        url.set_query(Some(&merged));
    }

    Ok(url)
}
