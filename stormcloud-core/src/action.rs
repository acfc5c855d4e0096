//! Response actions
//!
//! A rule's action text is parsed once, when the rule is resolved, into a
//! closed set of strategies the synthesizer dispatches on.

use axum::http::StatusCode;
use stormcloud_common::Rule;

/// What to respond with when a rule matches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Selected variant body, status 200
    Flat,
    /// Fetch `url` with the inbound verb and relay its body
    Live { url: String },
    /// Selected variant used as a `Location`, status 301
    RedirectPermanent,
    /// Selected variant used as a `Location`, status 302
    RedirectTemporary,
    /// Empty body with the given status
    FixedStatus(StatusCode),
    /// Action text nothing knows how to serve
    Unrecognized(String),
}

impl Action {
    /// Parse a rule's action. `None` means no action is configured.
    pub fn resolve(rule: &Rule) -> Option<Action> {
        if !rule.has_action() {
            return None;
        }
        let text = rule.action.trim();

        let action = match text {
            "flat" => Action::Flat,
            "301" => Action::RedirectPermanent,
            "302" => Action::RedirectTemporary,
            "live" => match rule.live_url.as_deref().map(str::trim) {
                Some(url) if !url.is_empty() => Action::Live {
                    url: url.to_string(),
                },
                _ => Action::Unrecognized("live (no live_url configured)".to_string()),
            },
            other => match other.parse::<u16>().ok().and_then(|code| StatusCode::from_u16(code).ok()) {
                Some(status) => Action::FixedStatus(status),
                None => Action::Unrecognized(other.to_string()),
            },
        };

        Some(action)
    }

    /// Stable label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Flat => "flat",
            Action::Live { .. } => "live",
            Action::RedirectPermanent => "redirect_permanent",
            Action::RedirectTemporary => "redirect_temporary",
            Action::FixedStatus(_) => "fixed_status",
            Action::Unrecognized(_) => "unrecognized",
        }
    }

    /// Whether the synthesizer needs the inbound body
    pub fn needs_body(&self) -> bool {
        matches!(self, Action::Live { .. })
    }
}
