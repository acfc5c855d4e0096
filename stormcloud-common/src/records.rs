//! Vendor, rule, response variant and substitution records
//!
//! A `Rule` owns its `ResponseVariant`s and `Substitution`s (they are deleted
//! with it). A `Vendor` is only referenced by rules.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A third-party API provider, identified by the hostname it is served from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vendor {
    pub id: i64,
    pub name: String,
    /// Matched literally against the inbound request hostname
    pub base_url: String,
    /// Operator notes on how to point an integration at the stub
    #[serde(default)]
    pub override_instructions: String,
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A mapping from (vendor, path, verb) to a response action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub vendor_id: Option<i64>,
    pub hostname: String,
    pub path: String,
    pub verb: String,
    /// Raw action text. Empty means "no action configured yet".
    #[serde(default)]
    pub action: String,
    pub delay_ms: Option<u64>,
    pub live_url: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Rule {
    /// Artificial delay to apply before synthesizing, if any
    pub fn delay(&self) -> Option<Duration> {
        match self.delay_ms {
            Some(ms) if ms > 0 => Some(Duration::from_millis(ms)),
            _ => None,
        }
    }

    pub fn has_action(&self) -> bool {
        !self.action.trim().is_empty()
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.verb, self.path)
    }
}

/// The blank rule recorded the first time an unknown endpoint is seen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRule {
    pub vendor_id: Option<i64>,
    pub hostname: String,
    pub path: String,
    pub verb: String,
}

/// One candidate body for a rule. Only active variants are served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseVariant {
    pub id: i64,
    pub rule_id: i64,
    pub body: String,
    pub active: bool,
}

/// A literal find/replace rewrite applied to a synthesized body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Substitution {
    pub id: i64,
    pub rule_id: i64,
    /// Definition order; lower positions are applied first
    pub position: i64,
    pub find: String,
    pub replace: String,
    pub active: bool,
}

/// Admin payload for creating or replacing a vendor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorDraft {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub override_instructions: String,
}

/// Admin payload for creating or replacing a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDraft {
    #[serde(default)]
    pub vendor_id: Option<i64>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_verb")]
    pub verb: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub live_url: Option<String>,
}

fn default_verb() -> String {
    "GET".to_string()
}

fn default_active() -> bool {
    true
}

/// Admin payload for creating or replacing a response variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantDraft {
    #[serde(default)]
    pub body: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

/// Admin payload for creating or replacing a substitution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstitutionDraft {
    #[serde(default)]
    pub position: i64,
    pub find: String,
    #[serde(default)]
    pub replace: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl From<NewRule> for RuleDraft {
    fn from(new_rule: NewRule) -> Self {
        Self {
            vendor_id: new_rule.vendor_id,
            hostname: new_rule.hostname,
            path: new_rule.path,
            verb: new_rule.verb,
            action: String::new(),
            delay_ms: None,
            live_url: None,
        }
    }
}
