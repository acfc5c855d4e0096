//! Vendor and rule resolution
//!
//! Both lookups return at most one record. More than one match is operator
//! misconfiguration and is reported as a configuration error instead of
//! silently picking the first hit.

use crate::action::Action;
use crate::error::StubError;
use crate::store::RuleStore;
use stormcloud_common::{Rule, Vendor};
use tracing::error;

/// A rule together with its parsed action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRule {
    pub rule: Rule,
    /// `None` when the rule has no action configured yet
    pub action: Option<Action>,
}

impl From<Rule> for ResolvedRule {
    fn from(rule: Rule) -> Self {
        let action = Action::resolve(&rule);
        Self { rule, action }
    }
}

/// Find the vendor served from `hostname`.
///
/// Currently goes off the hostname only: the vendor's `base_url` must equal it.
pub async fn resolve_vendor(
    store: &dyn RuleStore,
    hostname: &str,
) -> Result<Option<Vendor>, StubError> {
    let mut vendors = store.find_vendors_by_hostname(hostname).await?;
    if vendors.len() > 1 {
        error!("More than one vendor found for hostname {}", hostname);
        return Err(StubError::AmbiguousVendor {
            hostname: hostname.to_string(),
            count: vendors.len(),
        });
    }
    Ok(vendors.pop())
}

/// Find the rule for (vendor, path, verb).
///
/// When no vendor resolved the search is NOT vendor-scoped: any rule with the
/// same path and verb matches, whichever vendor it belongs to. Requests from
/// unknown hostnames can therefore pick up a vendor's rule.
pub async fn resolve_rule(
    store: &dyn RuleStore,
    vendor: Option<&Vendor>,
    path: &str,
    verb: &str,
) -> Result<Option<ResolvedRule>, StubError> {
    let mut rules = store.find_rules(vendor.map(|v| v.id), path, verb).await?;
    if rules.len() > 1 {
        let vendor = vendor.map_or_else(|| "none".to_string(), |v| v.to_string());
        error!("More than one rule for path {} / vendor {}", path, vendor);
        return Err(StubError::AmbiguousRule {
            vendor,
            path: path.to_string(),
            verb: verb.to_string(),
            count: rules.len(),
        });
    }
    Ok(rules.pop().map(ResolvedRule::from))
}
