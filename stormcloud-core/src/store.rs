//! Rule store interface
//!
//! The interceptor never talks to a storage engine directly. It reads vendors,
//! rules, variants and substitutions through [`RuleStore`], and its only write
//! is recording a blank rule for an endpoint it has not seen before.

use crate::error::StoreError;
use async_trait::async_trait;
use stormcloud_common::{
    NewRule, ResponseVariant, Rule, RuleDraft, Substitution, SubstitutionDraft, VariantDraft,
    Vendor, VendorDraft,
};
use tokio::sync::RwLock;

#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Every vendor whose `base_url` equals `hostname`
    async fn find_vendors_by_hostname(&self, hostname: &str) -> Result<Vec<Vendor>, StoreError>;

    /// Every rule with this exact path and verb. `None` searches all vendors.
    async fn find_rules(
        &self,
        vendor_id: Option<i64>,
        path: &str,
        verb: &str,
    ) -> Result<Vec<Rule>, StoreError>;

    /// Record a blank rule. Returns [`StoreError::Conflict`] when a rule for the
    /// same (vendor, path, verb) already exists.
    async fn create_rule(&self, new_rule: NewRule) -> Result<Rule, StoreError>;

    async fn list_active_variants(&self, rule_id: i64) -> Result<Vec<ResponseVariant>, StoreError>;

    /// Active substitutions in definition order
    async fn list_active_substitutions(&self, rule_id: i64)
        -> Result<Vec<Substitution>, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    vendors: Vec<Vendor>,
    rules: Vec<Rule>,
    variants: Vec<ResponseVariant>,
    substitutions: Vec<Substitution>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn has_rule(&self, vendor_id: Option<i64>, path: &str, verb: &str) -> bool {
        self.rules
            .iter()
            .any(|r| r.vendor_id == vendor_id && r.path == path && r.verb == verb)
    }
}

/// In-process rule store
///
/// Enforces the same (vendor, path, verb) uniqueness as the SQLite store, so
/// it can stand in for it in tests or when embedding the interceptor.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_vendor(&self, draft: VendorDraft) -> Vendor {
        let mut tables = self.tables.write().await;
        let vendor = Vendor {
            id: tables.next_id(),
            name: draft.name,
            base_url: draft.base_url,
            override_instructions: draft.override_instructions,
        };
        tables.vendors.push(vendor.clone());
        vendor
    }

    /// Insert a fully configured rule
    pub async fn add_rule(&self, draft: RuleDraft) -> Result<Rule, StoreError> {
        let mut tables = self.tables.write().await;
        if tables.has_rule(draft.vendor_id, &draft.path, &draft.verb) {
            return Err(StoreError::Conflict {
                vendor_id: draft.vendor_id,
                path: draft.path,
                verb: draft.verb,
            });
        }
        let rule = Rule {
            id: tables.next_id(),
            vendor_id: draft.vendor_id,
            hostname: draft.hostname,
            path: draft.path,
            verb: draft.verb,
            action: draft.action,
            delay_ms: draft.delay_ms,
            live_url: draft.live_url,
            created_at: chrono::Utc::now(),
        };
        tables.rules.push(rule.clone());
        Ok(rule)
    }

    /// Insert a rule without the uniqueness check, to reproduce legacy data
    /// that predates the constraint.
    pub async fn add_rule_unchecked(&self, draft: RuleDraft) -> Rule {
        let mut tables = self.tables.write().await;
        let rule = Rule {
            id: tables.next_id(),
            vendor_id: draft.vendor_id,
            hostname: draft.hostname,
            path: draft.path,
            verb: draft.verb,
            action: draft.action,
            delay_ms: draft.delay_ms,
            live_url: draft.live_url,
            created_at: chrono::Utc::now(),
        };
        tables.rules.push(rule.clone());
        rule
    }

    pub async fn update_rule(&self, rule_id: i64, draft: RuleDraft) -> Result<Rule, StoreError> {
        let mut tables = self.tables.write().await;
        let clash = tables.rules.iter().any(|r| {
            r.id != rule_id
                && r.vendor_id == draft.vendor_id
                && r.path == draft.path
                && r.verb == draft.verb
        });
        if clash {
            return Err(StoreError::Conflict {
                vendor_id: draft.vendor_id,
                path: draft.path,
                verb: draft.verb,
            });
        }
        let rule = tables
            .rules
            .iter_mut()
            .find(|r| r.id == rule_id)
            .ok_or(StoreError::NotFound { kind: "rule", id: rule_id })?;
        rule.vendor_id = draft.vendor_id;
        rule.hostname = draft.hostname;
        rule.path = draft.path;
        rule.verb = draft.verb;
        rule.action = draft.action;
        rule.delay_ms = draft.delay_ms;
        rule.live_url = draft.live_url;
        Ok(rule.clone())
    }

    /// Delete a rule together with its variants and substitutions
    pub async fn delete_rule(&self, rule_id: i64) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let before = tables.rules.len();
        tables.rules.retain(|r| r.id != rule_id);
        if tables.rules.len() == before {
            return Err(StoreError::NotFound { kind: "rule", id: rule_id });
        }
        tables.variants.retain(|v| v.rule_id != rule_id);
        tables.substitutions.retain(|s| s.rule_id != rule_id);
        Ok(())
    }

    pub async fn add_variant(
        &self,
        rule_id: i64,
        draft: VariantDraft,
    ) -> Result<ResponseVariant, StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.rules.iter().any(|r| r.id == rule_id) {
            return Err(StoreError::NotFound { kind: "rule", id: rule_id });
        }
        let variant = ResponseVariant {
            id: tables.next_id(),
            rule_id,
            body: draft.body,
            active: draft.active,
        };
        tables.variants.push(variant.clone());
        Ok(variant)
    }

    pub async fn add_substitution(
        &self,
        rule_id: i64,
        draft: SubstitutionDraft,
    ) -> Result<Substitution, StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.rules.iter().any(|r| r.id == rule_id) {
            return Err(StoreError::NotFound { kind: "rule", id: rule_id });
        }
        let substitution = Substitution {
            id: tables.next_id(),
            rule_id,
            position: draft.position,
            find: draft.find,
            replace: draft.replace,
            active: draft.active,
        };
        tables.substitutions.push(substitution.clone());
        Ok(substitution)
    }

    /// All rules, in insertion order
    pub async fn rules(&self) -> Vec<Rule> {
        self.tables.read().await.rules.clone()
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn find_vendors_by_hostname(&self, hostname: &str) -> Result<Vec<Vendor>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .vendors
            .iter()
            .filter(|v| v.base_url == hostname)
            .cloned()
            .collect())
    }

    async fn find_rules(
        &self,
        vendor_id: Option<i64>,
        path: &str,
        verb: &str,
    ) -> Result<Vec<Rule>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .rules
            .iter()
            .filter(|r| r.path == path && r.verb == verb)
            .filter(|r| vendor_id.map_or(true, |id| r.vendor_id == Some(id)))
            .cloned()
            .collect())
    }

    async fn create_rule(&self, new_rule: NewRule) -> Result<Rule, StoreError> {
        self.add_rule(new_rule.into()).await
    }

    async fn list_active_variants(&self, rule_id: i64) -> Result<Vec<ResponseVariant>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .variants
            .iter()
            .filter(|v| v.rule_id == rule_id && v.active)
            .cloned()
            .collect())
    }

    async fn list_active_substitutions(
        &self,
        rule_id: i64,
    ) -> Result<Vec<Substitution>, StoreError> {
        let tables = self.tables.read().await;
        let mut substitutions: Vec<Substitution> = tables
            .substitutions
            .iter()
            .filter(|s| s.rule_id == rule_id && s.active)
            .cloned()
            .collect();
        substitutions.sort_by_key(|s| (s.position, s.id));
        Ok(substitutions)
    }
}
