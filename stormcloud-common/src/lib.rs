//! Common records shared across StormCloud crates
//!
//! These are plain data types: the core engine reads them through its
//! rule store, the server persists them, and the admin API serializes them.

pub mod records;

pub use records::{
    NewRule, ResponseVariant, Rule, RuleDraft, Substitution, SubstitutionDraft, VariantDraft,
    Vendor, VendorDraft,
};
