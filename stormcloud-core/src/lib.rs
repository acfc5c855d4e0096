//! StormCloud Core Library
//!
//! This library provides the request interception and rule resolution engine
//! for stubbing third-party vendor APIs: vendor and rule lookup, automatic
//! discovery of unknown endpoints, and response synthesis (flat bodies,
//! redirects, fixed status codes, delays and live passthrough).

pub mod action;
pub mod admin;
pub mod filter;
pub mod interceptor;
pub mod resolver;
/// Assembles the interceptor, admin routes and downstream fallback
pub mod server;
pub mod synthesizer;

/// Configuration types and utilities
pub mod config;

/// Rule store interface and in-memory implementation
pub mod store;

/// Error types for interception
pub mod error;

pub use action::Action;
pub use admin::{Metrics, MetricsResponse};
pub use config::{InterceptorConfig, ServerConfig, SynthesizerConfig};
pub use error::{StoreError, StubError};
pub use filter::BypassMatcher;
pub use interceptor::{intercept, Interception, Interceptor};
pub use resolver::{resolve_rule, resolve_vendor, ResolvedRule};
/// Re-export commonly used types
pub use server::StubServer;
pub use store::{MemoryStore, RuleStore};
pub use synthesizer::{apply_substitutions, select_variant, LiveRequest, Synthesis, Synthesizer};

/// Result type alias for interception operations
pub type Result<T> = std::result::Result<T, StubError>;
