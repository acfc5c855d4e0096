//! Configuration types and utilities

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Static Server Startup Configuration
/// These settings are set at startup and do not change during runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_address: String,
    /// Port to listen on
    pub listen_port: u16,
    /// Interception behaviour
    pub interceptor: InterceptorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 8000,
            interceptor: InterceptorConfig::default(),
        }
    }
}

/// Interceptor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptorConfig {
    /// Paths that are never intercepted. Patterns containing `*` or `?` are
    /// globs over the whole path, anything else is a literal prefix.
    pub bypass: Vec<String>,
    /// Timeout for the live passthrough fetch in milliseconds
    pub live_timeout_ms: u64,
    /// Largest inbound body forwarded to a live target
    pub max_forward_body_bytes: usize,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            bypass: vec!["/admin/".to_string()],
            live_timeout_ms: 5_000,
            max_forward_body_bytes: 2 * 1024 * 1024,
        }
    }
}

impl InterceptorConfig {
    pub fn live_timeout(&self) -> Duration {
        Duration::from_millis(self.live_timeout_ms)
    }

    pub fn synthesizer(&self) -> SynthesizerConfig {
        SynthesizerConfig {
            live_timeout: self.live_timeout(),
        }
    }
}

/// Response synthesizer configuration
#[derive(Debug, Clone)]
pub struct SynthesizerConfig {
    pub live_timeout: Duration,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        InterceptorConfig::default().synthesizer()
    }
}
