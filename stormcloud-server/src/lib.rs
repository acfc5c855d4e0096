//! StormCloud server
//!
//! Wires the interception engine to a SQLite rule store and mounts the admin
//! JSON API next to it.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stormcloud_core::{ServerConfig, StubError, StubServer};
use thiserror::Error;
use tracing::info;

pub mod database;
pub mod http;
pub mod logging;

pub use database::{Database, RuleFilter};
pub use http::{admin_routes, AdminError};
pub use logging::{init_logging, LoggingConfig};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Stub(#[from] StubError),
}

/// StormCloud - a stub server that stands in for third-party vendor APIs
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// TOML configuration file
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    pub listen_address: Option<String>,

    /// Port to listen on
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// Database connection URL
    #[arg(long)]
    pub database_url: Option<String>,

    /// Timeout for live passthrough fetches in milliseconds
    #[arg(long)]
    pub live_timeout_ms: Option<u64>,

    /// Path pattern that is never intercepted (repeatable, replaces the defaults)
    #[arg(long = "bypass")]
    pub bypass: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Emit JSON formatted logs
    #[arg(long)]
    pub log_json: bool,

    /// Also write logs to this file, rotated daily
    #[arg(long)]
    pub log_file: Option<String>,
}

/// Complete startup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StubConfig {
    pub database_url: String,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:./stormcloud.db".to_string(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl StubConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ServerError> {
        toml::from_str(contents).map_err(|e| ServerError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    /// Defaults, then the config file if one was given, then CLI flags
    pub fn from_args(args: &Args) -> Result<Self, ServerError> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_args(&mut self, args: &Args) {
        if let Some(address) = &args.listen_address {
            self.server.listen_address = address.clone();
        }
        if let Some(port) = args.listen_port {
            self.server.listen_port = port;
        }
        if let Some(url) = &args.database_url {
            self.database_url = url.clone();
        }
        if let Some(timeout) = args.live_timeout_ms {
            self.server.interceptor.live_timeout_ms = timeout;
        }
        if !args.bypass.is_empty() {
            self.server.interceptor.bypass = args.bypass.clone();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if args.log_json {
            self.logging.json_format = true;
        }
        if let Some(file) = &args.log_file {
            self.logging.log_file = Some(file.clone());
        }
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if !logging::levels::is_valid_level(&self.logging.level) {
            return Err(ServerError::Config(format!(
                "Unknown log level {:?}",
                self.logging.level
            )));
        }
        if self.server.interceptor.live_timeout_ms == 0 {
            return Err(ServerError::Config(
                "live_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if !self
            .server
            .interceptor
            .bypass
            .iter()
            .any(|pattern| pattern.starts_with("/admin"))
        {
            tracing::warn!("The admin API is not bypassed and will be intercepted like any other path");
        }
        Ok(())
    }
}

/// Build the stub server on top of the SQLite store
pub async fn build_server(config: &StubConfig) -> Result<StubServer, ServerError> {
    let db = Arc::new(Database::new(&config.database_url).await?);
    Ok(StubServer::new(config.server.clone(), db.clone()).with_admin_routes(admin_routes(db)))
}

pub async fn run(config: StubConfig) -> Result<(), ServerError> {
    let server = build_server(&config).await?;
    info!("💾 Database: {}", config.database_url);
    info!(
        "🌐 Admin API: http://{}:{}/admin/",
        config.server.listen_address, config.server.listen_port
    );
    server.run().await?;
    Ok(())
}
