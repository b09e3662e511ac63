//! Configuration module for the gateway
//!
//! This module handles configuration loading from TOML files and
//! environment variables, and converts the result into the runtime
//! configuration of each component.

use crate::nonce_manager::ReconcilerConfig;
use crate::session::{RateLimitConfig, SessionConfig};
use crate::streaming::{ConnectionConfig, EndpointConfig, ReconnectPolicy};
use crate::submission::ResubmitConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid value for {name}: {value:?}")]
    InvalidEnv { name: String, value: String },

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Local sequence state
    #[serde(default)]
    pub nonce: NonceConfig,

    /// Ledger event stream
    #[serde(default)]
    pub stream: StreamConfig,

    /// Session limits and eviction
    #[serde(default)]
    pub session: SessionSettings,

    /// Ledger HTTP API
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Unconfirmed transaction records
    #[serde(default)]
    pub pending: PendingConfig,

    /// Monitoring and metrics
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceConfig {
    /// Directory holding the persisted nonce map
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_nonce_file")]
    pub file_name: String,

    /// Older single-file location migrated on first run
    #[serde(default)]
    pub legacy_path: Option<PathBuf>,

    /// Backward drift tolerated as indexer lag
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold: u64,

    #[serde(default = "default_min_reconcile_interval_ms")]
    pub min_reconcile_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub primary_url: Option<String>,

    #[serde(default)]
    pub override_url: Option<String>,

    /// Origin of a reverse proxy forwarding `/ws`
    #[serde(default)]
    pub proxy_origin: Option<String>,

    #[serde(default)]
    pub fallback_port: Option<u16>,

    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Drop connections silent for this long
    #[serde(default)]
    pub stale_after_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_max_sessions_per_identity")]
    pub max_sessions_per_identity: usize,

    #[serde(default = "default_rate_limit_points")]
    pub rate_limit_points: u32,

    #[serde(default = "default_one_hour")]
    pub rate_limit_window_secs: u64,

    #[serde(default = "default_one_hour")]
    pub rate_limit_block_secs: u64,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_url")]
    pub base_url: String,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Retries for account lookups
    #[serde(default = "default_max_fetch_retries")]
    pub max_fetch_retries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingConfig {
    #[serde(default = "default_pending_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_resubmit_interval_ms")]
    pub resubmit_interval_ms: u64,

    #[serde(default = "default_resubmit_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

// Default value functions
fn default_data_dir() -> PathBuf { PathBuf::from("data") }
fn default_nonce_file() -> String { "nonces.json".to_string() }
fn default_drift_threshold() -> u64 { 100 }
fn default_min_reconcile_interval_ms() -> u64 { 5000 }
fn default_reconnect_base_ms() -> u64 { 1000 }
fn default_reconnect_max_ms() -> u64 { 30_000 }
fn default_jitter_ratio() -> f64 { 0.3 }
fn default_connect_timeout_ms() -> u64 { 10_000 }
fn default_max_sessions_per_identity() -> usize { 5 }
fn default_rate_limit_points() -> u32 { 10 }
fn default_one_hour() -> u64 { 3600 }
fn default_idle_timeout_secs() -> u64 { 1800 }
fn default_sweep_interval_secs() -> u64 { 60 }
fn default_ledger_url() -> String { "http://127.0.0.1:8080".to_string() }
fn default_request_timeout_ms() -> u64 { 10_000 }
fn default_max_fetch_retries() -> usize { 3 }
fn default_pending_db_path() -> PathBuf { PathBuf::from("data/pending") }
fn default_resubmit_interval_ms() -> u64 { 5000 }
fn default_resubmit_max_retries() -> u32 { 20 }
fn default_metrics_port() -> u16 { 9090 }
fn default_true() -> bool { true }

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            file_name: default_nonce_file(),
            legacy_path: None,
            drift_threshold: default_drift_threshold(),
            min_reconcile_interval_ms: default_min_reconcile_interval_ms(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            primary_url: None,
            override_url: None,
            proxy_origin: None,
            fallback_port: None,
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            jitter_ratio: default_jitter_ratio(),
            connect_timeout_ms: default_connect_timeout_ms(),
            stale_after_ms: None,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_sessions_per_identity: default_max_sessions_per_identity(),
            rate_limit_points: default_rate_limit_points(),
            rate_limit_window_secs: default_one_hour(),
            rate_limit_block_secs: default_one_hour(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            base_url: default_ledger_url(),
            request_timeout_ms: default_request_timeout_ms(),
            max_fetch_retries: default_max_fetch_retries(),
        }
    }
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            db_path: default_pending_db_path(),
            resubmit_interval_ms: default_resubmit_interval_ms(),
            max_retries: default_resubmit_max_retries(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: default_true(),
            metrics_port: default_metrics_port(),
        }
    }
}

fn parse_env<T: FromStr>(name: &str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name: name.to_string(),
        value,
    })
}

impl GatewayConfig {
    /// Parse a TOML document
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// File (or defaults), then `.env` and process environment, then validation
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_from(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `GATEWAY_*` overrides read through `lookup`
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        macro_rules! override_from {
            ($name:literal, $field:expr) => {
                if let Some(value) = lookup($name) {
                    $field = parse_env($name, value)?;
                }
            };
        }

        override_from!("GATEWAY_MAX_SESSIONS_PER_IDENTITY", self.session.max_sessions_per_identity);
        override_from!("GATEWAY_SESSION_RATE_LIMIT_POINTS", self.session.rate_limit_points);
        override_from!("GATEWAY_SESSION_RATE_LIMIT_WINDOW_SECS", self.session.rate_limit_window_secs);
        override_from!("GATEWAY_SESSION_RATE_LIMIT_BLOCK_SECS", self.session.rate_limit_block_secs);
        override_from!("GATEWAY_MIN_RECONCILE_INTERVAL_MS", self.nonce.min_reconcile_interval_ms);
        override_from!("GATEWAY_RECONNECT_BASE_MS", self.stream.reconnect_base_ms);
        override_from!("GATEWAY_RECONNECT_MAX_MS", self.stream.reconnect_max_ms);
        override_from!("GATEWAY_DRIFT_THRESHOLD", self.nonce.drift_threshold);

        if let Some(url) = lookup("GATEWAY_LEDGER_URL") {
            self.ledger.base_url = url;
        }
        if let Some(url) = lookup("GATEWAY_STREAM_URL") {
            self.stream.primary_url = Some(url);
        }
        if let Some(dir) = lookup("GATEWAY_DATA_DIR") {
            self.nonce.data_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |message: &str| Err(ConfigError::Validation(message.to_string()));

        if self.session.max_sessions_per_identity == 0 {
            return fail("session.max_sessions_per_identity must be at least 1");
        }
        if self.session.rate_limit_points == 0 {
            return fail("session.rate_limit_points must be at least 1");
        }
        if self.session.rate_limit_window_secs == 0 {
            return fail("session.rate_limit_window_secs must be positive");
        }
        if self.session.sweep_interval_secs == 0 {
            return fail("session.sweep_interval_secs must be positive");
        }
        if self.pending.resubmit_interval_ms == 0 {
            return fail("pending.resubmit_interval_ms must be positive");
        }
        if self.stream.reconnect_base_ms == 0 {
            return fail("stream.reconnect_base_ms must be positive");
        }
        if self.stream.reconnect_max_ms < self.stream.reconnect_base_ms {
            return fail("stream.reconnect_max_ms must be >= stream.reconnect_base_ms");
        }
        if !(0.0..=1.0).contains(&self.stream.jitter_ratio) {
            return fail("stream.jitter_ratio must be between 0.0 and 1.0");
        }
        if self.nonce.file_name.is_empty() {
            return fail("nonce.file_name must not be empty");
        }
        if self.ledger.base_url.is_empty() {
            return fail("ledger.base_url must not be empty");
        }
        Ok(())
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            drift_threshold: self.nonce.drift_threshold,
            min_interval: Duration::from_millis(self.nonce.min_reconcile_interval_ms),
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            endpoints: EndpointConfig {
                override_url: self.stream.override_url.clone(),
                primary_url: self.stream.primary_url.clone(),
                proxy_origin: self.stream.proxy_origin.clone(),
                fallback_port: self.stream.fallback_port,
            },
            reconnect: ReconnectPolicy {
                base_ms: self.stream.reconnect_base_ms,
                max_ms: self.stream.reconnect_max_ms,
                jitter_ratio: self.stream.jitter_ratio,
            },
            stale_after: self.stream.stale_after_ms.map(Duration::from_millis),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_sessions_per_identity: self.session.max_sessions_per_identity,
            rate_limit: RateLimitConfig {
                points: self.session.rate_limit_points,
                window: Duration::from_secs(self.session.rate_limit_window_secs),
                block_duration: Duration::from_secs(self.session.rate_limit_block_secs),
            },
            idle_timeout: Duration::from_secs(self.session.idle_timeout_secs),
            sweep_interval: Duration::from_secs(self.session.sweep_interval_secs),
            connection: self.connection_config(),
        }
    }

    pub fn resubmit_config(&self) -> ResubmitConfig {
        ResubmitConfig {
            interval: Duration::from_millis(self.pending.resubmit_interval_ms),
            max_retries: self.pending.max_retries,
        }
    }
}
