//! Client settings file
//!
//! TOML or JSON, picked by file extension. Every field has a default, so an
//! empty file is a valid configuration.
//!
//! ```toml
//! control_url = "https://api.example.com/vpn"
//! user_id = "user_123"
//! token = "..."
//! session_log = "sessions.jsonl"
//! remote_directory = true
//! report_sessions = true
//! routing = { mode = "split", ranges = ["10.0.0.0/8"] }
//!
//! [timeouts]
//! handshake_ms = 3000
//!
//! [[servers]]
//! id = "us-east-1"
//! name = "US East"
//! location = "New York"
//! endpoint = "104.248.45.23:51820"
//! public_key = "<base64>"
//! ```

use crate::backoff::RetryPolicy;
use crate::config::{RoutingPolicy, Timings, default_dns};
use crate::directory::ServerDescriptor;
use crate::resolver::DEFAULT_REQUEST_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Settings file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// Format implied by a path's extension
    pub fn from_path(path: &Path) -> Result<Self, SettingsError> {
        match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "toml" => Ok(ConfigFormat::Toml),
            "json" => Ok(ConfigFormat::Json),
            other => Err(SettingsError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Timeout section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub resolve_ms: u64,
    pub handshake_ms: u64,
    pub keepalive_interval_secs: u64,
    pub keepalive_misses: u32,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        let timings = Timings::default();
        Self {
            resolve_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            handshake_ms: timings.handshake_timeout.as_millis() as u64,
            keepalive_interval_secs: timings.keepalive_interval.as_secs(),
            keepalive_misses: timings.keepalive_misses,
        }
    }
}

/// Retry section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub factor: u32,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            factor: policy.factor,
            max_delay_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

fn default_control_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_user_id() -> String {
    "local".to_string()
}

fn default_token_ttl() -> u64 {
    3600
}

/// Client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Base URL of the control plane
    #[serde(default = "default_control_url")]
    pub control_url: String,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    /// Static bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    /// Fallback resolvers when the server assigns none
    #[serde(default = "default_dns")]
    pub dns: Vec<IpAddr>,
    /// Append closed sessions here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_log: Option<PathBuf>,
    #[serde(default)]
    pub allow_premium: bool,
    /// Fetch the server list from the control plane instead of `servers`
    #[serde(default)]
    pub remote_directory: bool,
    /// Register session start and end with the control plane
    #[serde(default)]
    pub report_sessions: bool,
    #[serde(default)]
    pub routing: RoutingPolicy,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            control_url: default_control_url(),
            user_id: default_user_id(),
            token: None,
            token_ttl_secs: default_token_ttl(),
            dns: default_dns(),
            session_log: None,
            allow_premium: false,
            remote_directory: false,
            report_sessions: false,
            routing: RoutingPolicy::default(),
            timeouts: TimeoutSettings::default(),
            retry: RetrySettings::default(),
            servers: Vec::new(),
        }
    }
}

impl ClientSettings {
    /// Load from a `.toml` or `.json` file
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let format = ConfigFormat::from_path(path)?;
        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::Io(format!("{}: {}", path.display(), e)))?;

        let settings = Self::from_str_as(&content, format)?;
        info!(
            "Loaded settings from {} ({} servers)",
            path.display(),
            settings.servers.len()
        );
        Ok(settings)
    }

    pub fn from_str_as(content: &str, format: ConfigFormat) -> Result<Self, SettingsError> {
        let settings: Self = match format {
            ConfigFormat::Toml => toml::from_str(content).map_err(|e| SettingsError::Parse(e.to_string()))?,
            ConfigFormat::Json => serde_json::from_str(content).map_err(|e| SettingsError::Parse(e.to_string()))?,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.control_url.trim().is_empty() {
            return Err(SettingsError::Invalid("control_url is empty".into()));
        }
        if self.timeouts.handshake_ms == 0 || self.timeouts.resolve_ms == 0 {
            return Err(SettingsError::Invalid("timeouts must be non-zero".into()));
        }
        if self.timeouts.keepalive_interval_secs == 0 || self.timeouts.keepalive_misses == 0 {
            return Err(SettingsError::Invalid("keepalive interval and misses must be non-zero".into()));
        }
        if self.retry.attempts == 0 {
            return Err(SettingsError::Invalid("retry.attempts must be at least 1".into()));
        }
        for server in &self.servers {
            server
                .validate()
                .map_err(|e| SettingsError::Invalid(e.to_string()))?;
        }
        Ok(())
    }

    pub fn timings(&self) -> Timings {
        Timings {
            handshake_timeout: Duration::from_millis(self.timeouts.handshake_ms),
            keepalive_interval: Duration::from_secs(self.timeouts.keepalive_interval_secs),
            keepalive_misses: self.timeouts.keepalive_misses,
        }
    }

    /// Per-request control-plane timeout
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.resolve_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            factor: self.retry.factor,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    /// Export as JSON
    pub fn to_json(&self) -> Result<String, SettingsError> {
        serde_json::to_string_pretty(self).map_err(|e| SettingsError::Parse(e.to_string()))
    }
}

/// Settings errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported config format: {0:?}")]
    UnsupportedFormat(String),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}
