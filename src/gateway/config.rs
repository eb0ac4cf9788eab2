use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Target deployment of the downstream services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayEnvironment {
    #[default]
    Sandbox,
    Production,
}

impl GatewayEnvironment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Production => "production",
        }
    }
}

impl std::str::FromStr for GatewayEnvironment {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sandbox" | "dev" | "development" => Ok(Self::Sandbox),
            "production" | "prod" | "live" => Ok(Self::Production),
            other => Err(AppError::Config(format!("Unknown environment: {}", other))),
        }
    }
}

/// Host pair for one environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Base URL for downstream resource calls
    pub base_url: String,
    /// OAuth2 token endpoint
    pub token_url: String,
}

impl EndpointConfig {
    fn sandbox() -> Self {
        Self {
            base_url: "https://sandbox.api.service.nhs.uk".to_string(),
            token_url: "https://sandbox.api.service.nhs.uk/oauth2/token".to_string(),
        }
    }

    fn production() -> Self {
        Self {
            base_url: "https://api.service.nhs.uk".to_string(),
            token_url: "https://api.service.nhs.uk/oauth2/token".to_string(),
        }
    }
}

/// Client-credentials grant parameters
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ClientCredentials {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub scope: String,
}

// Never print the secret, not even in debug logs
impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("scope", &self.scope)
            .finish()
    }
}

/// Backing store for the sliding-window counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WindowStoreConfig {
    /// In-process map, single instance only
    #[default]
    Memory,
    /// SQLite file shared by every instance on the host
    Sqlite { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Limit for channels without an explicit entry
    #[serde(default = "default_channel_limit")]
    pub default_limit: u32,
    /// Length of the trailing window
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Per-channel overrides (channel name -> calls per window)
    #[serde(default = "default_channel_limits")]
    pub channels: HashMap<String, u32>,
    #[serde(default)]
    pub store: WindowStoreConfig,
    /// Skip admission entirely. Ignored in production.
    #[serde(default)]
    pub bypass: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_limit: default_channel_limit(),
            window_secs: default_window_secs(),
            channels: default_channel_limits(),
            store: WindowStoreConfig::default(),
            bypass: false,
        }
    }
}

impl RateLimitConfig {
    pub fn limit_for(&self, channel: &str) -> u32 {
        self.channels
            .get(channel)
            .copied()
            .unwrap_or(self.default_limit)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

fn default_channel_limit() -> u32 {
    60
}

fn default_window_secs() -> u64 {
    60
}

fn default_channel_limits() -> HashMap<String, u32> {
    HashMap::from([
        ("demographics".to_string(), 50),
        ("prescriptions".to_string(), 30),
        ("exemptions".to_string(), 20),
    ])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts for transient failures, first call included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Jitter as a fraction of the computed delay, clamped to [0, 1)
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
    /// Hint used when a 429 carries no Retry-After header
    #[serde(default = "default_retry_after_secs")]
    pub default_retry_after_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter_ratio: default_jitter_ratio(),
            default_retry_after_secs: default_retry_after_secs(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

fn default_jitter_ratio() -> f64 {
    0.5
}

fn default_retry_after_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSinkKind {
    #[default]
    Sqlite,
    Jsonl,
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub sink: AuditSinkKind,
    /// Sink location; defaults to the data directory
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Upstream proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpstreamProxyConfig {
    /// Whether enabled
    pub enabled: bool,
    /// Proxy address (http://, https://, socks5://)
    pub url: String,
}

/// Gateway client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub environment: GatewayEnvironment,

    #[serde(default = "EndpointConfig::sandbox")]
    pub sandbox: EndpointConfig,

    #[serde(default = "EndpointConfig::production")]
    pub production: EndpointConfig,

    #[serde(default)]
    pub credentials: ClientCredentials,

    /// Tokens this close to expiry are treated as expired
    #[serde(default = "default_safety_margin")]
    pub token_safety_margin_secs: u64,

    /// Physical attempts per token refresh
    #[serde(default = "default_refresh_attempts")]
    pub token_refresh_attempts: u32,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// TTL overrides keyed by data type name (e.g. "demographics")
    #[serde(default)]
    pub cache_ttl_secs: HashMap<String, u64>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    /// Deadline for one pipeline invocation (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub upstream_proxy: UpstreamProxyConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            environment: GatewayEnvironment::default(),
            sandbox: EndpointConfig::sandbox(),
            production: EndpointConfig::production(),
            credentials: ClientCredentials::default(),
            token_safety_margin_secs: default_safety_margin(),
            token_refresh_attempts: default_refresh_attempts(),
            rate_limit: RateLimitConfig::default(),
            cache_ttl_secs: HashMap::new(),
            retry: RetryConfig::default(),
            audit: AuditConfig::default(),
            request_timeout_secs: default_request_timeout(),
            upstream_proxy: UpstreamProxyConfig::default(),
        }
    }
}

fn default_safety_margin() -> u64 {
    60
}

fn default_refresh_attempts() -> u32 {
    3
}

fn default_request_timeout() -> u64 {
    30
}

impl GatewayConfig {
    /// Endpoints of the active environment
    pub fn endpoints(&self) -> &EndpointConfig {
        match self.environment {
            GatewayEnvironment::Sandbox => &self.sandbox,
            GatewayEnvironment::Production => &self.production,
        }
    }

    pub fn endpoints_mut(&mut self) -> &mut EndpointConfig {
        match self.environment {
            GatewayEnvironment::Sandbox => &mut self.sandbox,
            GatewayEnvironment::Production => &mut self.production,
        }
    }

    /// Effective bypass flag: production always enforces admission
    pub fn bypass_rate_limit(&self) -> bool {
        self.rate_limit.bypass && self.environment != GatewayEnvironment::Production
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn token_safety_margin(&self) -> Duration {
        Duration::from_secs(self.token_safety_margin_secs)
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> AppResult<()> {
        let endpoints = self.endpoints();
        url::Url::parse(&endpoints.base_url)
            .map_err(|e| AppError::Config(format!("Invalid base_url: {}", e)))?;
        url::Url::parse(&endpoints.token_url)
            .map_err(|e| AppError::Config(format!("Invalid token_url: {}", e)))?;

        if self.credentials.client_id.is_empty() {
            return Err(AppError::Config("client_id is not configured".to_string()));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(AppError::Config("rate_limit.window_secs must be > 0".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::Config("retry.max_attempts must be >= 1".to_string()));
        }
        if self.token_refresh_attempts == 0 {
            return Err(AppError::Config("token_refresh_attempts must be >= 1".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(AppError::Config("request_timeout_secs must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Internal HTTP surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Whether to start the HTTP surface
    #[serde(default)]
    pub enabled: bool,

    /// Whether to allow LAN access
    /// - false: local only 127.0.0.1 (default)
    /// - true: bind 0.0.0.0
    #[serde(default)]
    pub allow_lan_access: bool,

    /// Listening port
    pub port: u16,

    /// API key required from business services
    pub api_key: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_lan_access: false,
            port: 8046,
            api_key: format!("sk-{}", uuid::Uuid::new_v4().simple()),
        }
    }
}

impl ServerConfig {
    /// Get actual listening address
    pub fn get_bind_address(&self) -> &str {
        if self.allow_lan_access {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.credentials.client_id = "pharmacy-app".to_string();
        config
    }

    #[test]
    fn test_channel_limit_falls_back_to_default() {
        let config = RateLimitConfig::default();
        assert_eq!(config.limit_for("demographics"), 50);
        assert_eq!(config.limit_for("unlisted"), 60);
    }

    #[test]
    fn test_bypass_ignored_in_production() {
        let mut config = configured();
        config.rate_limit.bypass = true;
        assert!(config.bypass_rate_limit());

        config.environment = GatewayEnvironment::Production;
        assert!(!config.bypass_rate_limit());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{"environment":"production","rate_limit":{"default_limit":5}}"#,
        )
        .unwrap();
        assert_eq!(config.environment, GatewayEnvironment::Production);
        assert_eq!(config.rate_limit.default_limit, 5);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.endpoints().base_url, "https://api.service.nhs.uk");
    }

    #[test]
    fn test_validate_rejects_missing_client_id() {
        let config = GatewayConfig::default();
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
        assert!(configured().validate().is_ok());
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let creds = ClientCredentials {
            client_id: "id".to_string(),
            client_secret: "super-secret".to_string(),
            scope: "read".to_string(),
        };
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("super-secret"));
    }

    #[test]
    fn test_sqlite_store_config_parses() {
        let store: WindowStoreConfig =
            serde_json::from_str(r#"{"kind":"sqlite","path":"/tmp/windows.db"}"#).unwrap();
        assert!(matches!(store, WindowStoreConfig::Sqlite { .. }));
    }
}
