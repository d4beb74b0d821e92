//! Configuration for the batch settlement service

use crate::{Error, Result};
use clearing_protocol::{AssetRegistry, SessionConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

/// Batch settlement configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Batch window configuration
    pub window: WindowConfig,

    /// Queue configuration
    pub queue: QueueConfig,

    /// Clearing network configuration
    pub clearing: ClearingConfig,

    /// Settlement endpoint configuration
    pub settlement: SettlementConfig,

    /// SMS notification configuration
    pub notifications: NotificationConfig,

    /// Wallet configuration
    pub wallet: WalletConfig,
}

/// Batch window configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Interval between scheduler ticks (default: 3 minutes)
    pub interval_seconds: u64,

    /// Clearing deadline per batch
    pub batch_timeout_seconds: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 180,
            batch_timeout_seconds: 60,
        }
    }
}

impl WindowConfig {
    /// Tick interval
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// Batch deadline
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_seconds)
    }
}

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Capacity of the recently-completed view
    pub recent_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            recent_capacity: 1000,
        }
    }
}

/// Clearing network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClearingConfig {
    /// WebSocket endpoint
    pub endpoint: String,

    /// Application name declared at authentication
    pub application: String,

    /// Session key scope
    pub scope: String,

    /// Session key expiry
    pub session_expiry_seconds: u64,

    /// Settlement assets, code → decimal exponent
    pub assets: BTreeMap<String, u32>,

    /// Use the in-process mock network (dry run)
    pub mock_enabled: bool,

    /// On connection loss, settle unresolved requests through fallback
    /// instead of requeueing them
    pub fallback_on_connection_loss: bool,
}

impl Default for ClearingConfig {
    fn default() -> Self {
        let mut assets = BTreeMap::new();
        assets.insert("usdc".to_string(), 6);

        Self {
            endpoint: "wss://clearnet.yellow.com/ws".to_string(),
            application: "batch-settlement".to_string(),
            scope: "transfer".to_string(),
            session_expiry_seconds: 3600,
            assets,
            mock_enabled: false,
            fallback_on_connection_loss: true,
        }
    }
}

impl ClearingConfig {
    /// Asset registry for amount conversion
    pub fn asset_registry(&self) -> Result<AssetRegistry> {
        let mut registry = AssetRegistry::new();
        for (code, decimals) in &self.assets {
            registry
                .register(code, *decimals)
                .map_err(|e| Error::Config(e.to_string()))?;
        }
        Ok(registry)
    }

    /// Per-session protocol parameters
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            application: self.application.clone(),
            scope: self.scope.clone(),
            session_ttl: Duration::from_secs(self.session_expiry_seconds),
        }
    }
}

/// Settlement endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Settlement/minting endpoint
    pub endpoint: String,

    /// Per-request timeout
    pub timeout_seconds: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:3000/api/settle".to_string(),
            timeout_seconds: 30,
        }
    }
}

/// SMS notification configuration
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Send SMS on request outcome
    pub enabled: bool,

    /// Twilio account SID
    pub account_sid: String,

    /// Twilio auth token
    #[serde(skip_serializing)]
    pub auth_token: String,

    /// Sender phone number
    pub from_number: String,
}

impl std::fmt::Debug for NotificationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationConfig")
            .field("enabled", &self.enabled)
            .field("account_sid", &self.account_sid)
            .field("from_number", &self.from_number)
            .finish_non_exhaustive()
    }
}

/// Wallet configuration
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Hex-encoded 32-byte seed of the long-lived wallet key; a random key is
    /// generated when absent
    #[serde(skip_serializing)]
    pub seed_hex: Option<String>,
}

impl std::fmt::Debug for WalletConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletConfig")
            .field("seed_hex", &self.seed_hex.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables (and `.env`)
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let mut config = Config::default();

        if let Some(secs) = parse_var("BATCH_INTERVAL_SECONDS")? {
            config.window.interval_seconds = secs;
        }
        if let Some(secs) = parse_var("BATCH_TIMEOUT_SECONDS")? {
            config.window.batch_timeout_seconds = secs;
        }
        if let Some(capacity) = parse_var("BATCH_RECENT_CAPACITY")? {
            config.queue.recent_capacity = capacity;
        }

        if let Ok(endpoint) = env::var("BATCH_CLEARING_ENDPOINT") {
            config.clearing.endpoint = endpoint;
        }
        if let Ok(application) = env::var("BATCH_CLEARING_APPLICATION") {
            config.clearing.application = application;
        }
        if let Some(mock) = parse_var("BATCH_CLEARING_MOCK")? {
            config.clearing.mock_enabled = mock;
        }
        if let Some(fallback) = parse_var("BATCH_FALLBACK_ON_CONNECTION_LOSS")? {
            config.clearing.fallback_on_connection_loss = fallback;
        }
        // Comma-separated code:decimals pairs, e.g. "usdc:6,eth:18"
        if let Ok(assets) = env::var("BATCH_CLEARING_ASSETS") {
            config.clearing.assets = parse_assets(&assets)?;
        }

        if let Ok(endpoint) = env::var("BATCH_SETTLEMENT_ENDPOINT") {
            config.settlement.endpoint = endpoint;
        }
        if let Some(secs) = parse_var("BATCH_SETTLEMENT_TIMEOUT_SECONDS")? {
            config.settlement.timeout_seconds = secs;
        }

        if let (Ok(sid), Ok(token), Ok(from)) = (
            env::var("TWILIO_ACCOUNT_SID"),
            env::var("TWILIO_AUTH_TOKEN"),
            env::var("TWILIO_PHONE_NUMBER"),
        ) {
            config.notifications = NotificationConfig {
                enabled: true,
                account_sid: sid,
                auth_token: token,
                from_number: from,
            };
        }

        if let Ok(seed) = env::var("BATCH_WALLET_SEED") {
            config.wallet.seed_hex = Some(seed);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.window.interval_seconds == 0 {
            return Err(Error::Config("window.interval_seconds must be > 0".to_string()));
        }
        if self.window.batch_timeout_seconds == 0 {
            return Err(Error::Config(
                "window.batch_timeout_seconds must be > 0".to_string(),
            ));
        }
        if !self.clearing.mock_enabled && self.clearing.endpoint.trim().is_empty() {
            return Err(Error::Config("clearing.endpoint is required".to_string()));
        }
        if self.clearing.assets.is_empty() {
            return Err(Error::Config("clearing.assets must not be empty".to_string()));
        }
        self.clearing.asset_registry()?;
        if self.settlement.endpoint.trim().is_empty() {
            return Err(Error::Config("settlement.endpoint is required".to_string()));
        }
        if self.notifications.enabled
            && (self.notifications.account_sid.is_empty()
                || self.notifications.auth_token.is_empty()
                || self.notifications.from_number.is_empty())
        {
            return Err(Error::Config(
                "notifications need account_sid, auth_token and from_number".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} has invalid value '{}'", name, raw))),
        Err(_) => Ok(None),
    }
}

fn parse_assets(raw: &str) -> Result<BTreeMap<String, u32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (code, decimals) = pair
                .split_once(':')
                .ok_or_else(|| Error::Config(format!("asset '{}' is not code:decimals", pair)))?;
            let decimals = decimals
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("asset '{}' has invalid decimals", pair)))?;
            Ok((code.trim().to_ascii_lowercase(), decimals))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.window.interval(), Duration::from_secs(180));
        assert_eq!(config.clearing.asset_registry().unwrap().decimals("usdc"), Some(6));
    }

    #[test]
    fn test_serialized_config_omits_secrets() {
        let mut config = Config::default();
        config.notifications.account_sid = "AC123".to_string();
        config.notifications.auth_token = "twilio-secret".to_string();
        config.wallet.seed_hex = Some("07".repeat(32));

        let dumped = serde_json::to_string(&config).unwrap();
        assert!(dumped.contains("AC123"));
        assert!(!dumped.contains("twilio-secret"));
        assert!(!dumped.contains(&"07".repeat(32)));
    }

    #[test]
    fn test_from_file_partial_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[window]
interval_seconds = 30

[clearing]
mock_enabled = true
assets = {{ usdc = 6, eth = 18 }}
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.window.interval_seconds, 30);
        assert_eq!(config.window.batch_timeout_seconds, 60);
        assert!(config.clearing.mock_enabled);
        assert_eq!(config.clearing.assets.get("eth"), Some(&18));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.window.interval_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.clearing.assets.insert("huge".to_string(), 19);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.notifications.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_assets() {
        let assets = parse_assets("USDC:6, eth:18").unwrap();
        assert_eq!(assets.get("usdc"), Some(&6));
        assert_eq!(assets.get("eth"), Some(&18));
        assert!(parse_assets("usdc").is_err());
        assert!(parse_assets("usdc:x").is_err());
    }

    #[test]
    fn test_secrets_not_in_debug() {
        let mut config = Config::default();
        config.notifications.auth_token = "twilio-secret".to_string();
        config.wallet.seed_hex = Some("abcd".repeat(16));

        let debug = format!("{:?}", config);
        assert!(!debug.contains("twilio-secret"));
        assert!(!debug.contains("abcdabcd"));
    }
}
