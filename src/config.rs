use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{DEFAULT_MAX_RECORDS, DEFAULT_RPC_URL, DEFAULT_WS_URL};

/// Default config file path.
pub const CONFIG_PATH: &str = "config.toml";

/// Top-level application config deserialized from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

/// Feed connection and store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// Maximum number of records kept in the store.
    #[serde(default = "default_max_records")]
    pub max_records: usize,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Keep-alive interval; `0` disables pings.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// First reconnect delay; doubles each attempt.
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_age_refresh")]
    pub age_refresh_interval_ms: u64,
}

/// Credentials. Both are optional; the token may also come from the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Bearer token issued by the signal service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Hex-encoded wallet private key (with or without 0x prefix).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

/// Ledger RPC settings used for subscription payment gating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_secs: u64,
    #[serde(default = "default_confirmation_poll")]
    pub confirmation_poll_ms: u64,
}

fn default_ws_url() -> String {
    DEFAULT_WS_URL.to_string()
}

fn default_max_records() -> usize {
    DEFAULT_MAX_RECORDS
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_ping_interval() -> u64 {
    30
}

fn default_reconnect_base() -> u64 {
    1_000
}

fn default_reconnect_max() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_age_refresh() -> u64 {
    1_000
}

fn default_rpc_url() -> String {
    DEFAULT_RPC_URL.to_string()
}

fn default_confirmation_timeout() -> u64 {
    90
}

fn default_confirmation_poll() -> u64 {
    2_000
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            max_records: default_max_records(),
            handshake_timeout_secs: default_handshake_timeout(),
            ping_interval_secs: default_ping_interval(),
            reconnect_base_delay_ms: default_reconnect_base(),
            reconnect_max_delay_ms: default_reconnect_max(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            age_refresh_interval_ms: default_age_refresh(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            confirmation_timeout_secs: default_confirmation_timeout(),
            confirmation_poll_ms: default_confirmation_poll(),
        }
    }
}

impl FeedConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn age_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.age_refresh_interval_ms.max(1))
    }

    /// Reject settings the connection manager cannot run with.
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.ws_url)
            .with_context(|| format!("invalid feed.ws_url `{}`", self.ws_url))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            bail!("feed.ws_url must use ws:// or wss://, got `{}`", url.scheme());
        }
        if self.max_records == 0 {
            bail!("feed.max_records must be at least 1");
        }
        if self.handshake_timeout_secs == 0 {
            bail!("feed.handshake_timeout_secs must be positive");
        }
        Ok(())
    }
}

impl LedgerConfig {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn confirmation_poll(&self) -> Duration {
        Duration::from_millis(self.confirmation_poll_ms.max(1))
    }
}

impl AppConfig {
    /// Load config from the given TOML file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.feed.validate()?;
        Ok(config)
    }

    /// Load config if the file exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write config to the given TOML file path.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}
