//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for deployment.
//! Config precedence: env vars > .env file > peerlink.toml > defaults

use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG.get().expect("Config not initialized. Call peerlink_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let app_config = load()?;
    tracing::debug!(
        signalling = %app_config.signalling.url,
        discovery = %app_config.discovery.base_url,
        "Configuration loaded"
    );
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Build a configuration without touching the global slot.
pub fn load() -> Result<AppConfig, config::ConfigError> {
    let cfg = config::Config::builder()
        // Defaults
        .set_default("signalling.url", "ws://localhost:6021")?
        .set_default("signalling.reconnect", true)?
        .set_default("signalling.reconnect_delay_ms", 1000)?
        .set_default("discovery.base_url", "http://localhost:6020")?
        .set_default("discovery.timeout_secs", 5)?
        .set_default("session.playback_delay_ms", 0)?
        .set_default("session.ice_addresses", Vec::<String>::new())?
        .set_default("session.ice_protocols", Vec::<String>::new())?
        // Optional config file
        .add_source(config::File::with_name("peerlink").required(false))
        // Environment variables (PEERLINK__SIGNALLING__URL, PEERLINK__SESSION__ICE_PROTOCOLS=udp,tcp, ...)
        .add_source(
            config::Environment::with_prefix("PEERLINK")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("session.ice_addresses")
                .with_list_parse_key("session.ice_protocols")
                .try_parsing(true),
        )
        .build()?;

    cfg.try_deserialize()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub signalling: SignallingConfig,
    pub discovery: DiscoveryConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SignallingConfig {
    /// WebSocket URL of the signalling server (ws:// or wss://).
    pub url: String,
    /// Reconnect automatically after the socket closes.
    pub reconnect: bool,
    /// Fixed backoff before the single reconnect attempt.
    pub reconnect_delay_ms: u64,
}

impl SignallingConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    /// Base URL of the producer HTTP API; `/streams` is appended.
    pub base_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Receiver jitter target in milliseconds (clamped to 0..=4000 when applied).
    pub playback_delay_ms: i64,
    /// Only candidates mentioning one of these addresses are accepted. Empty = all.
    pub ice_addresses: Vec<String>,
    /// Only candidates mentioning one of these protocols are accepted. Empty = all.
    pub ice_protocols: Vec<String>,
}
