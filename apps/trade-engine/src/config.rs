//! Configuration module for the trade engine.
//!
//! Provides configuration loading, validation, and environment variable
//! interpolation for all engine components.
//!
//! # Usage
//!
//! ```rust,ignore
//! use trade_engine::config::load_config;
//!
//! // Load from default path (config.yaml)
//! let config = load_config(None)?;
//!
//! // Load from custom path
//! let config = load_config(Some("custom/config.yaml"))?;
//!
//! println!("broker port: {}", config.broker.port);
//! ```

use std::time::Duration;

use chrono::NaiveTime;
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    ReadError {
        /// Path to the config file.
        path: String,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("Failed to parse config YAML: {0}")]
    ParseError(#[from] serde_yaml_bw::Error),

    /// Configuration validation failed.
    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Engine identity and sequencer settings.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Broker connection settings.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Trading rules.
    #[serde(default)]
    pub trading: TradingConfig,
    /// Market session boundaries.
    #[serde(default)]
    pub market_hours: MarketHoursConfig,
    /// Durable state.
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ============================================================================
// Engine
// ============================================================================

/// Engine identity and sequencer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine name used in notifications.
    #[serde(default = "default_engine_name")]
    pub name: String,
    /// Broker account traded by this engine.
    #[serde(default)]
    pub account_id: String,
    /// Client id, unique among engines sharing a broker endpoint.
    #[serde(default = "default_client_id")]
    pub client_id: u32,
    /// Seconds between supervisor ticks.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Capacity of the command queue feeding the sequencer.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: default_engine_name(),
            account_id: String::new(),
            client_id: default_client_id(),
            tick_interval_secs: default_tick_interval_secs(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

impl EngineConfig {
    /// Supervisor tick interval.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

fn default_engine_name() -> String {
    "TradingBot".to_string()
}
const fn default_client_id() -> u32 {
    1
}
const fn default_tick_interval_secs() -> u64 {
    5
}
const fn default_event_queue_capacity() -> usize {
    1024
}

// ============================================================================
// Broker
// ============================================================================

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker gateway host.
    #[serde(default = "default_broker_host")]
    pub host: String,
    /// Broker gateway port.
    #[serde(default = "default_broker_port")]
    pub port: u16,
    /// Fixed delay between reconnection attempts.
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
    /// Reconnection attempts before escalating.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Seconds to wait for a submission acknowledgement.
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    /// Submissions held while disconnected before alerts are refused.
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            ack_timeout_secs: default_ack_timeout_secs(),
            max_queue_depth: default_max_queue_depth(),
        }
    }
}

impl BrokerConfig {
    /// Delay between reconnection attempts.
    #[must_use]
    pub const fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    /// Submission acknowledgement timeout.
    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }
}

fn default_broker_host() -> String {
    "127.0.0.1".to_string()
}
const fn default_broker_port() -> u16 {
    7497
}
const fn default_reconnect_interval_secs() -> u64 {
    5
}
const fn default_max_reconnect_attempts() -> u32 {
    10
}
const fn default_ack_timeout_secs() -> u64 {
    10
}
const fn default_max_queue_depth() -> usize {
    100
}

// ============================================================================
// Trading
// ============================================================================

/// Trading rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Quantity used when an opening alert carries none.
    #[serde(default = "default_quantity")]
    pub default_quantity: u64,
    /// Largest quantity accepted for one alert.
    #[serde(default = "default_max_position_size")]
    pub max_position_size: u64,
    /// Accept alerts during pre-market.
    #[serde(default = "default_true")]
    pub enable_pre_market: bool,
    /// Accept alerts during post-market.
    #[serde(default = "default_true")]
    pub enable_post_market: bool,
    /// Accept `short` alerts.
    #[serde(default = "default_true")]
    pub enable_short_selling: bool,
    /// Absolute age after which a LIMIT order is expired.
    #[serde(default = "default_order_timeout_minutes")]
    pub order_timeout_minutes: u64,
    /// Resubmissions allowed before a LIMIT order is expired.
    #[serde(default = "default_max_resubmissions")]
    pub max_resubmissions: u32,
    /// Lower bound of the per-order resubmission interval.
    #[serde(default = "default_resubmit_interval_min_secs")]
    pub resubmit_interval_min_secs: u64,
    /// Upper bound of the per-order resubmission interval.
    #[serde(default = "default_resubmit_interval_max_secs")]
    pub resubmit_interval_max_secs: u64,
    /// Distance of a quote-derived limit price from the quote, in basis points.
    #[serde(default = "default_limit_price_buffer_bps")]
    pub limit_price_buffer_bps: Decimal,
    /// Seconds after which an unfilled MARKET order is reported.
    #[serde(default = "default_market_order_timeout_secs")]
    pub market_order_timeout_secs: u64,
    /// Window in which replayed alerts are ignored.
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            default_quantity: default_quantity(),
            max_position_size: default_max_position_size(),
            enable_pre_market: true,
            enable_post_market: true,
            enable_short_selling: true,
            order_timeout_minutes: default_order_timeout_minutes(),
            max_resubmissions: default_max_resubmissions(),
            resubmit_interval_min_secs: default_resubmit_interval_min_secs(),
            resubmit_interval_max_secs: default_resubmit_interval_max_secs(),
            limit_price_buffer_bps: default_limit_price_buffer_bps(),
            market_order_timeout_secs: default_market_order_timeout_secs(),
            dedup_window_secs: default_dedup_window_secs(),
        }
    }
}

impl TradingConfig {
    /// Absolute LIMIT order age limit.
    #[must_use]
    pub const fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_timeout_minutes * 60)
    }

    /// Unfilled MARKET order reporting threshold.
    #[must_use]
    pub const fn market_order_timeout(&self) -> Duration {
        Duration::from_secs(self.market_order_timeout_secs)
    }

    /// Alert de-duplication window.
    #[must_use]
    pub const fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }
}

const fn default_quantity() -> u64 {
    100
}
const fn default_max_position_size() -> u64 {
    1000
}
const fn default_true() -> bool {
    true
}
const fn default_order_timeout_minutes() -> u64 {
    30
}
const fn default_max_resubmissions() -> u32 {
    5
}
const fn default_resubmit_interval_min_secs() -> u64 {
    180
}
const fn default_resubmit_interval_max_secs() -> u64 {
    300
}
const fn default_limit_price_buffer_bps() -> Decimal {
    Decimal::TEN
}
const fn default_market_order_timeout_secs() -> u64 {
    30
}
const fn default_dedup_window_secs() -> u64 {
    60
}

// ============================================================================
// Market hours
// ============================================================================

/// Market session boundaries, local to `timezone`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketHoursConfig {
    /// IANA timezone of the exchange.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Start of pre-market (HH:MM).
    #[serde(default = "default_pre_market_start")]
    pub pre_market_start: String,
    /// Regular session open (HH:MM).
    #[serde(default = "default_market_open")]
    pub market_open: String,
    /// Regular session close (HH:MM).
    #[serde(default = "default_market_close")]
    pub market_close: String,
    /// End of post-market (HH:MM).
    #[serde(default = "default_post_market_end")]
    pub post_market_end: String,
}

impl Default for MarketHoursConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            pre_market_start: default_pre_market_start(),
            market_open: default_market_open(),
            market_close: default_market_close(),
            post_market_end: default_post_market_end(),
        }
    }
}

/// Parsed session boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimes {
    /// Exchange timezone.
    pub timezone: Tz,
    /// Start of pre-market.
    pub pre_market_start: NaiveTime,
    /// Regular session open.
    pub market_open: NaiveTime,
    /// Regular session close.
    pub market_close: NaiveTime,
    /// End of post-market.
    pub post_market_end: NaiveTime,
}

impl MarketHoursConfig {
    /// Parse the timezone and boundaries.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` for an unknown timezone, a malformed time,
    /// or boundaries that are not strictly increasing.
    pub fn parse(&self) -> Result<SessionTimes, ConfigError> {
        let timezone: Tz = self.timezone.parse().map_err(|_| {
            ConfigError::ValidationError(format!(
                "market_hours.timezone '{}' is not a known timezone",
                self.timezone
            ))
        })?;

        let times = SessionTimes {
            timezone,
            pre_market_start: parse_time("pre_market_start", &self.pre_market_start)?,
            market_open: parse_time("market_open", &self.market_open)?,
            market_close: parse_time("market_close", &self.market_close)?,
            post_market_end: parse_time("post_market_end", &self.post_market_end)?,
        };

        if !(times.pre_market_start < times.market_open
            && times.market_open < times.market_close
            && times.market_close < times.post_market_end)
        {
            return Err(ConfigError::ValidationError(
                "market_hours boundaries must be strictly increasing".to_string(),
            ));
        }

        Ok(times)
    }
}

fn parse_time(field: &str, value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|_| {
        ConfigError::ValidationError(format!("market_hours.{field} '{value}' is not HH:MM"))
    })
}

fn default_timezone() -> String {
    "US/Eastern".to_string()
}
fn default_pre_market_start() -> String {
    "04:00".to_string()
}
fn default_market_open() -> String {
    "09:30".to_string()
}
fn default_market_close() -> String {
    "16:00".to_string()
}
fn default_post_market_end() -> String {
    "20:00".to_string()
}

// ============================================================================
// Persistence and logging
// ============================================================================

/// Durable state settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Persist positions and open orders.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// SQLite database path.
    #[serde(default = "default_persistence_path")]
    pub path: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_persistence_path(),
        }
    }
}

fn default_persistence_path() -> String {
    "data/trade-engine.db".to_string()
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level for the engine's own targets.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Pretty,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============================================================================
// Loading
// ============================================================================

/// Load configuration from a YAML file.
///
/// Performs `${VAR}` / `${VAR:-default}` interpolation and validation.
///
/// # Arguments
///
/// * `path` - Path to the config file; defaults to `config.yaml`.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or fails validation.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or("config.yaml");

    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_string(),
        source: e,
    })?;

    load_config_from_string(&contents)
}

/// Load configuration from a YAML string.
///
/// # Errors
///
/// Returns an error if the YAML cannot be parsed or fails validation.
pub fn load_config_from_string(yaml: &str) -> Result<Config, ConfigError> {
    let interpolated = interpolate_env_vars(yaml);
    let config: Config = serde_yaml_bw::from_str(&interpolated)?;
    validate_config(&config)?;
    Ok(config)
}

#[allow(clippy::expect_used)] // Regex is compile-time constant; expect() is safe here
fn interpolate_env_vars(input: &str) -> String {
    use std::sync::OnceLock;

    static ENV_VAR_REGEX: OnceLock<regex::Regex> = OnceLock::new();

    let re = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("env var regex is valid")
    });

    re.replace_all(input, |cap: &regex::Captures<'_>| {
        let default_value = cap.get(2).map_or("", |m| m.as_str());
        match std::env::var(&cap[1]) {
            Ok(v) if !v.is_empty() => v,
            _ => default_value.to_string(),
        }
    })
    .into_owned()
}

/// Validate a loaded configuration.
///
/// # Errors
///
/// Returns `ValidationError` describing the first invalid setting.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.engine.account_id.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "engine.account_id must be set".to_string(),
        ));
    }
    if config.engine.tick_interval_secs == 0 {
        return Err(ConfigError::ValidationError(
            "engine.tick_interval_secs must be positive".to_string(),
        ));
    }
    if config.engine.event_queue_capacity == 0 {
        return Err(ConfigError::ValidationError(
            "engine.event_queue_capacity must be positive".to_string(),
        ));
    }

    if config.broker.ack_timeout_secs == 0 {
        return Err(ConfigError::ValidationError(
            "broker.ack_timeout_secs must be positive".to_string(),
        ));
    }

    let trading = &config.trading;
    if trading.default_quantity == 0 || trading.max_position_size == 0 {
        return Err(ConfigError::ValidationError(
            "trading.default_quantity and trading.max_position_size must be positive".to_string(),
        ));
    }
    if trading.default_quantity > trading.max_position_size {
        return Err(ConfigError::ValidationError(
            "trading.default_quantity must not exceed trading.max_position_size".to_string(),
        ));
    }
    if trading.order_timeout_minutes == 0 || trading.market_order_timeout_secs == 0 {
        return Err(ConfigError::ValidationError(
            "trading order timeouts must be positive".to_string(),
        ));
    }
    if trading.resubmit_interval_min_secs == 0
        || trading.resubmit_interval_min_secs > trading.resubmit_interval_max_secs
    {
        return Err(ConfigError::ValidationError(
            "trading.resubmit_interval_min_secs must be positive and not exceed resubmit_interval_max_secs"
                .to_string(),
        ));
    }
    if trading.limit_price_buffer_bps.is_sign_negative() {
        return Err(ConfigError::ValidationError(
            "trading.limit_price_buffer_bps must not be negative".to_string(),
        ));
    }

    config.market_hours.parse()?;

    if config.persistence.enabled && config.persistence.path.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "persistence.path must be set when persistence is enabled".to_string(),
        ));
    }

    Ok(())
}
