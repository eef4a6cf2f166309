//! Inbound trade alerts.
//!
//! Alerts arrive as loosely-typed JSON ([`RawAlert`]) from the external
//! receiver and are normalised into an [`Alert`] before they reach the
//! engine sequencer.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::order::OrderSide;

/// Trade instruction carried by an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    /// Open a long position.
    Buy,
    /// Close a long position.
    Sell,
    /// Open a short position.
    Short,
    /// Close a short position.
    Cover,
}

impl TradeAction {
    /// Broker side for this action: buy/cover buy, sell/short sell.
    #[must_use]
    pub const fn side(self) -> OrderSide {
        match self {
            Self::Buy | Self::Cover => OrderSide::Buy,
            Self::Sell | Self::Short => OrderSide::Sell,
        }
    }

    /// Whether this action opens a position from FLAT.
    #[must_use]
    pub const fn opens_position(self) -> bool {
        matches!(self, Self::Buy | Self::Short)
    }

    /// Lowercase wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::Short => "short",
            Self::Cover => "cover",
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeAction {
    type Err = AlertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            "short" => Ok(Self::Short),
            "cover" => Ok(Self::Cover),
            other => Err(AlertError::InvalidAction(other.to_string())),
        }
    }
}

/// Errors raised while normalising an inbound alert.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlertError {
    /// Action is not one of buy/sell/short/cover.
    #[error("invalid action '{0}': must be one of buy, sell, short, cover")]
    InvalidAction(String),

    /// Symbol missing or blank.
    #[error("missing symbol")]
    MissingSymbol,

    /// Quantity present but not a positive integer.
    #[error("invalid quantity {0}: must be positive")]
    InvalidQuantity(i64),

    /// Price present but not positive.
    #[error("invalid price {0}: must be positive")]
    InvalidPrice(Decimal),
}

/// Alert payload as received from the webhook receiver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAlert {
    /// Trade action, case-insensitive.
    #[serde(default)]
    pub action: String,
    /// Ticker symbol, case-insensitive.
    #[serde(default, alias = "ticker")]
    pub symbol: String,
    /// Requested quantity.
    #[serde(default)]
    pub quantity: Option<i64>,
    /// Optional limit price.
    #[serde(default)]
    pub price: Option<Decimal>,
    /// Sender-assigned unique id used for de-duplication.
    #[serde(default)]
    pub alert_id: Option<String>,
    /// RFC 3339 timestamp.
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Free-form message.
    #[serde(default)]
    pub message: Option<String>,
}

/// A validated, normalised alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    /// Trade action.
    pub action: TradeAction,
    /// Upper-cased ticker symbol.
    pub symbol: String,
    /// Requested quantity; `None` means the configured default (open) or
    /// the full held quantity (close).
    pub quantity: Option<u64>,
    /// Optional limit price.
    pub limit_price: Option<Decimal>,
    /// Sender-assigned id.
    pub alert_id: Option<String>,
    /// Alert time.
    pub timestamp: DateTime<Utc>,
    /// Free-form message.
    pub message: Option<String>,
}

impl Alert {
    /// Build an alert directly (tests, programmatic callers).
    #[must_use]
    pub fn new(action: TradeAction, symbol: impl Into<String>, quantity: Option<u64>) -> Self {
        Self {
            action,
            symbol: symbol.into().trim().to_ascii_uppercase(),
            quantity,
            limit_price: None,
            alert_id: None,
            timestamp: Utc::now(),
            message: None,
        }
    }

    /// Set the limit price.
    #[must_use]
    pub const fn with_limit_price(mut self, price: Decimal) -> Self {
        self.limit_price = Some(price);
        self
    }

    /// Set the sender id.
    #[must_use]
    pub fn with_alert_id(mut self, id: impl Into<String>) -> Self {
        self.alert_id = Some(id.into());
        self
    }

    /// Set the alert timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Normalise a raw alert.
    ///
    /// A missing or unparseable timestamp falls back to `received_at`.
    ///
    /// # Errors
    ///
    /// Returns an [`AlertError`] for an unknown action, a blank symbol or a
    /// non-positive quantity or price.
    pub fn parse(raw: RawAlert, received_at: DateTime<Utc>) -> Result<Self, AlertError> {
        let action: TradeAction = raw.action.parse()?;

        let symbol = raw.symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() {
            return Err(AlertError::MissingSymbol);
        }

        let quantity = match raw.quantity {
            None => None,
            Some(q) if q > 0 => Some(q.unsigned_abs()),
            Some(q) => return Err(AlertError::InvalidQuantity(q)),
        };

        if let Some(price) = raw.price.filter(|p| *p <= Decimal::ZERO) {
            return Err(AlertError::InvalidPrice(price));
        }

        let timestamp = raw
            .timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map_or(received_at, |ts| ts.with_timezone(&Utc));

        Ok(Self {
            action,
            symbol,
            quantity,
            limit_price: raw.price,
            alert_id: raw.alert_id.filter(|id| !id.trim().is_empty()),
            timestamp,
            message: raw.message,
        })
    }

    /// Key used to recognise replays of this alert.
    #[must_use]
    pub fn dedup_key(&self) -> String {
        match &self.alert_id {
            Some(id) => format!("id:{id}"),
            None => format!(
                "{}:{}:{}",
                self.action,
                self.symbol,
                self.timestamp.timestamp_millis()
            ),
        }
    }
}
