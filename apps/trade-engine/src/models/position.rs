//! Per-symbol position state.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::ids::OrderId;

/// Direction of a held position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    /// No position.
    Flat,
    /// Long position.
    Long,
    /// Short position.
    Short,
}

impl PositionState {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Flat => "FLAT",
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position for one symbol.
///
/// `quantity` is zero exactly when `state` is `Flat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Ticker symbol.
    pub symbol: String,
    /// Position direction.
    pub state: PositionState,
    /// Held quantity.
    pub quantity: u64,
    /// Average entry price of the held quantity.
    pub avg_price: Decimal,
    /// Order currently changing this position.
    pub open_order_id: Option<OrderId>,
    /// Reason the symbol is locked pending operator acknowledgement.
    pub lock: Option<String>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// A flat, unlocked position.
    #[must_use]
    pub fn flat(symbol: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            state: PositionState::Flat,
            quantity: 0,
            avg_price: Decimal::ZERO,
            open_order_id: None,
            lock: None,
            updated_at: now,
        }
    }

    /// Whether no position is held.
    #[must_use]
    pub const fn is_flat(&self) -> bool {
        matches!(self.state, PositionState::Flat)
    }

    /// Whether an order is currently changing this position.
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        self.open_order_id.is_some()
    }

    /// Whether the symbol is locked.
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Held quantity signed by direction: positive long, negative short.
    #[must_use]
    pub fn signed_quantity(&self) -> i64 {
        let quantity = i64::try_from(self.quantity).unwrap_or(i64::MAX);
        match self.state {
            PositionState::Flat => 0,
            PositionState::Long => quantity,
            PositionState::Short => -quantity,
        }
    }

    pub(crate) fn set_holding(&mut self, state: PositionState, quantity: u64, avg_price: Decimal) {
        if quantity == 0 || state == PositionState::Flat {
            self.state = PositionState::Flat;
            self.quantity = 0;
            self.avg_price = Decimal::ZERO;
        } else {
            self.state = state;
            self.quantity = quantity;
            self.avg_price = avg_price;
        }
    }
}
