//! Position ledger.
//!
//! Sole owner of per-symbol position state. Enforces sequential trading:
//! a symbol is opened from FLAT by `buy`/`short`, closed by the matching
//! `sell`/`cover`, and only one order at a time may change it.
//!
//! The lifecycle for one order is `validate` → `apply` (reserve the symbol)
//! → `finalize` (apply fills, release the reservation).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::models::{OrderId, Position, PositionState, TradeAction};

/// Why the ledger refused a trade action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerRejection {
    /// `sell`/`cover` without the matching open position.
    #[error("{action} {symbol} requires a prior position")]
    NoPriorPosition {
        /// Symbol.
        symbol: String,
        /// Rejected action.
        action: TradeAction,
    },

    /// `buy`/`short` while a position is held.
    #[error("{symbol} already has an open {state} position")]
    PositionAlreadyOpen {
        /// Symbol.
        symbol: String,
        /// Held position state.
        state: PositionState,
    },

    /// Another order is changing the position.
    #[error("{symbol} has order {order_id} in progress")]
    SymbolBusy {
        /// Symbol.
        symbol: String,
        /// Order holding the reservation.
        order_id: OrderId,
    },

    /// Close quantity larger than held.
    #[error("{symbol}: quantity {requested} exceeds held {held}")]
    QuantityExceedsHeld {
        /// Symbol.
        symbol: String,
        /// Requested quantity.
        requested: u64,
        /// Held quantity.
        held: u64,
    },

    /// Symbol locked pending operator acknowledgement.
    #[error("{symbol} is locked: {reason}")]
    SymbolLocked {
        /// Symbol.
        symbol: String,
        /// Lock reason.
        reason: String,
    },

    /// Zero quantity.
    #[error("{symbol}: quantity must be positive")]
    InvalidQuantity {
        /// Symbol.
        symbol: String,
    },
}

impl LedgerRejection {
    /// Symbol the rejection refers to.
    #[must_use]
    pub fn symbol(&self) -> &str {
        match self {
            Self::NoPriorPosition { symbol, .. }
            | Self::PositionAlreadyOpen { symbol, .. }
            | Self::SymbolBusy { symbol, .. }
            | Self::QuantityExceedsHeld { symbol, .. }
            | Self::SymbolLocked { symbol, .. }
            | Self::InvalidQuantity { symbol } => symbol,
        }
    }
}

/// Operator-supplied position used when clearing a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionOverride {
    /// True position direction.
    pub state: PositionState,
    /// True held quantity.
    pub quantity: u64,
    /// Average entry price.
    pub avg_price: Decimal,
}

/// Per-symbol position table.
#[derive(Debug, Default)]
pub struct PositionLedger {
    positions: HashMap<String, Position>,
}

impl PositionLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from persisted positions.
    #[must_use]
    pub fn from_positions(positions: impl IntoIterator<Item = Position>) -> Self {
        Self {
            positions: positions
                .into_iter()
                .map(|p| (p.symbol.clone(), p))
                .collect(),
        }
    }

    /// Position for `symbol`, if one was ever recorded.
    #[must_use]
    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// All recorded positions.
    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// Quantity currently held for `symbol`.
    #[must_use]
    pub fn held_quantity(&self, symbol: &str) -> u64 {
        self.positions.get(symbol).map_or(0, |p| p.quantity)
    }

    /// Check whether `action` on `symbol` for `quantity` is allowed.
    ///
    /// # Errors
    ///
    /// Returns the first applicable [`LedgerRejection`].
    pub fn validate(
        &self,
        symbol: &str,
        action: TradeAction,
        quantity: u64,
    ) -> Result<(), LedgerRejection> {
        let Some(position) = self.positions.get(symbol) else {
            return Self::validate_flat(symbol, action, quantity);
        };

        if let Some(reason) = &position.lock {
            return Err(LedgerRejection::SymbolLocked {
                symbol: symbol.to_string(),
                reason: reason.clone(),
            });
        }
        if let Some(order_id) = &position.open_order_id {
            return Err(LedgerRejection::SymbolBusy {
                symbol: symbol.to_string(),
                order_id: order_id.clone(),
            });
        }

        match (position.state, action) {
            (PositionState::Flat, _) => Self::validate_flat(symbol, action, quantity),
            (PositionState::Long, TradeAction::Sell) | (PositionState::Short, TradeAction::Cover) => {
                if quantity == 0 {
                    Err(LedgerRejection::InvalidQuantity {
                        symbol: symbol.to_string(),
                    })
                } else if quantity > position.quantity {
                    Err(LedgerRejection::QuantityExceedsHeld {
                        symbol: symbol.to_string(),
                        requested: quantity,
                        held: position.quantity,
                    })
                } else {
                    Ok(())
                }
            }
            (state, TradeAction::Buy | TradeAction::Short) => {
                Err(LedgerRejection::PositionAlreadyOpen {
                    symbol: symbol.to_string(),
                    state,
                })
            }
            (_, action) => Err(LedgerRejection::NoPriorPosition {
                symbol: symbol.to_string(),
                action,
            }),
        }
    }

    fn validate_flat(symbol: &str, action: TradeAction, quantity: u64) -> Result<(), LedgerRejection> {
        if !action.opens_position() {
            return Err(LedgerRejection::NoPriorPosition {
                symbol: symbol.to_string(),
                action,
            });
        }
        if quantity == 0 {
            return Err(LedgerRejection::InvalidQuantity {
                symbol: symbol.to_string(),
            });
        }
        Ok(())
    }

    /// Validate and reserve `symbol` for `order_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`LedgerRejection`] if the action is not allowed.
    pub fn apply(
        &mut self,
        symbol: &str,
        action: TradeAction,
        quantity: u64,
        order_id: &OrderId,
        now: DateTime<Utc>,
    ) -> Result<&Position, LedgerRejection> {
        self.validate(symbol, action, quantity)?;
        let position = self
            .positions
            .entry(symbol.to_string())
            .or_insert_with(|| Position::flat(symbol, now));
        position.open_order_id = Some(order_id.clone());
        position.updated_at = now;
        Ok(position)
    }

    /// Apply the terminal outcome of `order_id` and release the reservation.
    ///
    /// `filled_quantity` is applied whatever the terminal status, so a
    /// partially filled order that was cancelled still moves the position.
    /// With nothing filled the prior state is kept. Returns `None` when
    /// `order_id` does not hold the reservation, making repeated calls
    /// harmless.
    pub fn finalize(
        &mut self,
        symbol: &str,
        order_id: &OrderId,
        action: TradeAction,
        filled_quantity: u64,
        avg_fill_price: Decimal,
        now: DateTime<Utc>,
    ) -> Option<&Position> {
        let position = self.positions.get_mut(symbol)?;
        if position.open_order_id.as_ref() != Some(order_id) {
            warn!(
                symbol = %symbol,
                order_id = %order_id,
                "Finalize ignored: order does not hold the reservation"
            );
            return None;
        }

        position.open_order_id = None;
        position.updated_at = now;

        if filled_quantity > 0 {
            match action {
                TradeAction::Buy => {
                    position.set_holding(PositionState::Long, filled_quantity, avg_fill_price);
                }
                TradeAction::Short => {
                    position.set_holding(PositionState::Short, filled_quantity, avg_fill_price);
                }
                TradeAction::Sell | TradeAction::Cover => {
                    let remaining = position.quantity.saturating_sub(filled_quantity);
                    position.set_holding(position.state, remaining, position.avg_price);
                }
            }
        }

        info!(
            symbol = %symbol,
            order_id = %order_id,
            state = %position.state,
            quantity = position.quantity,
            "Position finalized"
        );
        Some(position)
    }

    /// Lock `symbol` until an operator clears it.
    ///
    /// Any reservation is dropped: the order that held it is no longer
    /// tracked.
    pub fn lock(&mut self, symbol: &str, reason: impl Into<String>, now: DateTime<Utc>) -> &Position {
        let position = self
            .positions
            .entry(symbol.to_string())
            .or_insert_with(|| Position::flat(symbol, now));
        let reason = reason.into();
        warn!(symbol = %symbol, reason = %reason, "Symbol locked");
        position.lock = Some(reason);
        position.open_order_id = None;
        position.updated_at = now;
        position
    }

    /// Clear the lock on `symbol`, optionally replacing the position with
    /// the operator-supplied one.
    ///
    /// Returns `None` if the symbol is unknown.
    pub fn clear_lock(
        &mut self,
        symbol: &str,
        position_override: Option<PositionOverride>,
        now: DateTime<Utc>,
    ) -> Option<&Position> {
        let position = self.positions.get_mut(symbol)?;
        position.lock = None;
        if let Some(o) = position_override {
            position.set_holding(o.state, o.quantity, o.avg_price);
        }
        position.updated_at = now;
        info!(
            symbol = %symbol,
            state = %position.state,
            quantity = position.quantity,
            "Symbol lock cleared"
        );
        Some(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use test_case::test_case;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 4, 15, 0, 0).unwrap()
    }

    fn ledger_with(symbol: &str, state: PositionState, quantity: u64) -> PositionLedger {
        let mut position = Position::flat(symbol, now());
        position.set_holding(state, quantity, dec!(100));
        PositionLedger::from_positions([position])
    }

    fn open(ledger: &mut PositionLedger, symbol: &str, action: TradeAction, qty: u64) -> OrderId {
        let id = OrderId::generate();
        if let Err(e) = ledger.apply(symbol, action, qty, &id, now()) {
            panic!("apply should succeed: {e}");
        }
        id
    }

    #[test_case(PositionState::Flat, TradeAction::Buy, 10, None ; "flat buy")]
    #[test_case(PositionState::Flat, TradeAction::Short, 10, None ; "flat short")]
    #[test_case(PositionState::Flat, TradeAction::Sell, 10, Some("no_prior") ; "flat sell")]
    #[test_case(PositionState::Flat, TradeAction::Cover, 10, Some("no_prior") ; "flat cover")]
    #[test_case(PositionState::Long, TradeAction::Sell, 100, None ; "long sell all")]
    #[test_case(PositionState::Long, TradeAction::Sell, 40, None ; "long sell part")]
    #[test_case(PositionState::Long, TradeAction::Sell, 101, Some("exceeds") ; "long oversell")]
    #[test_case(PositionState::Long, TradeAction::Buy, 10, Some("already_open") ; "long buy")]
    #[test_case(PositionState::Long, TradeAction::Short, 10, Some("already_open") ; "long short")]
    #[test_case(PositionState::Long, TradeAction::Cover, 10, Some("no_prior") ; "long cover")]
    #[test_case(PositionState::Short, TradeAction::Cover, 100, None ; "short cover")]
    #[test_case(PositionState::Short, TradeAction::Sell, 10, Some("no_prior") ; "short sell")]
    #[test_case(PositionState::Short, TradeAction::Buy, 10, Some("already_open") ; "short buy")]
    fn test_validate_transitions(
        state: PositionState,
        action: TradeAction,
        quantity: u64,
        expected: Option<&str>,
    ) {
        let quantity_held = if state == PositionState::Flat { 0 } else { 100 };
        let ledger = ledger_with("AAPL", state, quantity_held);
        let result = ledger.validate("AAPL", action, quantity);
        let kind = match result {
            Ok(()) => None,
            Err(LedgerRejection::NoPriorPosition { .. }) => Some("no_prior"),
            Err(LedgerRejection::PositionAlreadyOpen { .. }) => Some("already_open"),
            Err(LedgerRejection::QuantityExceedsHeld { .. }) => Some("exceeds"),
            Err(other) => panic!("unexpected rejection: {other}"),
        };
        assert_eq!(kind, expected);
    }

    #[test]
    fn test_unknown_symbol_is_flat() {
        let ledger = PositionLedger::new();
        assert!(ledger.validate("MSFT", TradeAction::Buy, 1).is_ok());
        assert_eq!(
            ledger.validate("MSFT", TradeAction::Sell, 1),
            Err(LedgerRejection::NoPriorPosition {
                symbol: "MSFT".to_string(),
                action: TradeAction::Sell,
            })
        );
        assert!(matches!(
            ledger.validate("MSFT", TradeAction::Buy, 0),
            Err(LedgerRejection::InvalidQuantity { .. })
        ));
    }

    #[test]
    fn test_apply_reserves_symbol() {
        let mut ledger = PositionLedger::new();
        let id = open(&mut ledger, "AAPL", TradeAction::Buy, 100);

        let result = ledger.validate("AAPL", TradeAction::Buy, 100);
        assert_eq!(
            result,
            Err(LedgerRejection::SymbolBusy {
                symbol: "AAPL".to_string(),
                order_id: id,
            })
        );
    }

    #[test]
    fn test_finalize_fill_opens_and_closes() {
        let mut ledger = PositionLedger::new();
        let buy = open(&mut ledger, "AAPL", TradeAction::Buy, 100);
        let position = ledger
            .finalize("AAPL", &buy, TradeAction::Buy, 100, dec!(180.5), now())
            .cloned();
        let Some(position) = position else {
            panic!("finalize should apply");
        };
        assert_eq!(position.state, PositionState::Long);
        assert_eq!(position.quantity, 100);
        assert_eq!(position.avg_price, dec!(180.5));
        assert!(!position.is_busy());

        let sell = open(&mut ledger, "AAPL", TradeAction::Sell, 100);
        ledger.finalize("AAPL", &sell, TradeAction::Sell, 100, dec!(181), now());
        let position = ledger.get("AAPL").unwrap();
        assert!(position.is_flat());
        assert_eq!(position.quantity, 0);
    }

    #[test]
    fn test_finalize_without_fill_reverts_reservation() {
        let mut ledger = ledger_with("AAPL", PositionState::Long, 100);
        let sell = open(&mut ledger, "AAPL", TradeAction::Sell, 100);
        ledger.finalize("AAPL", &sell, TradeAction::Sell, 0, Decimal::ZERO, now());

        let position = ledger.get("AAPL").unwrap();
        assert_eq!(position.state, PositionState::Long);
        assert_eq!(position.quantity, 100);
        assert!(!position.is_busy());
    }

    #[test]
    fn test_finalize_partial_fill_applies_filled_quantity() {
        let mut ledger = PositionLedger::new();
        let short = open(&mut ledger, "TSLA", TradeAction::Short, 50);
        ledger.finalize("TSLA", &short, TradeAction::Short, 20, dec!(250), now());
        let position = ledger.get("TSLA").unwrap();
        assert_eq!(position.state, PositionState::Short);
        assert_eq!(position.quantity, 20);

        let cover = open(&mut ledger, "TSLA", TradeAction::Cover, 20);
        ledger.finalize("TSLA", &cover, TradeAction::Cover, 5, dec!(240), now());
        let position = ledger.get("TSLA").unwrap();
        assert_eq!(position.state, PositionState::Short);
        assert_eq!(position.quantity, 15);
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut ledger = PositionLedger::new();
        let buy = open(&mut ledger, "AAPL", TradeAction::Buy, 100);
        assert!(
            ledger
                .finalize("AAPL", &buy, TradeAction::Buy, 100, dec!(1), now())
                .is_some()
        );
        assert!(
            ledger
                .finalize("AAPL", &buy, TradeAction::Buy, 100, dec!(1), now())
                .is_none()
        );
        assert_eq!(ledger.held_quantity("AAPL"), 100);
    }

    #[test]
    fn test_lock_blocks_until_cleared() {
        let mut ledger = PositionLedger::new();
        let buy = open(&mut ledger, "AAPL", TradeAction::Buy, 100);
        ledger.lock("AAPL", "order outcome unknown", now());

        assert!(!ledger.get("AAPL").unwrap().is_busy());
        assert!(matches!(
            ledger.validate("AAPL", TradeAction::Buy, 1),
            Err(LedgerRejection::SymbolLocked { .. })
        ));
        // The dropped reservation cannot be finalized anymore
        assert!(
            ledger
                .finalize("AAPL", &buy, TradeAction::Buy, 100, dec!(1), now())
                .is_none()
        );

        let cleared = ledger.clear_lock(
            "AAPL",
            Some(PositionOverride {
                state: PositionState::Long,
                quantity: 100,
                avg_price: dec!(180),
            }),
            now(),
        );
        assert_eq!(cleared.map(|p| p.quantity), Some(100));
        assert!(ledger.validate("AAPL", TradeAction::Sell, 100).is_ok());
    }

    #[test]
    fn test_clear_lock_unknown_symbol() {
        let mut ledger = PositionLedger::new();
        assert!(ledger.clear_lock("NOPE", None, now()).is_none());
    }

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Alert(TradeAction, u64),
        Fill(u64),
        Cancel,
    }

    fn step_strategy() -> impl Strategy<Value = Step> {
        prop_oneof![
            (
                prop_oneof![
                    Just(TradeAction::Buy),
                    Just(TradeAction::Sell),
                    Just(TradeAction::Short),
                    Just(TradeAction::Cover),
                ],
                1_u64..200
            )
                .prop_map(|(a, q)| Step::Alert(a, q)),
            (0_u64..200).prop_map(Step::Fill),
            Just(Step::Cancel),
        ]
    }

    proptest! {
        #[test]
        fn prop_sequential_trading_invariants(steps in prop::collection::vec(step_strategy(), 1..60)) {
            let mut ledger = PositionLedger::new();
            let mut open_order: Option<(OrderId, TradeAction, u64)> = None;

            for step in steps {
                match step {
                    Step::Alert(action, qty) => {
                        let before = ledger.get("X").cloned();
                        let id = OrderId::generate();
                        match ledger.apply("X", action, qty, &id, now()) {
                            Ok(_) => {
                                // Only one order may hold the symbol
                                prop_assert!(open_order.is_none());
                                if !action.opens_position() {
                                    let b = before.unwrap();
                                    let expected = if action == TradeAction::Sell {
                                        PositionState::Long
                                    } else {
                                        PositionState::Short
                                    };
                                    prop_assert_eq!(b.state, expected);
                                    prop_assert!(qty <= b.quantity);
                                }
                                open_order = Some((id, action, qty));
                            }
                            Err(_) => prop_assert_eq!(ledger.get("X").cloned(), before),
                        }
                    }
                    Step::Fill(_) | Step::Cancel if open_order.is_none() => {}
                    Step::Fill(filled) => {
                        let (id, action, qty) = open_order.take().unwrap();
                        ledger.finalize("X", &id, action, filled.min(qty), dec!(1), now());
                    }
                    Step::Cancel => {
                        let (id, action, _) = open_order.take().unwrap();
                        ledger.finalize("X", &id, action, 0, Decimal::ZERO, now());
                    }
                }

                if let Some(p) = ledger.get("X") {
                    prop_assert_eq!(p.quantity == 0, p.state == PositionState::Flat);
                    prop_assert_eq!(p.is_busy(), open_order.is_some());
                }
            }
        }
    }
}
