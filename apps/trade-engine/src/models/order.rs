//! Order types for lifecycle tracking.
//!
//! An [`Order`] is owned by the order supervisor from creation until it
//! reaches a terminal status. Every broker submission of the order is an
//! [`OrderLeg`]; resubmission appends a new leg for the remaining quantity
//! while the engine order id stays the same.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::alert::TradeAction;
use super::ids::{BrokerOrderId, ClientOrderId, OrderId};

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    /// Buy order.
    Buy,
    /// Sell order.
    Sell,
}

impl OrderSide {
    /// Broker wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    /// Market order - execute at best available price.
    Market,
    /// Limit order - execute at specified price or better.
    Limit,
}

impl OrderType {
    /// Wire name, also used as a metrics label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order status in the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Created locally, not yet acknowledged by the broker.
    PendingSubmit,
    /// Acknowledged and resting at the broker.
    Working,
    /// Some quantity filled, remainder still working.
    PartiallyFilled,
    /// Requested quantity completely filled.
    Filled,
    /// Cancelled at the broker.
    Cancelled,
    /// Rejected by the broker or not acknowledged in time.
    Rejected,
    /// Given up after the resubmission cap or the order age limit.
    Expired,
    /// Broker outcome could not be determined after reconnection.
    UnknownTerminal,
}

impl OrderStatus {
    /// Returns true if the order is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired | Self::UnknownTerminal
        )
    }

    /// Returns true if the order is resting at the broker.
    #[must_use]
    pub const fn is_working(&self) -> bool {
        matches!(self, Self::Working | Self::PartiallyFilled)
    }

    /// Wire name, also used as a metrics label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PendingSubmit => "PENDING_SUBMIT",
            Self::Working => "WORKING",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
            Self::UnknownTerminal => "UNKNOWN_TERMINAL",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of one submission leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LegState {
    /// Not handed to the broker yet (created or queued while disconnected).
    Unsent,
    /// Handed to the broker, acknowledgement outstanding.
    InFlight,
    /// Acknowledged and resting.
    Working,
    /// Cancel requested, confirmation outstanding.
    CancelRequested,
    /// Broker reported a terminal status for this leg.
    Done,
}

/// What the supervisor is waiting on after requesting a cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PendingAction {
    /// Cancel for resubmission at a fresh price.
    Replace,
    /// Cancel because the order exhausted its resubmissions or its age.
    Expire,
}

/// One broker submission of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLeg {
    /// Engine-assigned leg id sent to the broker.
    pub client_order_id: ClientOrderId,
    /// Broker id once acknowledged.
    pub broker_order_id: Option<BrokerOrderId>,
    /// Quantity submitted on this leg.
    pub quantity: u64,
    /// Limit price of this leg (LIMIT orders, set once priced).
    pub limit_price: Option<Decimal>,
    /// Cumulative quantity filled on this leg.
    pub filled_quantity: u64,
    /// Average fill price on this leg.
    pub avg_fill_price: Decimal,
    /// Leg progress.
    pub state: LegState,
    /// When the leg was handed to the broker.
    pub submitted_at: Option<DateTime<Utc>>,
    /// When the latest unconfirmed cancel was requested.
    #[serde(default)]
    pub cancel_requested_at: Option<DateTime<Utc>>,
    /// Cancel requests sent since the leg last rested.
    #[serde(default)]
    pub cancel_attempts: u32,
}

impl OrderLeg {
    fn new(client_order_id: ClientOrderId, quantity: u64, limit_price: Option<Decimal>) -> Self {
        Self {
            client_order_id,
            broker_order_id: None,
            quantity,
            limit_price,
            filled_quantity: 0,
            avg_fill_price: Decimal::ZERO,
            state: LegState::Unsent,
            submitted_at: None,
            cancel_requested_at: None,
            cancel_attempts: 0,
        }
    }

    /// Record a cancel request sent at `now`.
    pub fn request_cancel(&mut self, now: DateTime<Utc>) {
        self.state = LegState::CancelRequested;
        self.cancel_requested_at = Some(now);
        self.cancel_attempts += 1;
    }

    /// Return a leg whose cancel did not take effect to resting.
    pub fn resume_working(&mut self) {
        self.state = LegState::Working;
        self.cancel_requested_at = None;
        self.cancel_attempts = 0;
    }

    /// Whether the broker may have seen this leg.
    #[must_use]
    pub const fn was_sent(&self) -> bool {
        !matches!(self.state, LegState::Unsent)
    }
}

/// Parameters for creating an order.
#[derive(Debug, Clone)]
pub struct NewOrder {
    /// Ticker symbol.
    pub symbol: String,
    /// Trade action.
    pub action: TradeAction,
    /// Requested quantity.
    pub quantity: u64,
    /// Order type chosen from the session.
    pub order_type: OrderType,
    /// Price supplied by the alert, if any.
    pub alert_price: Option<Decimal>,
    /// Whether the order is eligible for timed resubmission.
    pub resubmission_enabled: bool,
    /// Seconds between resubmissions for this order.
    pub resubmit_interval_secs: u64,
}

/// Complete order state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Engine order id.
    pub id: OrderId,
    /// Ticker symbol.
    pub symbol: String,
    /// Trade action.
    pub action: TradeAction,
    /// Requested quantity.
    pub requested_quantity: u64,
    /// Order type.
    pub order_type: OrderType,
    /// Current limit price (LIMIT only; refreshed on resubmission).
    pub limit_price: Option<Decimal>,
    /// Price supplied by the alert.
    pub alert_price: Option<Decimal>,
    /// Lifecycle status.
    pub status: OrderStatus,
    /// Broker id of the current leg.
    pub broker_order_id: Option<BrokerOrderId>,
    /// Filled quantity across all legs.
    pub filled_quantity: u64,
    /// Average fill price across all legs.
    pub avg_fill_price: Decimal,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the latest resubmission.
    pub last_resubmit_at: Option<DateTime<Utc>>,
    /// Number of resubmissions so far.
    pub resubmit_count: u32,
    /// Whether timed resubmission applies.
    pub resubmission_enabled: bool,
    /// Seconds between resubmissions, drawn per order.
    pub resubmit_interval_secs: u64,
    /// Outstanding cancel purpose.
    pub pending_action: Option<PendingAction>,
    /// Last status message from the broker or the engine.
    pub status_message: String,
    /// Whether a stuck MARKET order was already reported.
    pub stale_reported: bool,
    /// Time the order reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Submission legs, oldest first.
    pub legs: Vec<OrderLeg>,
}

impl Order {
    /// Create an order in `PENDING_SUBMIT` with its first, unsent leg.
    #[must_use]
    pub fn new(id: OrderId, new_order: NewOrder, now: DateTime<Utc>) -> Self {
        let limit_price = match new_order.order_type {
            OrderType::Limit => new_order.alert_price,
            OrderType::Market => None,
        };
        let first_leg = OrderLeg::new(id.leg(0), new_order.quantity, limit_price);
        Self {
            id,
            symbol: new_order.symbol,
            action: new_order.action,
            requested_quantity: new_order.quantity,
            order_type: new_order.order_type,
            limit_price,
            alert_price: new_order.alert_price,
            status: OrderStatus::PendingSubmit,
            broker_order_id: None,
            filled_quantity: 0,
            avg_fill_price: Decimal::ZERO,
            created_at: now,
            last_resubmit_at: None,
            resubmit_count: 0,
            resubmission_enabled: new_order.resubmission_enabled,
            resubmit_interval_secs: new_order.resubmit_interval_secs,
            pending_action: None,
            status_message: String::new(),
            stale_reported: false,
            completed_at: None,
            legs: vec![first_leg],
        }
    }

    /// Broker side of this order.
    #[must_use]
    pub const fn side(&self) -> OrderSide {
        self.action.side()
    }

    /// Quantity not yet filled.
    #[must_use]
    pub const fn remaining_quantity(&self) -> u64 {
        self.requested_quantity.saturating_sub(self.filled_quantity)
    }

    /// Time of the last supervisor action on the order.
    #[must_use]
    pub fn last_action_at(&self) -> DateTime<Utc> {
        self.last_resubmit_at.unwrap_or(self.created_at)
    }

    /// The most recent leg.
    #[must_use]
    pub fn current_leg(&self) -> Option<&OrderLeg> {
        self.legs.last()
    }

    /// The most recent leg, mutably.
    pub fn current_leg_mut(&mut self) -> Option<&mut OrderLeg> {
        self.legs.last_mut()
    }

    /// Look up a leg by its client order id.
    #[must_use]
    pub fn leg(&self, client_order_id: &ClientOrderId) -> Option<&OrderLeg> {
        self.legs
            .iter()
            .find(|leg| &leg.client_order_id == client_order_id)
    }

    /// Look up a leg by its client order id, mutably.
    pub fn leg_mut(&mut self, client_order_id: &ClientOrderId) -> Option<&mut OrderLeg> {
        self.legs
            .iter_mut()
            .find(|leg| &leg.client_order_id == client_order_id)
    }

    /// Whether `client_order_id` is the order's most recent leg.
    #[must_use]
    pub fn is_current_leg(&self, client_order_id: &ClientOrderId) -> bool {
        self.current_leg()
            .is_some_and(|leg| &leg.client_order_id == client_order_id)
    }

    /// Append a new unsent leg for the remaining quantity.
    pub fn push_leg(&mut self) -> &OrderLeg {
        let leg = OrderLeg::new(
            self.id.leg(self.legs.len()),
            self.remaining_quantity(),
            self.limit_price,
        );
        self.broker_order_id = None;
        self.legs.push(leg);
        &self.legs[self.legs.len() - 1]
    }

    /// Apply a cumulative fill report for one leg.
    ///
    /// Cumulative quantities only move forward, so repeated or reordered
    /// reports are ignored. Returns the quantity newly filled.
    pub fn apply_leg_fill(
        &mut self,
        client_order_id: &ClientOrderId,
        cumulative_quantity: u64,
        avg_price: Decimal,
    ) -> u64 {
        let Some(leg) = self.leg_mut(client_order_id) else {
            return 0;
        };
        let cumulative_quantity = cumulative_quantity.min(leg.quantity);
        if cumulative_quantity <= leg.filled_quantity {
            return 0;
        }
        let newly_filled = cumulative_quantity - leg.filled_quantity;
        leg.filled_quantity = cumulative_quantity;
        leg.avg_fill_price = avg_price;
        self.recompute_fills();
        newly_filled
    }

    /// Recompute order-level fill totals from the legs.
    pub fn recompute_fills(&mut self) {
        let mut filled = 0_u64;
        let mut notional = Decimal::ZERO;
        for leg in &self.legs {
            filled += leg.filled_quantity;
            notional += Decimal::from(leg.filled_quantity) * leg.avg_fill_price;
        }
        self.filled_quantity = filled;
        self.avg_fill_price = if filled == 0 {
            Decimal::ZERO
        } else {
            (notional / Decimal::from(filled)).round_dp(4)
        };
    }

    /// Move to a terminal status.
    pub fn complete(&mut self, status: OrderStatus, message: impl Into<String>, now: DateTime<Utc>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.status_message = message.into();
        self.pending_action = None;
        self.completed_at = Some(now);
        for leg in &mut self.legs {
            leg.state = LegState::Done;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 4, 15, 0, 0).unwrap()
    }

    fn limit_order(quantity: u64) -> Order {
        Order::new(
            OrderId::new("ord"),
            NewOrder {
                symbol: "TSLA".to_string(),
                action: TradeAction::Short,
                quantity,
                order_type: OrderType::Limit,
                alert_price: Some(dec!(250)),
                resubmission_enabled: true,
                resubmit_interval_secs: 240,
            },
            now(),
        )
    }

    #[test]
    fn test_order_status_terminal() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(OrderStatus::UnknownTerminal.is_terminal());
        assert!(!OrderStatus::PendingSubmit.is_terminal());
        assert!(!OrderStatus::Working.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_order_status_serde_screaming_case() {
        let json = serde_json::to_string(&OrderStatus::UnknownTerminal).unwrap();
        assert_eq!(json, "\"UNKNOWN_TERMINAL\"");
    }

    #[test]
    fn test_new_order_has_single_unsent_leg() {
        let order = limit_order(50);
        assert_eq!(order.status, OrderStatus::PendingSubmit);
        assert_eq!(order.legs.len(), 1);
        assert_eq!(order.legs[0].client_order_id.as_str(), "ord.0");
        assert_eq!(order.legs[0].limit_price, Some(dec!(250)));
        assert!(!order.legs[0].was_sent());
        assert_eq!(order.side(), OrderSide::Sell);
    }

    #[test]
    fn test_market_order_ignores_alert_price() {
        let mut new_order = NewOrder {
            symbol: "AAPL".to_string(),
            action: TradeAction::Buy,
            quantity: 100,
            order_type: OrderType::Market,
            alert_price: Some(dec!(180)),
            resubmission_enabled: false,
            resubmit_interval_secs: 0,
        };
        let order = Order::new(OrderId::new("m"), new_order.clone(), now());
        assert_eq!(order.limit_price, None);

        new_order.order_type = OrderType::Limit;
        let order = Order::new(OrderId::new("l"), new_order, now());
        assert_eq!(order.limit_price, Some(dec!(180)));
    }

    #[test]
    fn test_cumulative_fills_are_monotonic() {
        let mut order = limit_order(50);
        let leg = order.id.leg(0);

        assert_eq!(order.apply_leg_fill(&leg, 20, dec!(250)), 20);
        assert_eq!(order.apply_leg_fill(&leg, 20, dec!(250)), 0);
        assert_eq!(order.apply_leg_fill(&leg, 10, dec!(249)), 0);
        assert_eq!(order.filled_quantity, 20);
        assert_eq!(order.remaining_quantity(), 30);
    }

    #[test]
    fn test_fills_aggregate_across_legs() {
        let mut order = limit_order(50);
        let first = order.id.leg(0);
        order.apply_leg_fill(&first, 20, dec!(250));

        let second = order.push_leg().clone();
        assert_eq!(second.client_order_id.as_str(), "ord.1");
        assert_eq!(second.quantity, 30);

        order.apply_leg_fill(&second.client_order_id, 30, dec!(245));
        assert_eq!(order.filled_quantity, 50);
        assert_eq!(order.remaining_quantity(), 0);
        // (20*250 + 30*245) / 50
        assert_eq!(order.avg_fill_price, dec!(247));
    }

    #[test]
    fn test_fill_beyond_leg_quantity_is_clamped() {
        let mut order = limit_order(10);
        let leg = order.id.leg(0);
        assert_eq!(order.apply_leg_fill(&leg, 15, dec!(1)), 10);
        assert_eq!(order.filled_quantity, 10);
    }

    #[test]
    fn test_complete_marks_legs_done() {
        let mut order = limit_order(10);
        order.pending_action = Some(PendingAction::Expire);
        order.complete(OrderStatus::Expired, "order timeout", now());
        assert_eq!(order.status, OrderStatus::Expired);
        assert_eq!(order.pending_action, None);
        assert_eq!(order.completed_at, Some(now()));
        assert!(order.legs.iter().all(|leg| leg.state == LegState::Done));
    }
}
