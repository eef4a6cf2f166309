//! Core domain models for the trade engine.
//!
//! Alerts, orders with their submission legs, and per-symbol positions.

mod alert;
mod ids;
mod order;
mod position;

pub use alert::{Alert, AlertError, RawAlert, TradeAction};
pub use ids::{BrokerOrderId, ClientOrderId, OrderId};
pub use order::{
    LegState, NewOrder, Order, OrderLeg, OrderSide, OrderStatus, OrderType, PendingAction,
};
pub use position::{Position, PositionState};
