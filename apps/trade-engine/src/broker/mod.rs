//! Broker capability and gateway.
//!
//! The external broker connection library is consumed through the
//! [`BrokerClient`] trait: submit, cancel, list open orders, historical
//! order lookup, positions, quotes, and a callback stream of [`BrokerEvent`]s pushed
//! through a [`BrokerEventSink`]. The [`gateway`] module wraps a client with
//! connection state, queueing, reconnection and reconciliation.

pub mod gateway;
pub mod paper;
pub mod reconcile;
pub mod reconnect;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::engine::EngineEvent;
use crate::models::{BrokerOrderId, ClientOrderId, OrderSide, OrderType};

pub use gateway::{BrokerConnection, BrokerGateway, ConnectionState, GatewayEvent, SubmitCommand};
pub use paper::PaperBroker;
pub use reconcile::{
    HistoryLookup, LegResolution, PositionMismatch, ReconcileCandidate, ReconcileFetch,
};
pub use reconnect::ReconnectPolicy;

/// Errors from broker operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// No live connection.
    #[error("Not connected to broker")]
    NotConnected,

    /// Connection attempt or transport failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation did not complete in time.
    #[error("{operation} timed out after {secs}s")]
    Timeout {
        /// Operation name.
        operation: &'static str,
        /// Timeout in seconds.
        secs: u64,
    },

    /// API returned an error.
    #[error("API error: {code} - {message}")]
    Api {
        /// Error code from broker.
        code: i32,
        /// Error message from broker.
        message: String,
    },

    /// Order was rejected.
    #[error("Order rejected: {0}")]
    OrderRejected(String),

    /// Order not found.
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// Order cannot be canceled (already in terminal state).
    #[error("Order cannot be canceled: {0}")]
    OrderNotCancelable(String),

    /// No price available to build a limit order.
    #[error("No reference price for {0}")]
    NoReferencePrice(String),

    /// Capability not offered by this broker.
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl BrokerError {
    /// Whether the failure is a lost or missing connection, after which the
    /// operation may be retried once reconnected.
    #[must_use]
    pub const fn is_connectivity(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Connection(_))
    }
}

/// A single order submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Engine-assigned leg id.
    pub client_order_id: ClientOrderId,
    /// Broker account.
    pub account_id: String,
    /// Ticker symbol.
    pub symbol: String,
    /// Side.
    pub side: OrderSide,
    /// Quantity.
    pub quantity: u64,
    /// Order type.
    pub order_type: OrderType,
    /// Limit price (LIMIT only).
    pub limit_price: Option<Decimal>,
    /// Allow execution outside regular trading hours.
    pub outside_rth: bool,
}

/// Top of book for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Quote {
    /// Best bid.
    pub bid: Option<Decimal>,
    /// Best ask.
    pub ask: Option<Decimal>,
    /// Last trade.
    pub last: Option<Decimal>,
}

/// Broker-side order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerOrderStatus {
    /// Accepted, resting.
    Submitted,
    /// Some quantity filled.
    PartiallyFilled,
    /// Completely filled.
    Filled,
    /// Cancelled.
    Cancelled,
    /// Rejected.
    Rejected,
    /// Expired at the broker (e.g. end of day).
    Expired,
}

impl BrokerOrderStatus {
    /// Whether the broker will report nothing further for the order.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired
        )
    }
}

/// Broker view of one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerOrderSnapshot {
    /// Engine leg id the order was submitted with.
    pub client_order_id: ClientOrderId,
    /// Broker id.
    pub broker_order_id: BrokerOrderId,
    /// Ticker symbol.
    pub symbol: String,
    /// Side.
    pub side: OrderSide,
    /// Submitted quantity.
    pub quantity: u64,
    /// Cumulative filled quantity.
    pub filled_quantity: u64,
    /// Average fill price.
    pub avg_fill_price: Decimal,
    /// Status.
    pub status: BrokerOrderStatus,
}

/// Broker view of the net holding in one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerPosition {
    /// Ticker symbol.
    pub symbol: String,
    /// Signed share count: positive long, negative short.
    pub quantity: i64,
    /// Average cost per share.
    pub avg_cost: Decimal,
}

/// Normalised callback from the broker connection.
///
/// Fill quantities are cumulative per broker order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerEvent {
    /// Connection (re-)established by the client itself.
    Connected,
    /// Connection lost.
    Disconnected {
        /// Reason reported by the client.
        reason: String,
    },
    /// Submission acknowledged.
    OrderAck {
        /// Engine leg id.
        client_order_id: ClientOrderId,
        /// Broker id.
        broker_order_id: BrokerOrderId,
    },
    /// Status change.
    OrderStatus {
        /// Engine leg id, if known to the broker.
        client_order_id: Option<ClientOrderId>,
        /// Broker id.
        broker_order_id: BrokerOrderId,
        /// New status.
        status: BrokerOrderStatus,
        /// Cumulative filled quantity.
        filled_quantity: u64,
        /// Average fill price.
        avg_fill_price: Decimal,
        /// Broker message.
        message: Option<String>,
    },
    /// Execution.
    OrderFilled {
        /// Engine leg id, if known to the broker.
        client_order_id: Option<ClientOrderId>,
        /// Broker id.
        broker_order_id: BrokerOrderId,
        /// Quantity of this execution.
        last_quantity: u64,
        /// Price of this execution.
        last_price: Decimal,
        /// Cumulative filled quantity.
        cumulative_quantity: u64,
        /// Average fill price.
        avg_fill_price: Decimal,
    },
    /// Order rejected after submission.
    OrderRejected {
        /// Engine leg id.
        client_order_id: Option<ClientOrderId>,
        /// Broker id, if assigned.
        broker_order_id: Option<BrokerOrderId>,
        /// Rejection reason.
        reason: String,
    },
    /// Broker error message not tied to an order.
    Error {
        /// Broker error code.
        code: i32,
        /// Message.
        message: String,
    },
}

/// Handle through which a broker client pushes events into the engine.
#[derive(Debug, Clone)]
pub struct BrokerEventSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl BrokerEventSink {
    pub(crate) const fn new(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx }
    }

    /// Deliver an event. Returns false once the engine has stopped.
    pub fn emit(&self, event: BrokerEvent) -> bool {
        self.tx.send(EngineEvent::Broker(event)).is_ok()
    }
}

/// Opaque broker connection capability.
///
/// Implementations wrap a concrete broker API. All methods are called from
/// gateway tasks, never from the engine sequencer.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Get broker name for logging and metrics.
    fn broker_name(&self) -> &'static str;

    /// Open the connection and start delivering events to `events`.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is unreachable.
    async fn connect(&self, events: BrokerEventSink) -> Result<(), BrokerError>;

    /// Close the connection.
    async fn disconnect(&self);

    /// Submit an order. Resolves with the broker id once acknowledged.
    ///
    /// # Errors
    ///
    /// Returns an error if the order is rejected or the connection fails.
    async fn submit_order(&self, request: &OrderRequest) -> Result<BrokerOrderId, BrokerError>;

    /// Request cancellation. Confirmation arrives as an `OrderStatus` event.
    ///
    /// # Errors
    ///
    /// Returns an error if the order is unknown, already terminal, or the
    /// connection fails.
    async fn cancel_order(&self, broker_order_id: &BrokerOrderId) -> Result<(), BrokerError>;

    /// Orders currently open at the broker for this account.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    async fn list_open_orders(&self) -> Result<Vec<BrokerOrderSnapshot>, BrokerError>;

    /// Historical state of an order submitted with `client_order_id`.
    ///
    /// `Ok(None)` means the broker has no record of it.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` if the broker keeps no history.
    async fn order_history(
        &self,
        client_order_id: &ClientOrderId,
    ) -> Result<Option<BrokerOrderSnapshot>, BrokerError> {
        let _ = client_order_id;
        Err(BrokerError::Unsupported("order history"))
    }

    /// Net positions held at the broker for this account.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` if the broker cannot report positions, or an
    /// error if the connection fails.
    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        Err(BrokerError::Unsupported("positions"))
    }

    /// Current quote for `symbol`, if available.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    async fn quote(&self, symbol: &str) -> Result<Option<Quote>, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_classification() {
        assert!(BrokerError::NotConnected.is_connectivity());
        assert!(BrokerError::Connection("reset".to_string()).is_connectivity());
        assert!(
            !BrokerError::Timeout {
                operation: "submit",
                secs: 10
            }
            .is_connectivity()
        );
        assert!(!BrokerError::OrderRejected("margin".to_string()).is_connectivity());
    }

    #[test]
    fn test_broker_status_terminal() {
        assert!(BrokerOrderStatus::Filled.is_terminal());
        assert!(BrokerOrderStatus::Cancelled.is_terminal());
        assert!(!BrokerOrderStatus::Submitted.is_terminal());
        assert!(!BrokerOrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_sink_reports_closed_engine() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = BrokerEventSink::new(tx);
        assert!(sink.emit(BrokerEvent::Connected));
        drop(rx);
        assert!(!sink.emit(BrokerEvent::Connected));
    }
}
