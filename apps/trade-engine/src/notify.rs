//! Operator notifications.
//!
//! Notifications are fire-and-forget: [`Notifier::notify`] never blocks and
//! never fails, so a slow or broken channel cannot hold up trading.

use std::fmt;

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::error::ErrorCode;
use crate::models::{OrderId, OrderType, TradeAction};
use crate::session::MarketSession;

/// How urgently a notification needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Info,
    /// Needs a look.
    Warning,
    /// Needs manual intervention.
    Critical,
}

/// Event reported to the operator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Engine started.
    EngineStarted {
        /// Engine name.
        name: String,
        /// Broker account.
        account_id: String,
        /// Orders restored from storage.
        restored_orders: usize,
    },
    /// Engine stopped.
    EngineStopped {
        /// Engine name.
        name: String,
        /// Orders still live, persisted for the next start.
        open_orders: usize,
    },
    /// Alert refused.
    AlertRejected {
        /// Symbol.
        symbol: String,
        /// Action.
        action: TradeAction,
        /// Reason code.
        code: ErrorCode,
        /// Detail.
        message: String,
    },
    /// Order created and handed to the gateway.
    OrderSubmitted {
        /// Order.
        order_id: OrderId,
        /// Symbol.
        symbol: String,
        /// Action.
        action: TradeAction,
        /// Quantity.
        quantity: u64,
        /// Order type.
        order_type: OrderType,
        /// Session at submission.
        session: MarketSession,
        /// Held until the broker connection is restored.
        queued: bool,
    },
    /// Order completely filled.
    OrderFilled {
        /// Order.
        order_id: OrderId,
        /// Symbol.
        symbol: String,
        /// Action.
        action: TradeAction,
        /// Filled quantity.
        quantity: u64,
        /// Average fill price.
        avg_price: Decimal,
    },
    /// Order cancelled and resubmitted at a fresh price.
    OrderResubmitted {
        /// Order.
        order_id: OrderId,
        /// Symbol.
        symbol: String,
        /// Resubmissions so far.
        resubmit_count: u32,
        /// Quantity resubmitted.
        remaining: u64,
    },
    /// Order cancelled by the broker.
    OrderCancelled {
        /// Order.
        order_id: OrderId,
        /// Symbol.
        symbol: String,
        /// Quantity filled before the cancel.
        filled_quantity: u64,
        /// Broker message.
        reason: String,
    },
    /// Order rejected.
    OrderRejected {
        /// Order.
        order_id: OrderId,
        /// Symbol.
        symbol: String,
        /// Reason.
        reason: String,
    },
    /// Order expired; the signal was not executed in full.
    OrderExpired {
        /// Order.
        order_id: OrderId,
        /// Symbol.
        symbol: String,
        /// Quantity filled before expiry.
        filled_quantity: u64,
        /// Resubmissions made.
        resubmit_count: u32,
        /// Detail.
        reason: String,
    },
    /// Broker connection lost.
    ConnectionLost {
        /// Reason.
        reason: String,
    },
    /// First broker connection since start, reconciled.
    BrokerConnected {
        /// Legs compared with the broker.
        reconciled: usize,
        /// Queued submissions released.
        released: usize,
    },
    /// Broker connection restored and reconciled.
    ConnectionRestored {
        /// Legs compared with the broker.
        reconciled: usize,
        /// Queued submissions released.
        released: usize,
    },
    /// Reconnection attempts exhausted.
    ReconnectExhausted {
        /// Attempts made.
        attempts: u32,
    },
    /// Broker state does not match local state.
    ReconciliationAnomaly {
        /// Symbol, if known.
        symbol: Option<String>,
        /// Order, if known.
        order_id: Option<OrderId>,
        /// Detail.
        detail: String,
    },
    /// MARKET order unfilled after its timeout.
    MarketOrderStale {
        /// Order.
        order_id: OrderId,
        /// Symbol.
        symbol: String,
        /// Order age in seconds.
        age_secs: u64,
    },
    /// Engine cannot continue.
    Fatal {
        /// Detail.
        message: String,
    },
}

impl Notification {
    /// Severity of this notification.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::EngineStarted { .. }
            | Self::EngineStopped { .. }
            | Self::OrderSubmitted { .. }
            | Self::OrderFilled { .. }
            | Self::OrderResubmitted { .. }
            | Self::BrokerConnected { .. }
            | Self::ConnectionRestored { .. } => Severity::Info,
            Self::AlertRejected { .. }
            | Self::OrderCancelled { .. }
            | Self::OrderRejected { .. }
            | Self::ConnectionLost { .. } => Severity::Warning,
            Self::OrderExpired { .. }
            | Self::ReconnectExhausted { .. }
            | Self::ReconciliationAnomaly { .. }
            | Self::MarketOrderStale { .. }
            | Self::Fatal { .. } => Severity::Critical,
        }
    }

    /// Short name of the notification.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::EngineStarted { .. } => "engine_started",
            Self::EngineStopped { .. } => "engine_stopped",
            Self::AlertRejected { .. } => "alert_rejected",
            Self::OrderSubmitted { .. } => "order_submitted",
            Self::OrderFilled { .. } => "order_filled",
            Self::OrderResubmitted { .. } => "order_resubmitted",
            Self::OrderCancelled { .. } => "order_cancelled",
            Self::OrderRejected { .. } => "order_rejected",
            Self::OrderExpired { .. } => "order_expired",
            Self::ConnectionLost { .. } => "connection_lost",
            Self::BrokerConnected { .. } => "broker_connected",
            Self::ConnectionRestored { .. } => "connection_restored",
            Self::ReconnectExhausted { .. } => "reconnect_exhausted",
            Self::ReconciliationAnomaly { .. } => "reconciliation_anomaly",
            Self::MarketOrderStale { .. } => "market_order_stale",
            Self::Fatal { .. } => "fatal",
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => f.write_str(self.kind()),
        }
    }
}

/// Sink for operator notifications.
pub trait Notifier: Send + Sync + fmt::Debug {
    /// Deliver a notification without blocking.
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) {
        let kind = notification.kind();
        match notification.severity() {
            Severity::Info => info!(kind, body = %notification, "Notification"),
            Severity::Warning => warn!(kind, body = %notification, "Notification"),
            Severity::Critical => error!(kind, body = %notification, "Notification"),
        }
    }
}

/// Forwards notifications over an unbounded channel.
///
/// Delivery to a dropped receiver is silently discarded.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    /// Create a notifier and the receiving end of its channel.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }
}
