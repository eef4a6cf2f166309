//! In-process paper broker.
//!
//! Implements [`BrokerClient`] without a network connection. MARKET orders
//! fill immediately at the quote when one is set; LIMIT orders rest until
//! filled manually with [`PaperBroker::fill`] (or, when enabled, fill when
//! marketable). Connectivity can be dropped and restored to exercise the
//! gateway's queueing and reconciliation paths.
//!
//! Events are only delivered while connected. A fill recorded while the
//! connection is down is visible afterwards through open-order listing and
//! order history, as with a real broker. Executions also move the paper
//! account's net positions, which reconciliation compares with the ledger.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::{
    BrokerClient, BrokerError, BrokerEvent, BrokerEventSink, BrokerOrderSnapshot,
    BrokerOrderStatus, BrokerPosition, OrderRequest, Quote,
};
use crate::execution::pricing::reference_price;
use crate::models::{BrokerOrderId, ClientOrderId, OrderSide, OrderType};

#[derive(Debug)]
struct PaperOrder {
    snapshot: BrokerOrderSnapshot,
    limit_price: Option<Decimal>,
}

#[derive(Debug)]
struct PaperState {
    connected: bool,
    reachable: bool,
    history_supported: bool,
    auto_fill_market: bool,
    fill_marketable_limits: bool,
    confirm_cancels: bool,
    reject_next: Option<String>,
    sink: Option<BrokerEventSink>,
    quotes: HashMap<String, Quote>,
    orders: HashMap<BrokerOrderId, PaperOrder>,
    by_client: HashMap<ClientOrderId, BrokerOrderId>,
    positions: HashMap<String, BrokerPosition>,
    positions_supported: bool,
    next_id: u64,
    submitted: Vec<OrderRequest>,
    cancels: Vec<BrokerOrderId>,
}

impl Default for PaperState {
    fn default() -> Self {
        Self {
            connected: false,
            reachable: true,
            history_supported: true,
            auto_fill_market: true,
            fill_marketable_limits: false,
            confirm_cancels: true,
            reject_next: None,
            sink: None,
            quotes: HashMap::new(),
            orders: HashMap::new(),
            by_client: HashMap::new(),
            positions: HashMap::new(),
            positions_supported: true,
            next_id: 1,
            submitted: Vec::new(),
            cancels: Vec::new(),
        }
    }
}

impl PaperState {
    fn emit(&self, event: BrokerEvent) {
        if !self.connected {
            return;
        }
        if let Some(sink) = &self.sink {
            sink.emit(event);
        }
    }

    /// Record an execution of `quantity` at `price` and report it.
    fn execute(
        &mut self,
        broker_order_id: &BrokerOrderId,
        quantity: u64,
        price: Decimal,
    ) -> Result<(), BrokerError> {
        let order = self
            .orders
            .get_mut(broker_order_id)
            .ok_or_else(|| BrokerError::OrderNotFound(broker_order_id.to_string()))?;
        let snapshot = &mut order.snapshot;
        if snapshot.status.is_terminal() {
            return Err(BrokerError::OrderNotCancelable(broker_order_id.to_string()));
        }

        let quantity = quantity.min(snapshot.quantity - snapshot.filled_quantity);
        if quantity == 0 {
            return Ok(());
        }
        let notional = snapshot.avg_fill_price * Decimal::from(snapshot.filled_quantity)
            + price * Decimal::from(quantity);
        snapshot.filled_quantity += quantity;
        snapshot.avg_fill_price = (notional / Decimal::from(snapshot.filled_quantity)).round_dp(4);
        snapshot.status = if snapshot.filled_quantity == snapshot.quantity {
            BrokerOrderStatus::Filled
        } else {
            BrokerOrderStatus::PartiallyFilled
        };
        let snapshot = snapshot.clone();
        let shares = i64::try_from(quantity).unwrap_or(i64::MAX);
        let signed = match snapshot.side {
            OrderSide::Buy => shares,
            OrderSide::Sell => -shares,
        };
        self.move_position(&snapshot.symbol, signed, price);

        debug!(
            broker_order_id = %snapshot.broker_order_id,
            quantity,
            price = %price,
            cumulative = snapshot.filled_quantity,
            "Paper execution"
        );
        self.emit(BrokerEvent::OrderFilled {
            client_order_id: Some(snapshot.client_order_id.clone()),
            broker_order_id: snapshot.broker_order_id.clone(),
            last_quantity: quantity,
            last_price: price,
            cumulative_quantity: snapshot.filled_quantity,
            avg_fill_price: snapshot.avg_fill_price,
        });
        self.emit(BrokerEvent::OrderStatus {
            client_order_id: Some(snapshot.client_order_id),
            broker_order_id: snapshot.broker_order_id,
            status: snapshot.status,
            filled_quantity: snapshot.filled_quantity,
            avg_fill_price: snapshot.avg_fill_price,
            message: None,
        });
        Ok(())
    }

    fn move_position(&mut self, symbol: &str, delta: i64, price: Decimal) {
        let position = self
            .positions
            .entry(symbol.to_string())
            .or_insert_with(|| BrokerPosition {
                symbol: symbol.to_string(),
                quantity: 0,
                avg_cost: Decimal::ZERO,
            });
        let before = position.quantity;
        let after = before + delta;
        position.avg_cost = if after == 0 {
            Decimal::ZERO
        } else if before == 0 || before.signum() != after.signum() {
            price
        } else if after.abs() > before.abs() {
            let notional = position.avg_cost * Decimal::from(before.abs())
                + price * Decimal::from(delta.abs());
            (notional / Decimal::from(after.abs())).round_dp(4)
        } else {
            position.avg_cost
        };
        position.quantity = after;
    }

    /// Price at which `order` would fill immediately, if any.
    fn immediate_fill_price(&self, order: &PaperOrder) -> Option<Decimal> {
        let quote = self.quotes.get(&order.snapshot.symbol)?;
        let side = order.snapshot.side;
        let touch = reference_price(side, quote)?;
        match order.limit_price {
            None if self.auto_fill_market => Some(touch),
            Some(limit) if self.fill_marketable_limits => {
                let marketable = match side {
                    OrderSide::Buy => limit >= touch,
                    OrderSide::Sell => limit <= touch,
                };
                marketable.then_some(touch)
            }
            _ => None,
        }
    }
}

/// In-process paper broker.
///
/// Cloning yields another handle to the same simulated broker, so a test
/// can keep one handle while the engine owns another.
#[derive(Debug, Clone, Default)]
pub struct PaperBroker {
    state: Arc<Mutex<PaperState>>,
}

impl PaperBroker {
    /// Create a reachable, disconnected paper broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the quote for `symbol`.
    pub fn set_quote(&self, symbol: &str, quote: Quote) {
        self.lock().quotes.insert(symbol.to_uppercase(), quote);
    }

    /// Remove the quote for `symbol`.
    pub fn clear_quote(&self, symbol: &str) {
        self.lock().quotes.remove(&symbol.to_uppercase());
    }

    /// Make connection attempts succeed or fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Enable or disable historical order lookup.
    pub fn set_history_supported(&self, supported: bool) {
        self.lock().history_supported = supported;
    }

    /// Fill MARKET orders on submission when a quote is available.
    pub fn set_auto_fill_market(&self, enabled: bool) {
        self.lock().auto_fill_market = enabled;
    }

    /// Fill LIMIT orders on submission when the limit crosses the quote.
    pub fn set_fill_marketable_limits(&self, enabled: bool) {
        self.lock().fill_marketable_limits = enabled;
    }

    /// Enable or disable position reporting.
    pub fn set_positions_supported(&self, supported: bool) {
        self.lock().positions_supported = supported;
    }

    /// Overwrite the broker's holding in `symbol`, as if it was traded
    /// outside the engine.
    pub fn set_position(&self, symbol: &str, quantity: i64, avg_cost: Decimal) {
        let symbol = symbol.to_uppercase();
        self.lock().positions.insert(
            symbol.clone(),
            BrokerPosition {
                symbol,
                quantity,
                avg_cost,
            },
        );
    }

    /// Net broker holding in `symbol`.
    #[must_use]
    pub fn position(&self, symbol: &str) -> i64 {
        self.lock()
            .positions
            .get(&symbol.to_uppercase())
            .map_or(0, |p| p.quantity)
    }

    /// When disabled, cancel requests are accepted but never take effect or
    /// get confirmed.
    pub fn set_confirm_cancels(&self, enabled: bool) {
        self.lock().confirm_cancels = enabled;
    }

    /// Reject the next submission with `reason`.
    pub fn reject_next(&self, reason: impl Into<String>) {
        self.lock().reject_next = Some(reason.into());
    }

    /// Whether a client is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Every submission received, in order.
    #[must_use]
    pub fn submitted(&self) -> Vec<OrderRequest> {
        self.lock().submitted.clone()
    }

    /// Every cancel request received, in order.
    #[must_use]
    pub fn cancels(&self) -> Vec<BrokerOrderId> {
        self.lock().cancels.clone()
    }

    /// Current broker view of the order submitted as `client_order_id`.
    #[must_use]
    pub fn order(&self, client_order_id: &ClientOrderId) -> Option<BrokerOrderSnapshot> {
        let state = self.lock();
        let broker_order_id = state.by_client.get(client_order_id)?;
        state.orders.get(broker_order_id).map(|o| o.snapshot.clone())
    }

    /// Number of orders still open.
    #[must_use]
    pub fn open_order_count(&self) -> usize {
        self.lock()
            .orders
            .values()
            .filter(|o| !o.snapshot.status.is_terminal())
            .count()
    }

    /// Execute `quantity` of the order submitted as `client_order_id`.
    ///
    /// # Errors
    ///
    /// Returns `OrderNotFound` for an unknown order, or
    /// `OrderNotCancelable` if the order is already terminal.
    pub fn fill(
        &self,
        client_order_id: &ClientOrderId,
        quantity: u64,
        price: Decimal,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let broker_order_id = state
            .by_client
            .get(client_order_id)
            .cloned()
            .ok_or_else(|| BrokerError::OrderNotFound(client_order_id.to_string()))?;
        state.execute(&broker_order_id, quantity, price)
    }

    /// Drop the connection, reporting `reason` to the connected client.
    pub fn drop_connection(&self, reason: &str) {
        let mut state = self.lock();
        if !state.connected {
            return;
        }
        info!(reason = %reason, "Paper broker dropping connection");
        state.emit(BrokerEvent::Disconnected {
            reason: reason.to_string(),
        });
        state.connected = false;
        state.sink = None;
    }
}

#[async_trait]
impl BrokerClient for PaperBroker {
    fn broker_name(&self) -> &'static str {
        "paper"
    }

    async fn connect(&self, events: BrokerEventSink) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if !state.reachable {
            return Err(BrokerError::Connection(
                "paper broker unreachable".to_string(),
            ));
        }
        state.connected = true;
        state.sink = Some(events);
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = self.lock();
        state.connected = false;
        state.sink = None;
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<BrokerOrderId, BrokerError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        state.submitted.push(request.clone());
        if let Some(reason) = state.reject_next.take() {
            return Err(BrokerError::OrderRejected(reason));
        }
        if request.order_type == OrderType::Limit && request.limit_price.is_none() {
            return Err(BrokerError::OrderRejected(
                "limit order without price".to_string(),
            ));
        }

        let broker_order_id = BrokerOrderId::new(format!("P{}", state.next_id));
        state.next_id += 1;
        let order = PaperOrder {
            snapshot: BrokerOrderSnapshot {
                client_order_id: request.client_order_id.clone(),
                broker_order_id: broker_order_id.clone(),
                symbol: request.symbol.clone(),
                side: request.side,
                quantity: request.quantity,
                filled_quantity: 0,
                avg_fill_price: Decimal::ZERO,
                status: BrokerOrderStatus::Submitted,
            },
            limit_price: request.limit_price,
        };
        let fill_price = state.immediate_fill_price(&order);
        state
            .by_client
            .insert(request.client_order_id.clone(), broker_order_id.clone());
        state.orders.insert(broker_order_id.clone(), order);

        state.emit(BrokerEvent::OrderAck {
            client_order_id: request.client_order_id.clone(),
            broker_order_id: broker_order_id.clone(),
        });
        if let Some(price) = fill_price {
            state.execute(&broker_order_id, request.quantity, price)?;
        }
        Ok(broker_order_id)
    }

    async fn cancel_order(&self, broker_order_id: &BrokerOrderId) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        state.cancels.push(broker_order_id.clone());
        let confirm = state.confirm_cancels;
        let order = state
            .orders
            .get_mut(broker_order_id)
            .ok_or_else(|| BrokerError::OrderNotFound(broker_order_id.to_string()))?;
        if order.snapshot.status.is_terminal() {
            return Err(BrokerError::OrderNotCancelable(broker_order_id.to_string()));
        }
        if !confirm {
            debug!(broker_order_id = %broker_order_id, "Paper cancel accepted without effect");
            return Ok(());
        }
        order.snapshot.status = BrokerOrderStatus::Cancelled;
        let snapshot = order.snapshot.clone();
        state.emit(BrokerEvent::OrderStatus {
            client_order_id: Some(snapshot.client_order_id),
            broker_order_id: snapshot.broker_order_id,
            status: BrokerOrderStatus::Cancelled,
            filled_quantity: snapshot.filled_quantity,
            avg_fill_price: snapshot.avg_fill_price,
            message: Some("cancelled by request".to_string()),
        });
        Ok(())
    }

    async fn list_open_orders(&self) -> Result<Vec<BrokerOrderSnapshot>, BrokerError> {
        let state = self.lock();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        Ok(state
            .orders
            .values()
            .filter(|o| !o.snapshot.status.is_terminal())
            .map(|o| o.snapshot.clone())
            .collect())
    }

    async fn order_history(
        &self,
        client_order_id: &ClientOrderId,
    ) -> Result<Option<BrokerOrderSnapshot>, BrokerError> {
        let state = self.lock();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        if !state.history_supported {
            return Err(BrokerError::Unsupported("order history"));
        }
        Ok(state
            .by_client
            .get(client_order_id)
            .and_then(|id| state.orders.get(id))
            .map(|o| o.snapshot.clone()))
    }

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let state = self.lock();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        if !state.positions_supported {
            return Err(BrokerError::Unsupported("positions"));
        }
        Ok(state
            .positions
            .values()
            .filter(|p| p.quantity != 0)
            .cloned()
            .collect())
    }

    async fn quote(&self, symbol: &str) -> Result<Option<Quote>, BrokerError> {
        let state = self.lock();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        Ok(state.quotes.get(&symbol.to_uppercase()).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineEvent;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    fn request(id: &str, order_type: OrderType, limit_price: Option<Decimal>) -> OrderRequest {
        OrderRequest {
            client_order_id: ClientOrderId::new(id),
            account_id: "DU1".to_string(),
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            quantity: 100,
            order_type,
            limit_price,
            outside_rth: false,
        }
    }

    async fn connected() -> (PaperBroker, mpsc::UnboundedReceiver<EngineEvent>) {
        let broker = PaperBroker::new();
        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(e) = broker.connect(BrokerEventSink::new(tx)).await {
            panic!("paper broker should connect: {e}");
        }
        (broker, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<BrokerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::Broker(event) = event {
                events.push(event);
            }
        }
        events
    }

    #[tokio::test]
    async fn test_market_order_fills_at_ask() {
        let (broker, mut rx) = connected().await;
        broker.set_quote(
            "AAPL",
            Quote {
                bid: Some(dec!(179.9)),
                ask: Some(dec!(180.1)),
                last: None,
            },
        );

        let id = match broker.submit_order(&request("o.0", OrderType::Market, None)).await {
            Ok(id) => id,
            Err(e) => panic!("submit should succeed: {e}"),
        };
        assert_eq!(id.as_str(), "P1");

        let events = drain(&mut rx);
        assert!(matches!(events[0], BrokerEvent::OrderAck { .. }));
        assert!(events.iter().any(|e| matches!(
            e,
            BrokerEvent::OrderFilled { cumulative_quantity: 100, last_price, .. } if *last_price == dec!(180.1)
        )));
        assert_eq!(broker.open_order_count(), 0);
    }

    #[tokio::test]
    async fn test_limit_order_rests_until_filled() {
        let (broker, mut rx) = connected().await;
        broker
            .submit_order(&request("o.0", OrderType::Limit, Some(dec!(50))))
            .await
            .unwrap();
        assert_eq!(broker.open_order_count(), 1);

        broker.fill(&ClientOrderId::new("o.0"), 40, dec!(50)).unwrap();
        broker.fill(&ClientOrderId::new("o.0"), 60, dec!(49)).unwrap();
        let snapshot = broker.order(&ClientOrderId::new("o.0")).unwrap();
        assert_eq!(snapshot.status, BrokerOrderStatus::Filled);
        assert_eq!(snapshot.avg_fill_price, dec!(49.4));

        let fills = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, BrokerEvent::OrderFilled { .. }))
            .count();
        assert_eq!(fills, 2);
    }

    #[tokio::test]
    async fn test_cancel_terminal_order_fails() {
        let (broker, _rx) = connected().await;
        let id = broker
            .submit_order(&request("o.0", OrderType::Limit, Some(dec!(50))))
            .await
            .unwrap();
        assert!(broker.cancel_order(&id).await.is_ok());
        assert_eq!(
            broker.cancel_order(&id).await,
            Err(BrokerError::OrderNotCancelable("P1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_unconfirmed_cancel_leaves_order_open() {
        let (broker, mut rx) = connected().await;
        let id = broker
            .submit_order(&request("o.0", OrderType::Limit, Some(dec!(50))))
            .await
            .unwrap();
        drain(&mut rx);

        broker.set_confirm_cancels(false);
        assert!(broker.cancel_order(&id).await.is_ok());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(broker.open_order_count(), 1);
        assert_eq!(broker.cancels().len(), 1);
    }

    #[tokio::test]
    async fn test_fill_while_disconnected_is_silent() {
        let (broker, mut rx) = connected().await;
        broker
            .submit_order(&request("o.0", OrderType::Limit, Some(dec!(50))))
            .await
            .unwrap();
        drain(&mut rx);

        broker.drop_connection("network");
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [BrokerEvent::Disconnected { .. }]
        ));

        broker.fill(&ClientOrderId::new("o.0"), 100, dec!(50)).unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(
            broker.order(&ClientOrderId::new("o.0")).unwrap().status,
            BrokerOrderStatus::Filled
        );
    }

    #[tokio::test]
    async fn test_executions_move_net_position() {
        let (broker, _rx) = connected().await;
        broker
            .submit_order(&request("o.0", OrderType::Limit, Some(dec!(50))))
            .await
            .unwrap();
        broker.fill(&ClientOrderId::new("o.0"), 60, dec!(50)).unwrap();
        broker.fill(&ClientOrderId::new("o.0"), 40, dec!(45)).unwrap();

        let positions = broker.list_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 100);
        assert_eq!(positions[0].avg_cost, dec!(48));

        let mut sell = request("o.1", OrderType::Limit, Some(dec!(55)));
        sell.side = OrderSide::Sell;
        broker.submit_order(&sell).await.unwrap();
        broker.fill(&ClientOrderId::new("o.1"), 100, dec!(55)).unwrap();
        assert_eq!(broker.position("AAPL"), 0);
        assert!(broker.list_positions().await.unwrap().is_empty());

        broker.set_position("msft", -20, dec!(400));
        assert_eq!(broker.position("MSFT"), -20);

        broker.set_positions_supported(false);
        assert_eq!(
            broker.list_positions().await,
            Err(BrokerError::Unsupported("positions"))
        );
    }

    #[tokio::test]
    async fn test_unreachable_broker_refuses_connection() {
        let broker = PaperBroker::new();
        broker.set_reachable(false);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(broker.connect(BrokerEventSink::new(tx)).await.is_err());
        assert!(!broker.is_connected());
    }

    #[tokio::test]
    async fn test_history_lookup() {
        let (broker, _rx) = connected().await;
        broker
            .submit_order(&request("o.0", OrderType::Limit, Some(dec!(50))))
            .await
            .unwrap();
        let found = broker.order_history(&ClientOrderId::new("o.0")).await.unwrap();
        assert!(found.is_some());
        let missing = broker.order_history(&ClientOrderId::new("x.0")).await.unwrap();
        assert!(missing.is_none());

        broker.set_history_supported(false);
        assert_eq!(
            broker.order_history(&ClientOrderId::new("o.0")).await,
            Err(BrokerError::Unsupported("order history"))
        );
    }
}
