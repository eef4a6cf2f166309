//! Broker gateway adapter.
//!
//! The engine's only channel to the broker. Owns the connection state
//! machine, holds submissions while disconnected, and runs every broker
//! call on its own task so the sequencer never waits on the network.
//! Completions come back to the sequencer as [`GatewayEvent`]s.
//!
//! Connection states:
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> RECONCILING -> CONNECTED
//!       ^              |              |            |
//!       +--------------+--------------+------------+  (failure / disconnect)
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::reconcile::{HistoryLookup, ReconcileCandidate, ReconcileFetch, absent_candidates};
use super::reconnect::ReconnectPolicy;
use super::{BrokerClient, BrokerError, BrokerEventSink, OrderRequest};
use crate::config::{BrokerConfig, EngineConfig};
use crate::engine::EngineEvent;
use crate::execution::pricing::{PriceInstruction, limit_from_quote};
use crate::models::{BrokerOrderId, ClientOrderId};

/// Broker connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No connection; submissions are queued.
    Disconnected,
    /// Connection attempt in progress.
    Connecting,
    /// Connected, comparing local orders with the broker.
    Reconciling,
    /// Connected and reconciled.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Reconciling => "RECONCILING",
            Self::Connected => "CONNECTED",
        })
    }
}

/// The engine's broker connection.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerConnection {
    /// Connection state.
    pub state: ConnectionState,
    /// Broker name.
    pub broker: &'static str,
    /// Broker account.
    pub account_id: String,
    /// Client id of this engine.
    pub client_id: u32,
    /// Start of the current connection.
    pub connected_since: Option<DateTime<Utc>>,
    /// Reason for the last disconnect.
    pub last_disconnect_reason: Option<String>,
    /// Reconnection attempts since the connection was lost.
    pub reconnect_attempts: u32,
}

/// A submission waiting for or handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitCommand {
    /// Order to submit; the limit price is filled in from `pricing`.
    pub request: OrderRequest,
    /// How to price the order.
    pub pricing: PriceInstruction,
}

/// Broker acknowledgement of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitAck {
    /// Broker id.
    pub broker_order_id: BrokerOrderId,
    /// Limit price actually submitted.
    pub limit_price: Option<Decimal>,
}

/// Completion of gateway work, delivered to the sequencer.
#[derive(Debug)]
pub enum GatewayEvent {
    /// Connection attempt finished.
    ConnectCompleted(Result<(), BrokerError>),
    /// Reconnection delay elapsed.
    ReconnectDue,
    /// Submission finished.
    SubmitCompleted {
        /// Leg id.
        client_order_id: ClientOrderId,
        /// Outcome.
        result: Result<SubmitAck, BrokerError>,
    },
    /// Cancel request finished. Confirmation arrives as a broker event.
    CancelCompleted {
        /// Leg id.
        client_order_id: ClientOrderId,
        /// Outcome.
        result: Result<(), BrokerError>,
    },
    /// Broker state for reconciliation gathered.
    ReconcileFetched {
        /// Reconciliation run the fetch belongs to.
        epoch: u64,
        /// Legs compared.
        candidates: Vec<ReconcileCandidate>,
        /// Broker state.
        result: Result<ReconcileFetch, BrokerError>,
    },
}

/// Whether a submission went out or was held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Handed to the broker.
    Sent,
    /// Held until the connection is restored.
    Queued,
}

/// What happened after a connection loss or failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectSchedule {
    /// Next attempt scheduled.
    Scheduled {
        /// Attempt number.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// An attempt is already pending.
    AlreadyScheduled,
    /// Retry cap reached.
    Exhausted {
        /// Attempts made.
        attempts: u32,
    },
}

/// Broker gateway adapter.
pub struct BrokerGateway<B: BrokerClient> {
    client: Arc<B>,
    connection: BrokerConnection,
    events: mpsc::UnboundedSender<EngineEvent>,
    queue: VecDeque<SubmitCommand>,
    max_queue_depth: usize,
    ack_timeout: Duration,
    reconnect: ReconnectPolicy,
    reconnect_scheduled: bool,
    reconcile_epoch: u64,
}

impl<B: BrokerClient> fmt::Debug for BrokerGateway<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerGateway")
            .field("connection", &self.connection)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl<B: BrokerClient> BrokerGateway<B> {
    /// Create a gateway. No connection is attempted until [`Self::connect`].
    #[must_use]
    pub fn new(
        client: Arc<B>,
        engine: &EngineConfig,
        broker: &BrokerConfig,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        let connection = BrokerConnection {
            state: ConnectionState::Disconnected,
            broker: client.broker_name(),
            account_id: engine.account_id.clone(),
            client_id: engine.client_id,
            connected_since: None,
            last_disconnect_reason: None,
            reconnect_attempts: 0,
        };
        Self {
            client,
            connection,
            events,
            queue: VecDeque::new(),
            max_queue_depth: broker.max_queue_depth,
            ack_timeout: broker.ack_timeout(),
            reconnect: ReconnectPolicy::new(broker),
            reconnect_scheduled: false,
            reconcile_epoch: 0,
        }
    }

    /// Connection details.
    #[must_use]
    pub const fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    /// Connection state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.connection.state
    }

    /// Whether submissions go straight to the broker.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.state == ConnectionState::Connected
    }

    /// Submissions currently held.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Whether a new submission can be sent or held.
    #[must_use]
    pub fn can_accept(&self) -> bool {
        self.is_connected() || self.queue.len() < self.max_queue_depth
    }

    /// Whether the submission for `client_order_id` is held.
    #[must_use]
    pub fn is_queued(&self, client_order_id: &ClientOrderId) -> bool {
        self.queue
            .iter()
            .any(|cmd| &cmd.request.client_order_id == client_order_id)
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Start a connection attempt.
    pub fn connect(&mut self) {
        if matches!(
            self.connection.state,
            ConnectionState::Connecting | ConnectionState::Reconciling | ConnectionState::Connected
        ) {
            return;
        }
        self.connection.state = ConnectionState::Connecting;
        info!(
            broker = self.connection.broker,
            account_id = %self.connection.account_id,
            client_id = self.connection.client_id,
            "Connecting to broker"
        );

        let client = Arc::clone(&self.client);
        let events = self.events.clone();
        let sink = BrokerEventSink::new(self.events.clone());
        let limit = self.ack_timeout;
        tokio::spawn(async move {
            let result = timeout(limit, client.connect(sink))
                .await
                .unwrap_or_else(|_| {
                    Err(BrokerError::Timeout {
                        operation: "connect",
                        secs: limit.as_secs(),
                    })
                });
            send(&events, GatewayEvent::ConnectCompleted(result));
        });
    }

    /// Handle the end of a connection attempt.
    ///
    /// Returns `None` on success (the caller starts reconciliation), or the
    /// reconnection schedule on failure.
    pub fn on_connect_completed(
        &mut self,
        result: Result<(), BrokerError>,
        now: DateTime<Utc>,
    ) -> Option<ReconnectSchedule> {
        match result {
            Ok(()) => {
                self.connection.state = ConnectionState::Reconciling;
                self.connection.connected_since = Some(now);
                self.connection.reconnect_attempts = 0;
                self.reconnect.reset();
                info!(broker = self.connection.broker, "Broker connected");
                None
            }
            Err(error) => {
                warn!(broker = self.connection.broker, error = %error, "Broker connection failed");
                self.connection.state = ConnectionState::Disconnected;
                Some(self.schedule_reconnect())
            }
        }
    }

    /// Handle an unsolicited reconnect reported by the client.
    ///
    /// Returns true if the caller should start reconciliation.
    pub fn on_client_connected(&mut self, now: DateTime<Utc>) -> bool {
        match self.connection.state {
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                self.on_connect_completed(Ok(()), now);
                true
            }
            ConnectionState::Reconciling | ConnectionState::Connected => false,
        }
    }

    /// Handle a lost connection.
    pub fn on_disconnected(&mut self, reason: &str) -> ReconnectSchedule {
        warn!(
            broker = self.connection.broker,
            reason = %reason,
            previous = %self.connection.state,
            "Broker disconnected"
        );
        self.connection.state = ConnectionState::Disconnected;
        self.connection.connected_since = None;
        self.connection.last_disconnect_reason = Some(reason.to_string());
        self.schedule_reconnect()
    }

    fn schedule_reconnect(&mut self) -> ReconnectSchedule {
        if self.reconnect_scheduled {
            return ReconnectSchedule::AlreadyScheduled;
        }
        let Some(delay) = self.reconnect.next_delay() else {
            return ReconnectSchedule::Exhausted {
                attempts: self.reconnect.current_attempt(),
            };
        };
        self.reconnect_scheduled = true;
        let attempt = self.reconnect.current_attempt();
        self.connection.reconnect_attempts = attempt;
        info!(attempt, delay_secs = delay.as_secs(), "Broker reconnect scheduled");

        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            send(&events, GatewayEvent::ReconnectDue);
        });
        ReconnectSchedule::Scheduled { attempt, delay }
    }

    /// Handle the end of a reconnection delay.
    pub fn on_reconnect_due(&mut self) {
        self.reconnect_scheduled = false;
        if self.connection.state == ConnectionState::Disconnected {
            self.connect();
        }
    }

    /// Operator-requested reconnect; restarts the retry budget.
    pub fn manual_reconnect(&mut self) {
        self.reconnect.reset();
        self.connection.reconnect_attempts = 0;
        if self.connection.state == ConnectionState::Disconnected && !self.reconnect_scheduled {
            self.connect();
        }
    }

    /// Close the connection.
    pub async fn shutdown(&mut self) {
        if self.connection.state != ConnectionState::Disconnected {
            self.client.disconnect().await;
        }
        self.connection.state = ConnectionState::Disconnected;
        self.connection.connected_since = None;
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Fetch the broker state needed to reconcile `candidates`.
    ///
    /// Returns the epoch the resulting [`GatewayEvent::ReconcileFetched`]
    /// carries.
    pub fn begin_reconciliation(&mut self, candidates: Vec<ReconcileCandidate>) -> u64 {
        self.connection.state = ConnectionState::Reconciling;
        self.reconcile_epoch += 1;
        let epoch = self.reconcile_epoch;
        info!(legs = candidates.len(), epoch, "Reconciling with broker");

        let client = Arc::clone(&self.client);
        let events = self.events.clone();
        let limit = self.ack_timeout;
        tokio::spawn(async move {
            let result = fetch_reconcile_state(client.as_ref(), &candidates, limit).await;
            send(
                &events,
                GatewayEvent::ReconcileFetched {
                    epoch,
                    candidates,
                    result,
                },
            );
        });
        epoch
    }

    /// Whether a fetch from reconciliation run `epoch` still applies.
    ///
    /// A fetch that outlived its connection, or was superseded by a later
    /// run, must be dropped.
    #[must_use]
    pub fn is_current_reconciliation(&self, epoch: u64) -> bool {
        self.connection.state == ConnectionState::Reconciling && epoch == self.reconcile_epoch
    }

    /// Finish reconciliation and release held submissions.
    ///
    /// Returns the legs handed to the broker.
    pub fn finish_reconciliation(&mut self) -> Vec<ClientOrderId> {
        self.connection.state = ConnectionState::Connected;
        let released: Vec<SubmitCommand> = self.queue.drain(..).collect();
        if !released.is_empty() {
            info!(count = released.len(), "Releasing queued submissions");
        }
        released
            .into_iter()
            .map(|cmd| {
                let id = cmd.request.client_order_id.clone();
                self.spawn_submit(cmd);
                id
            })
            .collect()
    }

    /// Handle a failed reconciliation fetch: the connection is not usable.
    pub fn on_reconcile_failed(&mut self, error: &BrokerError) -> ReconnectSchedule {
        self.on_disconnected(&format!("reconciliation failed: {error}"))
    }

    // ========================================================================
    // Orders
    // ========================================================================

    /// Submit now if connected, otherwise hold the submission.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` if disconnected and the queue is full.
    pub fn submit(&mut self, command: SubmitCommand) -> Result<Dispatch, BrokerError> {
        if self.is_connected() {
            self.spawn_submit(command);
            return Ok(Dispatch::Sent);
        }
        if self.queue.len() >= self.max_queue_depth {
            return Err(BrokerError::NotConnected);
        }
        debug!(
            client_order_id = %command.request.client_order_id,
            state = %self.connection.state,
            "Submission queued"
        );
        self.queue.push_back(command);
        Ok(Dispatch::Queued)
    }

    /// Hold an already-accepted submission again after a connectivity
    /// failure. Not subject to the queue depth limit.
    pub fn requeue(&mut self, command: SubmitCommand) {
        if !self.is_queued(&command.request.client_order_id) {
            self.queue.push_front(command);
        }
    }

    /// Drop a held submission.
    pub fn dequeue(&mut self, client_order_id: &ClientOrderId) -> Option<SubmitCommand> {
        let index = self
            .queue
            .iter()
            .position(|cmd| &cmd.request.client_order_id == client_order_id)?;
        self.queue.remove(index)
    }

    /// Request cancellation of a working leg.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` unless the gateway is connected.
    pub fn cancel(
        &mut self,
        client_order_id: ClientOrderId,
        broker_order_id: BrokerOrderId,
    ) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        let client = Arc::clone(&self.client);
        let events = self.events.clone();
        let limit = self.ack_timeout;
        tokio::spawn(async move {
            let result = timeout(limit, client.cancel_order(&broker_order_id))
                .await
                .unwrap_or_else(|_| {
                    Err(BrokerError::Timeout {
                        operation: "cancel",
                        secs: limit.as_secs(),
                    })
                });
            send(
                &events,
                GatewayEvent::CancelCompleted {
                    client_order_id,
                    result,
                },
            );
        });
        Ok(())
    }

    fn spawn_submit(&self, command: SubmitCommand) {
        let client = Arc::clone(&self.client);
        let events = self.events.clone();
        let limit = self.ack_timeout;
        tokio::spawn(async move {
            let client_order_id = command.request.client_order_id.clone();
            let result = timeout(limit, price_and_submit(client.as_ref(), command))
                .await
                .unwrap_or_else(|_| {
                    Err(BrokerError::Timeout {
                        operation: "submit",
                        secs: limit.as_secs(),
                    })
                });
            send(
                &events,
                GatewayEvent::SubmitCompleted {
                    client_order_id,
                    result,
                },
            );
        });
    }
}

fn send(events: &mpsc::UnboundedSender<EngineEvent>, event: GatewayEvent) {
    if events.send(EngineEvent::Gateway(event)).is_err() {
        debug!("Engine stopped; dropping gateway completion");
    }
}

async fn price_and_submit<B: BrokerClient>(
    client: &B,
    command: SubmitCommand,
) -> Result<SubmitAck, BrokerError> {
    let SubmitCommand {
        mut request,
        pricing,
    } = command;

    request.limit_price = match pricing {
        PriceInstruction::Market => None,
        PriceInstruction::Fixed(price) => Some(price),
        PriceInstruction::FromQuote {
            buffer_bps,
            fallback,
        } => {
            let quote = match client.quote(&request.symbol).await {
                Ok(quote) => quote,
                Err(error) => {
                    warn!(symbol = %request.symbol, error = %error, "Quote unavailable");
                    None
                }
            };
            let price = limit_from_quote(request.side, quote.as_ref(), buffer_bps)
                .or(fallback)
                .ok_or_else(|| BrokerError::NoReferencePrice(request.symbol.clone()))?;
            Some(price)
        }
    };

    debug!(
        client_order_id = %request.client_order_id,
        symbol = %request.symbol,
        side = request.side.as_str(),
        quantity = request.quantity,
        order_type = request.order_type.as_str(),
        limit_price = ?request.limit_price,
        "Submitting order"
    );
    let broker_order_id = client.submit_order(&request).await?;
    Ok(SubmitAck {
        broker_order_id,
        limit_price: request.limit_price,
    })
}

async fn fetch_reconcile_state<B: BrokerClient>(
    client: &B,
    candidates: &[ReconcileCandidate],
    limit: Duration,
) -> Result<ReconcileFetch, BrokerError> {
    let timed_out = |operation| BrokerError::Timeout {
        operation,
        secs: limit.as_secs(),
    };

    let open_orders = timeout(limit, client.list_open_orders())
        .await
        .map_err(|_| timed_out("list open orders"))??;

    let mut history = HashMap::new();
    for candidate in absent_candidates(candidates, &open_orders) {
        let lookup = match timeout(limit, client.order_history(&candidate.client_order_id)).await {
            Ok(Ok(Some(snapshot))) => HistoryLookup::Found(snapshot),
            Ok(Ok(None)) => HistoryLookup::NotFound,
            Ok(Err(error)) if error.is_connectivity() => return Err(error),
            Ok(Err(error)) => HistoryLookup::Unavailable(error.to_string()),
            Err(_) => HistoryLookup::Unavailable(timed_out("order history").to_string()),
        };
        history.insert(candidate.client_order_id.clone(), lookup);
    }

    let positions = match timeout(limit, client.list_positions()).await {
        Ok(Ok(positions)) => Some(positions),
        Ok(Err(error)) if error.is_connectivity() => return Err(error),
        Ok(Err(error)) => {
            warn!(error = %error, "Broker positions unavailable, skipping comparison");
            None
        }
        Err(_) => return Err(timed_out("list positions")),
    };

    Ok(ReconcileFetch {
        open_orders,
        history,
        positions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::broker::Quote;
    use crate::models::{OrderSide, OrderType};
    use rust_decimal_macros::dec;

    fn gateway(
        broker: &PaperBroker,
        depth: usize,
    ) -> (
        BrokerGateway<PaperBroker>,
        mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = EngineConfig {
            account_id: "DU1".to_string(),
            ..EngineConfig::default()
        };
        let broker_config = BrokerConfig {
            max_queue_depth: depth,
            reconnect_interval_secs: 0,
            max_reconnect_attempts: 2,
            ..BrokerConfig::default()
        };
        (
            BrokerGateway::new(Arc::new(broker.clone()), &engine, &broker_config, tx),
            rx,
        )
    }

    fn command(id: &str, pricing: PriceInstruction) -> SubmitCommand {
        SubmitCommand {
            request: OrderRequest {
                client_order_id: ClientOrderId::new(id),
                account_id: "DU1".to_string(),
                symbol: "AAPL".to_string(),
                side: OrderSide::Buy,
                quantity: 10,
                order_type: OrderType::Limit,
                limit_price: None,
                outside_rth: true,
            },
            pricing,
        }
    }

    async fn next_gateway_event(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> GatewayEvent {
        loop {
            match rx.recv().await {
                Some(EngineEvent::Gateway(event)) => return event,
                Some(EngineEvent::Broker(_)) => {}
                None => panic!("event channel closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_connect_moves_to_reconciling() {
        let broker = PaperBroker::new();
        let (mut gw, mut rx) = gateway(&broker, 2);
        gw.connect();
        assert_eq!(gw.state(), ConnectionState::Connecting);

        let GatewayEvent::ConnectCompleted(result) = next_gateway_event(&mut rx).await else {
            panic!("expected connect completion");
        };
        assert_eq!(gw.on_connect_completed(result, Utc::now()), None);
        assert_eq!(gw.state(), ConnectionState::Reconciling);
        assert!(broker.is_connected());
    }

    #[tokio::test]
    async fn test_failed_connect_schedules_capped_retries() {
        let broker = PaperBroker::new();
        broker.set_reachable(false);
        let (mut gw, mut rx) = gateway(&broker, 2);

        gw.connect();
        let GatewayEvent::ConnectCompleted(result) = next_gateway_event(&mut rx).await else {
            panic!("expected connect completion");
        };
        assert!(matches!(
            gw.on_connect_completed(result, Utc::now()),
            Some(ReconnectSchedule::Scheduled { attempt: 1, .. })
        ));

        assert!(matches!(
            next_gateway_event(&mut rx).await,
            GatewayEvent::ReconnectDue
        ));
        gw.on_reconnect_due();
        let GatewayEvent::ConnectCompleted(result) = next_gateway_event(&mut rx).await else {
            panic!("expected connect completion");
        };
        assert!(matches!(
            gw.on_connect_completed(result, Utc::now()),
            Some(ReconnectSchedule::Scheduled { attempt: 2, .. })
        ));

        assert!(matches!(
            next_gateway_event(&mut rx).await,
            GatewayEvent::ReconnectDue
        ));
        gw.on_reconnect_due();
        let GatewayEvent::ConnectCompleted(result) = next_gateway_event(&mut rx).await else {
            panic!("expected connect completion");
        };
        assert_eq!(
            gw.on_connect_completed(result, Utc::now()),
            Some(ReconnectSchedule::Exhausted { attempts: 2 })
        );
    }

    #[tokio::test]
    async fn test_submissions_queue_while_disconnected() {
        let broker = PaperBroker::new();
        let (mut gw, _rx) = gateway(&broker, 2);

        assert_eq!(
            gw.submit(command("a.0", PriceInstruction::Market)),
            Ok(Dispatch::Queued)
        );
        assert_eq!(
            gw.submit(command("b.0", PriceInstruction::Market)),
            Ok(Dispatch::Queued)
        );
        assert!(!gw.can_accept());
        assert_eq!(
            gw.submit(command("c.0", PriceInstruction::Market)),
            Err(BrokerError::NotConnected)
        );

        assert!(gw.dequeue(&ClientOrderId::new("a.0")).is_some());
        assert!(!gw.is_queued(&ClientOrderId::new("a.0")));
        assert_eq!(gw.queued(), 1);
    }

    #[tokio::test]
    async fn test_finish_reconciliation_releases_queue() {
        let broker = PaperBroker::new();
        broker.set_quote(
            "AAPL",
            Quote {
                bid: Some(dec!(99)),
                ask: Some(dec!(100)),
                last: None,
            },
        );
        let (mut gw, mut rx) = gateway(&broker, 5);
        gw.submit(command(
            "a.0",
            PriceInstruction::FromQuote {
                buffer_bps: dec!(10),
                fallback: None,
            },
        ))
        .unwrap();

        gw.connect();
        let GatewayEvent::ConnectCompleted(result) = next_gateway_event(&mut rx).await else {
            panic!("expected connect completion");
        };
        gw.on_connect_completed(result, Utc::now());

        let released = gw.finish_reconciliation();
        assert_eq!(released, vec![ClientOrderId::new("a.0")]);
        assert!(gw.is_connected());

        let GatewayEvent::SubmitCompleted {
            client_order_id,
            result,
        } = next_gateway_event(&mut rx).await
        else {
            panic!("expected submit completion");
        };
        assert_eq!(client_order_id.as_str(), "a.0");
        let ack = match result {
            Ok(ack) => ack,
            Err(e) => panic!("submit should succeed: {e}"),
        };
        assert_eq!(ack.limit_price, Some(dec!(100.10)));
    }

    #[tokio::test]
    async fn test_quote_pricing_without_reference_fails() {
        let broker = PaperBroker::new();
        let (mut gw, mut rx) = gateway(&broker, 5);
        gw.connect();
        let GatewayEvent::ConnectCompleted(result) = next_gateway_event(&mut rx).await else {
            panic!("expected connect completion");
        };
        gw.on_connect_completed(result, Utc::now());
        gw.finish_reconciliation();

        gw.submit(command(
            "a.0",
            PriceInstruction::FromQuote {
                buffer_bps: dec!(10),
                fallback: None,
            },
        ))
        .unwrap();
        let GatewayEvent::SubmitCompleted { result, .. } = next_gateway_event(&mut rx).await else {
            panic!("expected submit completion");
        };
        assert_eq!(
            result,
            Err(BrokerError::NoReferencePrice("AAPL".to_string()))
        );
    }

    #[tokio::test]
    async fn test_fetch_outlived_by_disconnect_is_stale() {
        let broker = PaperBroker::new();
        let (mut gw, mut rx) = gateway(&broker, 5);
        gw.submit(command("a.0", PriceInstruction::Market)).unwrap();
        gw.connect();
        let GatewayEvent::ConnectCompleted(result) = next_gateway_event(&mut rx).await else {
            panic!("expected connect completion");
        };
        gw.on_connect_completed(result, Utc::now());

        let epoch = gw.begin_reconciliation(Vec::new());
        let GatewayEvent::ReconcileFetched {
            epoch: fetched,
            result,
            ..
        } = next_gateway_event(&mut rx).await
        else {
            panic!("expected reconciliation fetch");
        };
        assert_eq!(fetched, epoch);
        assert!(result.is_ok());
        assert!(gw.is_current_reconciliation(fetched));

        gw.on_disconnected("connection reset");
        assert!(!gw.is_current_reconciliation(fetched));
        assert_eq!(gw.state(), ConnectionState::Disconnected);
        assert_eq!(gw.queued(), 1);

        // A later run supersedes the earlier one even once reconciling.
        gw.on_client_connected(Utc::now());
        let next = gw.begin_reconciliation(Vec::new());
        assert!(next > epoch);
        assert!(!gw.is_current_reconciliation(fetched));
        assert!(gw.is_current_reconciliation(next));
    }

    #[tokio::test]
    async fn test_fetch_includes_broker_positions() {
        let broker = PaperBroker::new();
        broker.set_position("AAPL", 25, dec!(100));
        let (mut gw, mut rx) = gateway(&broker, 5);
        gw.connect();
        let GatewayEvent::ConnectCompleted(result) = next_gateway_event(&mut rx).await else {
            panic!("expected connect completion");
        };
        gw.on_connect_completed(result, Utc::now());

        gw.begin_reconciliation(Vec::new());
        let GatewayEvent::ReconcileFetched { result, .. } = next_gateway_event(&mut rx).await else {
            panic!("expected reconciliation fetch");
        };
        let fetch = match result {
            Ok(fetch) => fetch,
            Err(e) => panic!("fetch should succeed: {e}"),
        };
        let positions = fetch.positions.expect("paper broker reports positions");
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 25);

        broker.set_positions_supported(false);
        gw.begin_reconciliation(Vec::new());
        let GatewayEvent::ReconcileFetched { result, .. } = next_gateway_event(&mut rx).await else {
            panic!("expected reconciliation fetch");
        };
        assert!(matches!(result, Ok(ReconcileFetch { positions: None, .. })));
    }

    #[tokio::test]
    async fn test_cancel_requires_connection() {
        let broker = PaperBroker::new();
        let (mut gw, _rx) = gateway(&broker, 5);
        assert_eq!(
            gw.cancel(ClientOrderId::new("a.0"), BrokerOrderId::new("1")),
            Err(BrokerError::NotConnected)
        );
    }
}
