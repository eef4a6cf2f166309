//! Trading engine.
//!
//! A single sequencer task owns every piece of mutable trading state: the
//! position ledger, the order supervisor and the broker gateway. Alerts and
//! operator commands reach it over a bounded command channel; broker events
//! and completions of gateway I/O arrive on an unbounded internal channel
//! and are always drained first, so an ack or fill is never processed after
//! a command issued later.
//!
//! Broker I/O never runs on the sequencer. The gateway spawns it and the
//! result comes back as a [`GatewayEvent`].

pub mod dedup;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::broker::gateway::{Dispatch, ReconnectSchedule};
use crate::broker::reconcile::{
    ReconcileCandidate, ReconcileFetch, position_mismatches, reconcile,
};
use crate::broker::{
    BrokerClient, BrokerConnection, BrokerEvent, BrokerGateway, ConnectionState, GatewayEvent,
};
use crate::config::Config;
use crate::error::EngineError;
use crate::execution::{OrderSupervisor, SupervisorEffect, SupervisorSettings, TimerAction};
use crate::ledger::{PositionLedger, PositionOverride};
use crate::models::{
    Alert, BrokerOrderId, ClientOrderId, NewOrder, Order, OrderId, OrderStatus, OrderType,
    Position, TradeAction,
};
use crate::notify::{Notification, Notifier};
use crate::observability::{
    record_alert, record_broker_disconnect, record_order_fill, record_order_submission,
    record_order_terminal, record_reconciliation, record_resubmission, record_time_to_fill,
    update_open_orders,
};
use crate::persistence::{PersistenceError, StateStore};
use crate::session::{Clock, MarketSession, SessionResolver};

use dedup::AlertDeduplicator;

// ============================================================================
// Public types
// ============================================================================

/// Input on the sequencer's internal channel.
#[derive(Debug)]
pub enum EngineEvent {
    /// Pushed by the broker client.
    Broker(BrokerEvent),
    /// Completion of gateway I/O.
    Gateway(GatewayEvent),
}

/// Result of an accepted alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertAck {
    /// Order created for the alert.
    pub order_id: OrderId,
    /// Symbol.
    pub symbol: String,
    /// Action.
    pub action: TradeAction,
    /// Quantity ordered.
    pub quantity: u64,
    /// Order type chosen for the session.
    pub order_type: OrderType,
    /// Session at acceptance.
    pub session: MarketSession,
    /// Held until the broker connection is restored.
    pub queued: bool,
}

/// Order counters since start.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrderStatistics {
    /// Orders created.
    pub placed: u64,
    /// Orders filled in full.
    pub filled: u64,
    /// Orders cancelled by the broker.
    pub cancelled: u64,
    /// Orders rejected.
    pub rejected: u64,
    /// Orders expired.
    pub expired: u64,
    /// Orders resolved as unknown.
    pub unknown: u64,
    /// Cancel-and-replace cycles.
    pub resubmitted: u64,
    /// Sum of creation-to-fill times of filled orders.
    pub total_time_to_fill_secs: f64,
}

impl OrderStatistics {
    /// Mean creation-to-fill time, if anything filled.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn average_time_to_fill_secs(&self) -> Option<f64> {
        (self.filled > 0).then(|| self.total_time_to_fill_secs / self.filled as f64)
    }
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    /// Broker connection.
    pub connection: BrokerConnection,
    /// Session at the snapshot instant.
    pub session: MarketSession,
    /// Every recorded position.
    pub positions: Vec<Position>,
    /// Live orders.
    pub open_orders: Vec<Order>,
    /// Submissions held for the broker.
    pub queued_submissions: usize,
    /// Counters.
    pub stats: OrderStatistics,
}

impl EngineSnapshot {
    /// Position for `symbol`, if recorded.
    #[must_use]
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.symbol == symbol)
    }

    /// Live order by id.
    #[must_use]
    pub fn order(&self, order_id: &OrderId) -> Option<&Order> {
        self.open_orders.iter().find(|o| &o.id == order_id)
    }
}

// ============================================================================
// Handle
// ============================================================================

enum Command {
    SubmitAlert {
        alert: Alert,
        reply: oneshot::Sender<Result<AlertAck, EngineError>>,
    },
    Tick,
    ForceTick {
        reply: oneshot::Sender<()>,
    },
    ClearSymbol {
        symbol: String,
        position: Option<PositionOverride>,
        reply: oneshot::Sender<Result<Position, EngineError>>,
    },
    Reconnect,
    Snapshot {
        reply: oneshot::Sender<EngineSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::SubmitAlert { .. } => "SubmitAlert",
            Self::Tick => "Tick",
            Self::ForceTick { .. } => "ForceTick",
            Self::ClearSymbol { .. } => "ClearSymbol",
            Self::Reconnect => "Reconnect",
            Self::Snapshot { .. } => "Snapshot",
            Self::Shutdown { .. } => "Shutdown",
        })
    }
}

impl EngineHandle {
    /// Submit a trading alert and wait for the engine's verdict.
    ///
    /// # Errors
    ///
    /// Returns the rejection reason, or `EngineUnavailable` if the engine
    /// has stopped.
    pub async fn submit_alert(&self, alert: Alert) -> Result<AlertAck, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SubmitAlert { alert, reply }).await?;
        rx.await.map_err(|_| stopped())?
    }

    /// Request a timer scan without waiting for it.
    ///
    /// Dropped if the command queue is full; the next tick covers it.
    pub fn tick(&self) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.commands.try_send(Command::Tick) {
            debug!("Tick skipped, command queue full");
        }
    }

    /// Run a timer scan and wait until it has been applied.
    ///
    /// # Errors
    ///
    /// Returns `EngineUnavailable` if the engine has stopped.
    pub async fn force_tick(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ForceTick { reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    /// Clear an operator lock on `symbol`, optionally replacing its
    /// position with the actual holding.
    ///
    /// # Errors
    ///
    /// Returns `UnknownSymbol` if nothing is recorded for the symbol, or
    /// `EngineUnavailable` if the engine has stopped.
    pub async fn clear_symbol(
        &self,
        symbol: impl Into<String>,
        position: Option<PositionOverride>,
    ) -> Result<Position, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ClearSymbol {
            symbol: symbol.into(),
            position,
            reply,
        })
        .await?;
        rx.await.map_err(|_| stopped())?
    }

    /// Reconnect to the broker with a fresh retry budget.
    ///
    /// # Errors
    ///
    /// Returns `EngineUnavailable` if the engine has stopped.
    pub async fn reconnect(&self) -> Result<(), EngineError> {
        self.send(Command::Reconnect).await
    }

    /// Current engine state.
    ///
    /// # Errors
    ///
    /// Returns `EngineUnavailable` if the engine has stopped.
    pub async fn snapshot(&self) -> Result<EngineSnapshot, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    /// Stop the engine and wait for it to persist its state.
    ///
    /// # Errors
    ///
    /// Returns `EngineUnavailable` if the engine had already stopped.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    async fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands.send(command).await.map_err(|_| stopped())
    }
}

fn stopped() -> EngineError {
    EngineError::engine_unavailable(0).with_context("reason", "engine stopped")
}

/// Drive periodic timer scans until the engine stops.
#[must_use]
pub fn spawn_ticker(handle: EngineHandle, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            if handle.commands.is_closed() {
                debug!("Engine stopped, ticker exiting");
                break;
            }
            handle.tick();
        }
    })
}

// ============================================================================
// Engine
// ============================================================================

/// The trading engine sequencer.
pub struct TradingEngine<B: BrokerClient> {
    config: Config,
    clock: Arc<dyn Clock>,
    resolver: SessionResolver,
    dedup: AlertDeduplicator,
    ledger: PositionLedger,
    supervisor: OrderSupervisor,
    gateway: BrokerGateway<B>,
    store: Box<dyn StateStore>,
    notifier: Arc<dyn Notifier>,
    stats: OrderStatistics,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    commands: mpsc::Receiver<Command>,
    restored_orders: usize,
    ever_connected: bool,
    fatal: Option<EngineError>,
}

impl<B: BrokerClient> std::fmt::Debug for TradingEngine<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingEngine")
            .field("name", &self.config.engine.name)
            .field("gateway", &self.gateway)
            .field("live_orders", &self.supervisor.live_count())
            .finish_non_exhaustive()
    }
}

impl<B: BrokerClient> TradingEngine<B> {
    /// Build an engine from persisted state.
    ///
    /// Positions reserved by an order that was not persisted are locked
    /// for the operator. Legs that were never sent are queued for the
    /// broker.
    ///
    /// # Errors
    ///
    /// Returns an error if the market hours are invalid or the state
    /// store cannot be read.
    pub fn new(
        config: &Config,
        client: Arc<B>,
        store: Box<dyn StateStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, EngineHandle), EngineError> {
        let resolver = SessionResolver::from_config(&config.market_hours, &config.trading)
            .map_err(|e| EngineError::internal(e.to_string()))?;
        let state = store.load()?;
        let now = clock.now();

        let (event_tx, events) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::channel(config.engine.event_queue_capacity.max(1));

        let mut supervisor = OrderSupervisor::new(SupervisorSettings::from_config(
            &config.trading,
            &config.broker,
        ));
        let restored_orders = state.orders.len();
        supervisor.restore(state.orders);

        let mut ledger = PositionLedger::from_positions(state.positions);
        let orphaned: Vec<(String, OrderId)> = ledger
            .positions()
            .filter_map(|p| {
                p.open_order_id
                    .as_ref()
                    .filter(|id| supervisor.get(id).is_none())
                    .map(|id| (p.symbol.clone(), id.clone()))
            })
            .collect();
        for (symbol, order_id) in orphaned {
            let position = ledger
                .lock(
                    &symbol,
                    format!("order {order_id} missing from storage after restart"),
                    now,
                )
                .clone();
            store.save_position(&position)?;
        }

        let mut gateway = BrokerGateway::new(client, &config.engine, &config.broker, event_tx);
        for leg in supervisor.unsent_legs() {
            if let Some(command) = supervisor.leg_command(&leg, &config.engine.account_id) {
                gateway.requeue(command);
            }
        }

        if restored_orders > 0 {
            info!(
                orders = restored_orders,
                queued = gateway.queued(),
                "Restored live orders from storage"
            );
        }

        let engine = Self {
            config: config.clone(),
            clock,
            resolver,
            dedup: AlertDeduplicator::new(config.trading.dedup_window()),
            ledger,
            supervisor,
            gateway,
            store,
            notifier,
            stats: OrderStatistics::default(),
            events,
            commands,
            restored_orders,
            ever_connected: false,
            fatal: None,
        };
        Ok((engine, EngineHandle { commands: command_tx }))
    }

    /// Run the sequencer until shutdown.
    ///
    /// # Errors
    ///
    /// Returns the storage error that stopped the engine.
    pub async fn run(mut self) -> Result<(), EngineError> {
        info!(
            name = %self.config.engine.name,
            account_id = %self.config.engine.account_id,
            "Trading engine starting"
        );
        self.notifier.notify(Notification::EngineStarted {
            name: self.config.engine.name.clone(),
            account_id: self.config.engine.account_id.clone(),
            restored_orders: self.restored_orders,
        });
        self.gateway.connect();

        loop {
            tokio::select! {
                biased;
                Some(event) = self.events.recv() => self.handle_event(event),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop().await;
                        let _ = reply.send(());
                        return Ok(());
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        info!("All engine handles dropped");
                        self.stop().await;
                        return Ok(());
                    }
                },
            }

            if let Some(error) = self.fatal.take() {
                error!(error = %error, "Trading engine stopped on fatal error");
                self.gateway.shutdown().await;
                return Err(error);
            }
        }
    }

    async fn stop(&mut self) {
        for order in self.supervisor.live_orders() {
            if let Err(e) = self.store.save_order(order) {
                error!(order_id = %order.id, error = %e, "Failed to persist order on shutdown");
            }
        }
        self.gateway.shutdown().await;
        let open_orders = self.supervisor.live_count();
        info!(open_orders, "Trading engine stopped");
        self.notifier.notify(Notification::EngineStopped {
            name: self.config.engine.name.clone(),
            open_orders,
        });
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SubmitAlert { alert, reply } => {
                let result = self.handle_alert(&alert);
                let _ = reply.send(result);
            }
            Command::Tick => self.on_tick(),
            Command::ForceTick { reply } => {
                self.on_tick();
                let _ = reply.send(());
            }
            Command::ClearSymbol {
                symbol,
                position,
                reply,
            } => {
                let result = self.clear_symbol(&symbol, position);
                let _ = reply.send(result);
            }
            Command::Reconnect => {
                info!("Operator requested broker reconnect");
                self.gateway.manual_reconnect();
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            // Handled by the run loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            connection: self.gateway.connection().clone(),
            session: self.resolver.session_at(self.clock.now()),
            positions: self.ledger.positions().cloned().collect(),
            open_orders: self.supervisor.live_orders().cloned().collect(),
            queued_submissions: self.gateway.queued(),
            stats: self.stats.clone(),
        }
    }

    // ========================================================================
    // Alerts
    // ========================================================================

    fn handle_alert(&mut self, alert: &Alert) -> Result<AlertAck, EngineError> {
        let now = self.clock.now();
        let result = self.accept_alert(alert, now);
        match &result {
            Ok(ack) => {
                record_alert("accepted");
                info!(
                    order_id = %ack.order_id,
                    symbol = %ack.symbol,
                    action = %ack.action,
                    quantity = ack.quantity,
                    order_type = ack.order_type.as_str(),
                    session = %ack.session,
                    queued = ack.queued,
                    "Alert accepted"
                );
            }
            Err(e) => {
                record_alert(e.code().reason());
                warn!(
                    symbol = %alert.symbol,
                    action = %alert.action,
                    code = %e.code(),
                    error = %e,
                    "Alert rejected"
                );
                self.notifier.notify(Notification::AlertRejected {
                    symbol: alert.symbol.clone(),
                    action: alert.action,
                    code: e.code(),
                    message: e.message().to_string(),
                });
            }
        }
        result
    }

    fn accept_alert(&mut self, alert: &Alert, now: DateTime<Utc>) -> Result<AlertAck, EngineError> {
        let key = alert.dedup_key();
        if self.dedup.is_duplicate(&key, now) {
            return Err(EngineError::duplicate_alert(&key));
        }

        let policy = self.resolver.resolve(now)?;
        let trading = &self.config.trading;
        if alert.action == TradeAction::Short && !trading.enable_short_selling {
            return Err(EngineError::short_selling_disabled(&alert.symbol));
        }

        let quantity = match alert.quantity {
            Some(quantity) => quantity,
            None if alert.action.opens_position() => trading.default_quantity,
            None => self.ledger.held_quantity(&alert.symbol),
        };
        if quantity > trading.max_position_size {
            return Err(EngineError::quantity_exceeds_limit(
                &alert.symbol,
                quantity,
                trading.max_position_size,
            ));
        }
        self.ledger.validate(&alert.symbol, alert.action, quantity)?;
        if !self.gateway.can_accept() {
            return Err(EngineError::engine_unavailable(self.gateway.queued()));
        }

        let order_id = OrderId::generate();
        let interval = policy.order_policy.draw_interval(&mut rand::rng());
        let position = self
            .ledger
            .apply(&alert.symbol, alert.action, quantity, &order_id, now)?
            .clone();
        self.dedup.record(&key, now);
        self.store
            .save_position(&position)
            .map_err(|e| self.storage_failed(e))?;

        let new_order = NewOrder {
            symbol: alert.symbol.clone(),
            action: alert.action,
            quantity,
            order_type: policy.order_policy.order_type,
            alert_price: alert.limit_price,
            resubmission_enabled: policy.order_policy.resubmission_enabled,
            resubmit_interval_secs: interval.as_secs(),
        };
        self.supervisor.open(order_id.clone(), new_order, now);

        let leg = order_id.leg(0);
        let command = self
            .supervisor
            .leg_command(&leg, &self.config.engine.account_id)
            .ok_or_else(|| EngineError::internal(format!("no first leg for order {order_id}")))?;
        let queued = match self.gateway.submit(command.clone()) {
            Ok(dispatch) => dispatch == Dispatch::Queued,
            Err(e) => {
                // The order is already reserved; hold it past the cap.
                warn!(order_id = %order_id, error = %e, "Submission queue full, holding leg");
                self.gateway.requeue(command);
                true
            }
        };
        if !queued {
            self.supervisor.mark_sent(&leg, now);
        }
        self.persist_order(&order_id);
        if let Some(error) = &self.fatal {
            return Err(error.clone());
        }

        self.stats.placed += 1;
        record_order_submission(policy.order_policy.order_type.as_str(), queued);
        update_open_orders(self.supervisor.live_count());
        self.notifier.notify(Notification::OrderSubmitted {
            order_id: order_id.clone(),
            symbol: alert.symbol.clone(),
            action: alert.action,
            quantity,
            order_type: policy.order_policy.order_type,
            session: policy.session,
            queued,
        });

        Ok(AlertAck {
            order_id,
            symbol: alert.symbol.clone(),
            action: alert.action,
            quantity,
            order_type: policy.order_policy.order_type,
            session: policy.session,
            queued,
        })
    }

    fn clear_symbol(
        &mut self,
        symbol: &str,
        position: Option<PositionOverride>,
    ) -> Result<Position, EngineError> {
        let now = self.clock.now();
        let position = self
            .ledger
            .clear_lock(symbol, position, now)
            .cloned()
            .ok_or_else(|| EngineError::unknown_symbol(symbol))?;
        self.store
            .save_position(&position)
            .map_err(|e| self.storage_failed(e))?;
        Ok(position)
    }

    // ========================================================================
    // Broker and gateway events
    // ========================================================================

    fn handle_event(&mut self, event: EngineEvent) {
        let now = self.clock.now();
        match event {
            EngineEvent::Broker(event) => self.on_broker_event(event, now),
            EngineEvent::Gateway(event) => self.on_gateway_event(event, now),
        }
        update_open_orders(self.supervisor.live_count());
    }

    fn on_broker_event(&mut self, event: BrokerEvent, now: DateTime<Utc>) {
        match &event {
            BrokerEvent::Connected => {
                if self.gateway.on_client_connected(now) {
                    self.start_reconciliation();
                }
            }
            BrokerEvent::Disconnected { reason } => self.on_connection_lost(reason),
            BrokerEvent::Error { code, message } => {
                warn!(code, message = %message, "Broker error");
            }
            BrokerEvent::OrderAck { .. }
            | BrokerEvent::OrderStatus { .. }
            | BrokerEvent::OrderFilled { .. }
            | BrokerEvent::OrderRejected { .. } => {
                let effects = self.supervisor.on_broker_event(&event, now);
                self.apply_effects(effects, now);
            }
        }
    }

    fn on_gateway_event(&mut self, event: GatewayEvent, now: DateTime<Utc>) {
        match event {
            GatewayEvent::ConnectCompleted(result) => {
                match self.gateway.on_connect_completed(result, now) {
                    None => self.start_reconciliation(),
                    Some(schedule) => self.on_reconnect_schedule(schedule),
                }
            }
            GatewayEvent::ReconnectDue => self.gateway.on_reconnect_due(),
            GatewayEvent::SubmitCompleted {
                client_order_id,
                result,
            } => {
                let effects = self
                    .supervisor
                    .on_submit_completed(&client_order_id, result, now);
                self.apply_effects(effects, now);
                self.persist_leg(&client_order_id);
            }
            GatewayEvent::CancelCompleted {
                client_order_id,
                result,
            } => {
                self.supervisor
                    .on_cancel_completed(&client_order_id, &result);
                self.persist_leg(&client_order_id);
            }
            GatewayEvent::ReconcileFetched {
                epoch,
                candidates,
                result,
            } => {
                if !self.gateway.is_current_reconciliation(epoch) {
                    debug!(
                        epoch,
                        state = %self.gateway.state(),
                        "Dropping reconciliation fetch from an earlier connection"
                    );
                    return;
                }
                match result {
                    Ok(fetch) => self.finish_reconciliation(&candidates, &fetch, now),
                    Err(e) => {
                        warn!(error = %e, "Reconciliation fetch failed");
                        let schedule = self.gateway.on_reconcile_failed(&e);
                        self.on_reconnect_schedule(schedule);
                    }
                }
            }
        }
    }

    fn on_connection_lost(&mut self, reason: &str) {
        let was = self.gateway.state();
        let schedule = self.gateway.on_disconnected(reason);
        if was != ConnectionState::Disconnected {
            record_broker_disconnect(self.gateway.connection().broker);
            self.notifier.notify(Notification::ConnectionLost {
                reason: reason.to_string(),
            });
        }
        self.on_reconnect_schedule(schedule);
    }

    fn on_reconnect_schedule(&self, schedule: ReconnectSchedule) {
        match schedule {
            ReconnectSchedule::Scheduled { attempt, delay } => {
                debug!(attempt, delay_secs = delay.as_secs(), "Reconnect pending");
            }
            ReconnectSchedule::AlreadyScheduled => {}
            ReconnectSchedule::Exhausted { attempts } => {
                error!(attempts, "Broker reconnect attempts exhausted");
                self.notifier
                    .notify(Notification::ReconnectExhausted { attempts });
            }
        }
    }

    fn start_reconciliation(&mut self) {
        let candidates = self.supervisor.reconcile_candidates();
        self.gateway.begin_reconciliation(candidates);
    }

    fn finish_reconciliation(
        &mut self,
        candidates: &[ReconcileCandidate],
        fetch: &ReconcileFetch,
        now: DateTime<Utc>,
    ) {
        let report = reconcile(candidates, fetch);
        let effects = self.supervisor.apply_reconciliation(&report, now);
        self.apply_effects(effects, now);

        let mismatches = fetch
            .positions
            .as_deref()
            .map(|broker| position_mismatches(self.ledger.positions(), broker))
            .unwrap_or_default();
        for mismatch in &mismatches {
            warn!(
                symbol = %mismatch.symbol,
                local = mismatch.local,
                broker = mismatch.broker,
                "Broker position differs from ledger"
            );
            self.lock_symbol(&mismatch.symbol, None, mismatch.describe(), now);
        }
        record_reconciliation(
            report.orders_compared,
            report.unknown_count() + report.orphans.len() + mismatches.len(),
        );

        for orphan in &report.orphans {
            warn!(
                broker_order_id = %orphan.broker_order_id,
                symbol = %orphan.symbol,
                "Open broker order not tracked by the engine"
            );
            self.notifier.notify(Notification::ReconciliationAnomaly {
                symbol: Some(orphan.symbol.clone()),
                order_id: None,
                detail: format!(
                    "untracked open broker order {} ({} {})",
                    orphan.broker_order_id,
                    orphan.side.as_str(),
                    orphan.quantity
                ),
            });
        }

        let released = self.gateway.finish_reconciliation();
        for leg in &released {
            self.supervisor.mark_sent(leg, now);
            self.persist_leg(leg);
        }

        info!(
            compared = report.orders_compared,
            released = released.len(),
            anomalies = report.has_anomalies() || !mismatches.is_empty(),
            "Broker reconciliation complete"
        );
        let reconciled = report.orders_compared;
        let released = released.len();
        if self.ever_connected {
            self.notifier.notify(Notification::ConnectionRestored {
                reconciled,
                released,
            });
        } else {
            self.ever_connected = true;
            self.notifier.notify(Notification::BrokerConnected {
                reconciled,
                released,
            });
        }
    }

    // ========================================================================
    // Supervisor effects
    // ========================================================================

    fn apply_effects(&mut self, effects: Vec<SupervisorEffect>, now: DateTime<Utc>) {
        for effect in effects {
            match effect {
                SupervisorEffect::Working(order_id) => self.persist_order(&order_id),
                SupervisorEffect::Fill {
                    order_id,
                    quantity,
                    avg_price,
                } => {
                    debug!(order_id = %order_id, quantity, avg_price = %avg_price, "Fill applied");
                    record_order_fill(quantity);
                    self.persist_order(&order_id);
                }
                SupervisorEffect::Terminal(order_id) => self.on_order_terminal(&order_id),
                SupervisorEffect::ReplaceReady(order_id) => self.resubmit(&order_id, now),
                SupervisorEffect::Requeue(leg) => self.requeue_leg(&leg),
                SupervisorEffect::LateFill {
                    order_id,
                    symbol,
                    quantity,
                } => {
                    let reason = format!(
                        "{quantity} shares reported for order {order_id} after it was resolved"
                    );
                    self.lock_symbol(&symbol, Some(order_id), reason, now);
                }
                SupervisorEffect::Unknown { order_id, reason } => {
                    self.on_order_unknown(&order_id, &reason, now);
                }
                SupervisorEffect::Unmatched {
                    client_order_id,
                    broker_order_id,
                } => {
                    warn!(
                        client_order_id = ?client_order_id.as_ref().map(ClientOrderId::as_str),
                        broker_order_id = ?broker_order_id.as_ref().map(BrokerOrderId::as_str),
                        "Broker event for an untracked order"
                    );
                }
            }
        }
    }

    fn on_order_terminal(&mut self, order_id: &OrderId) {
        let Some(order) = self.supervisor.get(order_id).cloned() else {
            return;
        };
        let completed_at = order.completed_at.unwrap_or_else(|| self.clock.now());
        if let Some(leg) = order.current_leg() {
            self.gateway.dequeue(&leg.client_order_id);
        }

        let position = self
            .ledger
            .finalize(
                &order.symbol,
                &order.id,
                order.action,
                order.filled_quantity,
                order.avg_fill_price,
                completed_at,
            )
            .cloned();
        if let Some(position) = position {
            self.save_position(&position);
        }
        self.persist_order(order_id);

        record_order_terminal(order.status.as_str());
        let notification = match order.status {
            OrderStatus::Filled => {
                let secs = (completed_at - order.created_at)
                    .to_std()
                    .unwrap_or_default()
                    .as_secs_f64();
                self.stats.filled += 1;
                self.stats.total_time_to_fill_secs += secs;
                record_time_to_fill(order.order_type.as_str(), secs);
                Notification::OrderFilled {
                    order_id: order.id.clone(),
                    symbol: order.symbol.clone(),
                    action: order.action,
                    quantity: order.filled_quantity,
                    avg_price: order.avg_fill_price,
                }
            }
            OrderStatus::Cancelled => {
                self.stats.cancelled += 1;
                Notification::OrderCancelled {
                    order_id: order.id.clone(),
                    symbol: order.symbol.clone(),
                    filled_quantity: order.filled_quantity,
                    reason: order.status_message.clone(),
                }
            }
            OrderStatus::Rejected => {
                self.stats.rejected += 1;
                Notification::OrderRejected {
                    order_id: order.id.clone(),
                    symbol: order.symbol.clone(),
                    reason: order.status_message.clone(),
                }
            }
            OrderStatus::Expired => {
                self.stats.expired += 1;
                Notification::OrderExpired {
                    order_id: order.id.clone(),
                    symbol: order.symbol.clone(),
                    filled_quantity: order.filled_quantity,
                    resubmit_count: order.resubmit_count,
                    reason: order.status_message.clone(),
                }
            }
            other => {
                warn!(order_id = %order.id, status = %other, "Unexpected terminal status");
                return;
            }
        };
        info!(
            order_id = %order.id,
            symbol = %order.symbol,
            status = %order.status,
            filled = order.filled_quantity,
            "Order complete"
        );
        self.notifier.notify(notification);
    }

    fn on_order_unknown(&mut self, order_id: &OrderId, reason: &str, now: DateTime<Utc>) {
        let Some(symbol) = self.supervisor.get(order_id).map(|o| o.symbol.clone()) else {
            return;
        };
        self.stats.unknown += 1;
        record_order_terminal(OrderStatus::UnknownTerminal.as_str());
        self.persist_order(order_id);
        self.lock_symbol(
            &symbol,
            Some(order_id.clone()),
            format!("outcome of order {order_id} unknown: {reason}"),
            now,
        );
    }

    fn lock_symbol(
        &mut self,
        symbol: &str,
        order_id: Option<OrderId>,
        reason: String,
        now: DateTime<Utc>,
    ) {
        let position = self.ledger.lock(symbol, reason.clone(), now).clone();
        self.save_position(&position);
        self.notifier.notify(Notification::ReconciliationAnomaly {
            symbol: Some(symbol.to_string()),
            order_id,
            detail: reason,
        });
    }

    fn resubmit(&mut self, order_id: &OrderId, now: DateTime<Utc>) {
        let Some(interval) = self
            .supervisor
            .get(order_id)
            .map(|o| o.resubmit_interval_secs)
        else {
            return;
        };
        let Some(leg) = self.supervisor.begin_replacement(order_id, interval, now) else {
            return;
        };
        self.dispatch_leg(&leg, now);
        self.persist_order(order_id);

        self.stats.resubmitted += 1;
        record_resubmission();
        if let Some(order) = self.supervisor.get(order_id) {
            info!(
                order_id = %order.id,
                leg = %leg,
                resubmit_count = order.resubmit_count,
                remaining = order.remaining_quantity(),
                "Order resubmitted"
            );
            self.notifier.notify(Notification::OrderResubmitted {
                order_id: order.id.clone(),
                symbol: order.symbol.clone(),
                resubmit_count: order.resubmit_count,
                remaining: order.remaining_quantity(),
            });
        }
    }

    /// Send a leg of an already accepted order, holding it while the
    /// broker is unreachable.
    fn dispatch_leg(&mut self, leg: &ClientOrderId, now: DateTime<Utc>) {
        let Some(command) = self
            .supervisor
            .leg_command(leg, &self.config.engine.account_id)
        else {
            return;
        };
        if self.gateway.is_connected() {
            if let Ok(Dispatch::Sent) = self.gateway.submit(command) {
                self.supervisor.mark_sent(leg, now);
            }
        } else {
            self.gateway.requeue(command);
        }
    }

    fn requeue_leg(&mut self, leg: &ClientOrderId) {
        let Some(command) = self
            .supervisor
            .leg_command(leg, &self.config.engine.account_id)
        else {
            return;
        };
        self.gateway.requeue(command);
        self.persist_leg(leg);
        // A connectivity failure while nominally connected means the
        // session is gone; reconnecting releases the held leg.
        if self.gateway.state() == ConnectionState::Connected {
            self.on_connection_lost("submission failed: broker unreachable");
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    fn on_tick(&mut self) {
        let now = self.clock.now();
        let actions = self.supervisor.scan(now, self.gateway.is_connected());
        for action in actions {
            match action {
                TimerAction::Cancel {
                    order_id,
                    client_order_id,
                    broker_order_id,
                    purpose,
                } => {
                    debug!(order_id = %order_id, purpose = ?purpose, "Requesting cancel");
                    match self.gateway.cancel(client_order_id.clone(), broker_order_id) {
                        Ok(()) => self.persist_order(&order_id),
                        Err(e) => {
                            self.supervisor
                                .on_cancel_completed(&client_order_id, &Err(e));
                        }
                    }
                }
                TimerAction::MarketOrderStale {
                    order_id,
                    symbol,
                    age,
                } => {
                    error!(
                        order_id = %order_id,
                        symbol = %symbol,
                        age_secs = age.as_secs(),
                        "MARKET order unfilled past its timeout"
                    );
                    self.persist_order(&order_id);
                    self.notifier.notify(Notification::MarketOrderStale {
                        order_id,
                        symbol,
                        age_secs: age.as_secs(),
                    });
                }
                TimerAction::ExpiredUnsent {
                    order_id,
                    client_order_id,
                } => {
                    self.gateway.dequeue(&client_order_id);
                    self.on_order_terminal(&order_id);
                }
                TimerAction::CancelUnconfirmed { order_id, reason } => {
                    self.on_order_unknown(&order_id, &reason, now);
                }
            }
        }
        update_open_orders(self.supervisor.live_count());
    }

    // ========================================================================
    // Storage
    // ========================================================================

    fn persist_order(&mut self, order_id: &OrderId) {
        let result = match self.supervisor.get(order_id) {
            Some(order) if !order.status.is_terminal() => self.store.save_order(order),
            Some(_) | None => self.store.delete_order(order_id),
        };
        if let Err(e) = result {
            self.storage_failed(e);
        }
    }

    fn persist_leg(&mut self, leg: &ClientOrderId) {
        if let Some(order_id) = leg.order_id() {
            self.persist_order(&order_id);
        }
    }

    fn save_position(&mut self, position: &Position) {
        if let Err(e) = self.store.save_position(position) {
            self.storage_failed(e);
        }
    }

    fn storage_failed(&mut self, error: PersistenceError) -> EngineError {
        let error = EngineError::from(error);
        error!(error = %error, "State store write failed");
        if self.fatal.is_none() {
            self.notifier.notify(Notification::Fatal {
                message: error.to_string(),
            });
            self.fatal = Some(error.clone());
        }
        error
    }
}
