//! Order supervisor.
//!
//! Owns every live order from creation to a terminal status. Broker events
//! are routed by submission leg (client order id first, broker id second),
//! fills are applied from cumulative quantities so duplicates are harmless,
//! and the periodic [`OrderSupervisor::scan`] drives resubmission and expiry
//! of resting LIMIT orders.
//!
//! Resubmission and expiry both go through a cancel request; only the
//! broker's cancel confirmation moves the order on, so an execution that
//! races the cancel is never lost.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::pricing::PriceInstruction;
use crate::broker::reconcile::{LegResolution, ReconciliationReport};
use crate::broker::{
    BrokerError, BrokerEvent, BrokerOrderSnapshot, BrokerOrderStatus, OrderRequest,
    ReconcileCandidate, SubmitCommand,
};
use crate::broker::gateway::SubmitAck;
use crate::config::{BrokerConfig, TradingConfig};
use crate::models::{
    BrokerOrderId, ClientOrderId, LegState, NewOrder, Order, OrderId, OrderStatus, OrderType,
    PendingAction,
};

/// Terminal orders kept for late-event detection.
const COMPLETED_HISTORY: usize = 1000;

/// Cancel requests per leg before its outcome is declared unknown.
pub const MAX_CANCEL_ATTEMPTS: u32 = 3;

/// Supervisor limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Resubmissions before a LIMIT order is expired.
    pub max_resubmissions: u32,
    /// Absolute LIMIT order age limit.
    pub order_timeout: Duration,
    /// Age after which an unfilled MARKET order is reported.
    pub market_order_timeout: Duration,
    /// Buffer applied to quote-derived limit prices, in basis points.
    pub limit_price_buffer_bps: Decimal,
    /// Wait for a cancel confirmation before asking again.
    pub cancel_timeout: Duration,
}

impl SupervisorSettings {
    /// Build settings from trading and broker configuration.
    #[must_use]
    pub const fn from_config(trading: &TradingConfig, broker: &BrokerConfig) -> Self {
        Self {
            max_resubmissions: trading.max_resubmissions,
            order_timeout: trading.order_timeout(),
            market_order_timeout: trading.market_order_timeout(),
            limit_price_buffer_bps: trading.limit_price_buffer_bps,
            cancel_timeout: broker.ack_timeout(),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&TradingConfig::default(), &BrokerConfig::default())
    }
}

/// State change produced by a supervisor input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEffect {
    /// Order acknowledged and resting.
    Working(OrderId),
    /// New execution on a live order.
    Fill {
        /// Order.
        order_id: OrderId,
        /// Quantity newly filled.
        quantity: u64,
        /// Average price of the leg after the execution.
        avg_price: Decimal,
    },
    /// Order reached a terminal status.
    Terminal(OrderId),
    /// Cancel for resubmission confirmed; the order awaits a new leg.
    ReplaceReady(OrderId),
    /// Leg failed to reach the broker and must be submitted again.
    Requeue(ClientOrderId),
    /// Execution reported for an order already resolved.
    LateFill {
        /// Order.
        order_id: OrderId,
        /// Symbol.
        symbol: String,
        /// Quantity newly reported.
        quantity: u64,
    },
    /// Order outcome could not be determined.
    Unknown {
        /// Order.
        order_id: OrderId,
        /// Why.
        reason: String,
    },
    /// Event for an order this supervisor does not track.
    Unmatched {
        /// Leg id, if reported.
        client_order_id: Option<ClientOrderId>,
        /// Broker id, if reported.
        broker_order_id: Option<BrokerOrderId>,
    },
}

/// Work requested by a supervisor scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerAction {
    /// Cancel a resting leg.
    Cancel {
        /// Order.
        order_id: OrderId,
        /// Leg to cancel.
        client_order_id: ClientOrderId,
        /// Broker id of the leg.
        broker_order_id: BrokerOrderId,
        /// What follows the confirmation.
        purpose: PendingAction,
    },
    /// MARKET order still unfilled after its timeout.
    MarketOrderStale {
        /// Order.
        order_id: OrderId,
        /// Symbol.
        symbol: String,
        /// Order age.
        age: Duration,
    },
    /// Order expired before it was ever sent.
    ExpiredUnsent {
        /// Order.
        order_id: OrderId,
        /// Held leg to drop from the submission queue.
        client_order_id: ClientOrderId,
    },
    /// Cancel never confirmed; the order was resolved as unknown.
    CancelUnconfirmed {
        /// Order.
        order_id: OrderId,
        /// Why.
        reason: String,
    },
}

/// Order supervisor.
#[derive(Debug, Default)]
pub struct OrderSupervisor {
    settings: SupervisorSettings,
    /// Orders indexed by engine id.
    orders: HashMap<OrderId, Order>,
    /// Leg id to order id.
    legs: HashMap<ClientOrderId, OrderId>,
    /// Broker id to leg id.
    broker_ids: HashMap<BrokerOrderId, ClientOrderId>,
    /// Terminal orders, oldest first.
    completed: VecDeque<OrderId>,
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

impl OrderSupervisor {
    /// Create an empty supervisor.
    #[must_use]
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    /// Order by id, live or recently completed.
    #[must_use]
    pub fn get(&self, order_id: &OrderId) -> Option<&Order> {
        self.orders.get(order_id)
    }

    /// Non-terminal orders.
    pub fn live_orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values().filter(|o| !o.status.is_terminal())
    }

    /// Number of non-terminal orders.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live_orders().count()
    }

    fn index(&mut self, order: &Order) {
        for leg in &order.legs {
            self.legs.insert(leg.client_order_id.clone(), order.id.clone());
            if let Some(broker_id) = &leg.broker_order_id {
                self.broker_ids
                    .insert(broker_id.clone(), leg.client_order_id.clone());
            }
        }
    }

    /// Create an order in `PENDING_SUBMIT`.
    pub fn open(&mut self, id: OrderId, new_order: NewOrder, now: DateTime<Utc>) -> &Order {
        let order = Order::new(id.clone(), new_order, now);
        self.index(&order);
        info!(
            order_id = %order.id,
            symbol = %order.symbol,
            action = %order.action,
            quantity = order.requested_quantity,
            order_type = order.order_type.as_str(),
            "Order created"
        );
        self.orders.entry(id).or_insert(order)
    }

    /// Adopt orders loaded from durable storage.
    pub fn restore(&mut self, orders: impl IntoIterator<Item = Order>) {
        for order in orders {
            if order.status.is_terminal() {
                continue;
            }
            self.index(&order);
            self.orders.insert(order.id.clone(), order);
        }
    }

    /// Current legs of live orders that were never handed to the broker.
    #[must_use]
    pub fn unsent_legs(&self) -> Vec<ClientOrderId> {
        self.live_orders()
            .filter_map(Order::current_leg)
            .filter(|leg| leg.state == LegState::Unsent)
            .map(|leg| leg.client_order_id.clone())
            .collect()
    }

    fn order_for_leg(&self, client_order_id: &ClientOrderId) -> Option<&Order> {
        self.legs
            .get(client_order_id)
            .and_then(|id| self.orders.get(id))
    }

    /// Submission for a leg, priced per the order's type and history.
    ///
    /// The first leg of a LIMIT order uses the alert price when one was
    /// given; later legs are priced from a fresh quote and fall back to the
    /// alert price, then the last submitted price.
    #[must_use]
    pub fn leg_command(&self, client_order_id: &ClientOrderId, account_id: &str) -> Option<SubmitCommand> {
        let order = self.order_for_leg(client_order_id)?;
        let leg = order.leg(client_order_id)?;
        let first_leg = order
            .legs
            .first()
            .is_some_and(|l| &l.client_order_id == client_order_id);

        let pricing = match order.order_type {
            OrderType::Market => PriceInstruction::Market,
            OrderType::Limit => match order.alert_price {
                Some(price) if first_leg => PriceInstruction::Fixed(price),
                alert_price => PriceInstruction::FromQuote {
                    buffer_bps: self.settings.limit_price_buffer_bps,
                    fallback: alert_price.or(order.limit_price),
                },
            },
        };

        Some(SubmitCommand {
            request: OrderRequest {
                client_order_id: leg.client_order_id.clone(),
                account_id: account_id.to_string(),
                symbol: order.symbol.clone(),
                side: order.side(),
                quantity: leg.quantity,
                order_type: order.order_type,
                limit_price: leg.limit_price,
                outside_rth: order.order_type == OrderType::Limit,
            },
            pricing,
        })
    }

    /// Record that a leg was handed to the broker.
    pub fn mark_sent(&mut self, client_order_id: &ClientOrderId, now: DateTime<Utc>) {
        let Some(order_id) = self.legs.get(client_order_id).cloned() else {
            return;
        };
        if let Some(leg) = self
            .orders
            .get_mut(&order_id)
            .and_then(|o| o.leg_mut(client_order_id))
        {
            leg.state = LegState::InFlight;
            leg.submitted_at = Some(now);
        }
    }

    // ========================================================================
    // Broker input
    // ========================================================================

    /// Apply the outcome of a submission.
    pub fn on_submit_completed(
        &mut self,
        client_order_id: &ClientOrderId,
        result: Result<SubmitAck, BrokerError>,
        now: DateTime<Utc>,
    ) -> Vec<SupervisorEffect> {
        let Some(order_id) = self.legs.get(client_order_id).cloned() else {
            return vec![SupervisorEffect::Unmatched {
                client_order_id: Some(client_order_id.clone()),
                broker_order_id: None,
            }];
        };

        match result {
            Ok(ack) => {
                if let Some(leg) = self
                    .orders
                    .get_mut(&order_id)
                    .and_then(|o| o.leg_mut(client_order_id))
                {
                    leg.limit_price = ack.limit_price;
                }
                if let Some(order) = self.orders.get_mut(&order_id) {
                    if order.is_current_leg(client_order_id) && ack.limit_price.is_some() {
                        order.limit_price = ack.limit_price;
                    }
                }
                self.on_ack(client_order_id, &ack.broker_order_id)
            }
            Err(error) => {
                let Some(order) = self.orders.get_mut(&order_id) else {
                    return Vec::new();
                };
                if order.status.is_terminal() || !order.is_current_leg(client_order_id) {
                    return Vec::new();
                }
                if error.is_connectivity() {
                    if let Some(leg) = order.leg_mut(client_order_id) {
                        leg.state = LegState::Unsent;
                        leg.submitted_at = None;
                    }
                    debug!(client_order_id = %client_order_id, error = %error, "Submission requeued");
                    return vec![SupervisorEffect::Requeue(client_order_id.clone())];
                }
                warn!(
                    order_id = %order_id,
                    client_order_id = %client_order_id,
                    error = %error,
                    "Submission failed"
                );
                order.complete(OrderStatus::Rejected, error.to_string(), now);
                self.record_completed(&order_id);
                vec![SupervisorEffect::Terminal(order_id)]
            }
        }
    }

    /// Apply a submission acknowledgement.
    pub fn on_ack(
        &mut self,
        client_order_id: &ClientOrderId,
        broker_order_id: &BrokerOrderId,
    ) -> Vec<SupervisorEffect> {
        let Some(order_id) = self.legs.get(client_order_id).cloned() else {
            return vec![SupervisorEffect::Unmatched {
                client_order_id: Some(client_order_id.clone()),
                broker_order_id: Some(broker_order_id.clone()),
            }];
        };
        self.broker_ids
            .insert(broker_order_id.clone(), client_order_id.clone());

        let Some(order) = self.orders.get_mut(&order_id) else {
            return Vec::new();
        };
        let current = order.is_current_leg(client_order_id);
        let Some(leg) = order.leg_mut(client_order_id) else {
            return Vec::new();
        };
        leg.broker_order_id = Some(broker_order_id.clone());
        if matches!(leg.state, LegState::Unsent | LegState::InFlight) {
            leg.state = LegState::Working;
        }

        if order.status.is_terminal() || !current {
            return Vec::new();
        }
        order.broker_order_id = Some(broker_order_id.clone());
        if order.status == OrderStatus::PendingSubmit {
            order.status = if order.filled_quantity > 0 {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Working
            };
            debug!(order_id = %order_id, broker_order_id = %broker_order_id, "Order acknowledged");
            return vec![SupervisorEffect::Working(order_id)];
        }
        Vec::new()
    }

    fn locate(
        &self,
        client_order_id: Option<&ClientOrderId>,
        broker_order_id: Option<&BrokerOrderId>,
    ) -> Option<(OrderId, ClientOrderId)> {
        let client_order_id = client_order_id
            .filter(|id| self.legs.contains_key(*id))
            .cloned()
            .or_else(|| broker_order_id.and_then(|b| self.broker_ids.get(b).cloned()))?;
        let order_id = self.legs.get(&client_order_id)?.clone();
        Some((order_id, client_order_id))
    }

    /// Apply a broker callback.
    pub fn on_broker_event(&mut self, event: &BrokerEvent, now: DateTime<Utc>) -> Vec<SupervisorEffect> {
        match event {
            BrokerEvent::OrderAck {
                client_order_id,
                broker_order_id,
            } => self.on_ack(client_order_id, broker_order_id),
            BrokerEvent::OrderStatus {
                client_order_id,
                broker_order_id,
                status,
                filled_quantity,
                avg_fill_price,
                message,
            } => self.route(
                client_order_id.as_ref(),
                Some(broker_order_id),
                |this, order_id, leg_id| {
                    this.apply_status(
                        &order_id,
                        &leg_id,
                        *status,
                        *filled_quantity,
                        *avg_fill_price,
                        message.as_deref(),
                        now,
                    )
                },
            ),
            BrokerEvent::OrderFilled {
                client_order_id,
                broker_order_id,
                cumulative_quantity,
                avg_fill_price,
                ..
            } => self.route(
                client_order_id.as_ref(),
                Some(broker_order_id),
                |this, order_id, leg_id| {
                    this.apply_fill(&order_id, &leg_id, *cumulative_quantity, *avg_fill_price, now)
                },
            ),
            BrokerEvent::OrderRejected {
                client_order_id,
                broker_order_id,
                reason,
            } => self.route(
                client_order_id.as_ref(),
                broker_order_id.as_ref(),
                |this, order_id, leg_id| this.apply_reject(&order_id, &leg_id, reason, now),
            ),
            BrokerEvent::Connected | BrokerEvent::Disconnected { .. } | BrokerEvent::Error { .. } => {
                Vec::new()
            }
        }
    }

    fn route(
        &mut self,
        client_order_id: Option<&ClientOrderId>,
        broker_order_id: Option<&BrokerOrderId>,
        apply: impl FnOnce(&mut Self, OrderId, ClientOrderId) -> Vec<SupervisorEffect>,
    ) -> Vec<SupervisorEffect> {
        match self.locate(client_order_id, broker_order_id) {
            Some((order_id, leg_id)) => {
                if let Some(broker_id) = broker_order_id {
                    self.broker_ids.insert(broker_id.clone(), leg_id.clone());
                }
                apply(self, order_id, leg_id)
            }
            None => vec![SupervisorEffect::Unmatched {
                client_order_id: client_order_id.cloned(),
                broker_order_id: broker_order_id.cloned(),
            }],
        }
    }

    /// Apply a cumulative fill to a leg. Reports late fills on resolved
    /// orders.
    fn apply_fill(
        &mut self,
        order_id: &OrderId,
        client_order_id: &ClientOrderId,
        cumulative_quantity: u64,
        avg_fill_price: Decimal,
        now: DateTime<Utc>,
    ) -> Vec<SupervisorEffect> {
        let Some(order) = self.orders.get_mut(order_id) else {
            return Vec::new();
        };
        let was_terminal = order.status.is_terminal();
        let newly_filled = order.apply_leg_fill(client_order_id, cumulative_quantity, avg_fill_price);
        if newly_filled == 0 {
            return Vec::new();
        }

        if was_terminal {
            warn!(
                order_id = %order_id,
                symbol = %order.symbol,
                status = %order.status,
                quantity = newly_filled,
                "Execution reported for resolved order"
            );
            return vec![SupervisorEffect::LateFill {
                order_id: order_id.clone(),
                symbol: order.symbol.clone(),
                quantity: newly_filled,
            }];
        }

        info!(
            order_id = %order_id,
            symbol = %order.symbol,
            quantity = newly_filled,
            filled = order.filled_quantity,
            requested = order.requested_quantity,
            "Order fill"
        );
        let mut effects = vec![SupervisorEffect::Fill {
            order_id: order_id.clone(),
            quantity: newly_filled,
            avg_price: avg_fill_price,
        }];

        if order.remaining_quantity() == 0 {
            order.complete(OrderStatus::Filled, "filled", now);
            self.record_completed(order_id);
            effects.push(SupervisorEffect::Terminal(order_id.clone()));
        } else if order.status != OrderStatus::PendingSubmit {
            order.status = OrderStatus::PartiallyFilled;
        }
        effects
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_status(
        &mut self,
        order_id: &OrderId,
        client_order_id: &ClientOrderId,
        status: BrokerOrderStatus,
        filled_quantity: u64,
        avg_fill_price: Decimal,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Vec<SupervisorEffect> {
        let mut effects = self.apply_fill(order_id, client_order_id, filled_quantity, avg_fill_price, now);

        let Some(order) = self.orders.get_mut(order_id) else {
            return effects;
        };
        if order.status.is_terminal() {
            return effects;
        }
        let current = order.is_current_leg(client_order_id);
        let Some(leg) = order.leg_mut(client_order_id) else {
            return effects;
        };

        match status {
            BrokerOrderStatus::Submitted | BrokerOrderStatus::PartiallyFilled => {
                if matches!(leg.state, LegState::Unsent | LegState::InFlight) {
                    leg.state = LegState::Working;
                }
                if current && order.status == OrderStatus::PendingSubmit {
                    order.status = if order.filled_quantity > 0 {
                        OrderStatus::PartiallyFilled
                    } else {
                        OrderStatus::Working
                    };
                    effects.push(SupervisorEffect::Working(order_id.clone()));
                }
            }
            BrokerOrderStatus::Filled => {
                leg.state = LegState::Done;
            }
            BrokerOrderStatus::Cancelled | BrokerOrderStatus::Expired => {
                leg.state = LegState::Done;
                if !current {
                    return effects;
                }
                let reason = message.unwrap_or_default();
                let pending = order.pending_action;
                match pending {
                    Some(PendingAction::Replace) => {
                        info!(order_id = %order_id, "Cancel confirmed, ready to resubmit");
                        effects.push(SupervisorEffect::ReplaceReady(order_id.clone()));
                    }
                    Some(PendingAction::Expire) => {
                        order.complete(
                            OrderStatus::Expired,
                            format!(
                                "expired after {} resubmissions",
                                order.resubmit_count
                            ),
                            now,
                        );
                        self.record_completed(order_id);
                        effects.push(SupervisorEffect::Terminal(order_id.clone()));
                    }
                    None => {
                        let terminal = if status == BrokerOrderStatus::Expired {
                            OrderStatus::Expired
                        } else {
                            OrderStatus::Cancelled
                        };
                        order.complete(terminal, reason, now);
                        self.record_completed(order_id);
                        effects.push(SupervisorEffect::Terminal(order_id.clone()));
                    }
                }
            }
            BrokerOrderStatus::Rejected => {
                leg.state = LegState::Done;
                if current {
                    order.complete(OrderStatus::Rejected, message.unwrap_or("rejected"), now);
                    self.record_completed(order_id);
                    effects.push(SupervisorEffect::Terminal(order_id.clone()));
                }
            }
        }
        effects
    }

    fn apply_reject(
        &mut self,
        order_id: &OrderId,
        client_order_id: &ClientOrderId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Vec<SupervisorEffect> {
        let Some(order) = self.orders.get_mut(order_id) else {
            return Vec::new();
        };
        if order.status.is_terminal() || !order.is_current_leg(client_order_id) {
            return Vec::new();
        }
        warn!(order_id = %order_id, reason = %reason, "Order rejected by broker");
        order.complete(OrderStatus::Rejected, reason, now);
        self.record_completed(order_id);
        vec![SupervisorEffect::Terminal(order_id.clone())]
    }

    /// Handle the outcome of a cancel request. A failed request leaves the
    /// leg working so the next scan can try again.
    pub fn on_cancel_completed(&mut self, client_order_id: &ClientOrderId, result: &Result<(), BrokerError>) {
        let Err(error) = result else {
            return;
        };
        let Some(order_id) = self.legs.get(client_order_id).cloned() else {
            return;
        };
        let Some(order) = self.orders.get_mut(&order_id) else {
            return;
        };
        if order.status.is_terminal() {
            return;
        }
        warn!(order_id = %order_id, error = %error, "Cancel request failed");
        order.pending_action = None;
        if let Some(leg) = order.leg_mut(client_order_id) {
            if leg.state == LegState::CancelRequested {
                leg.resume_working();
            }
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Evaluate every live order against its timers.
    ///
    /// Elapsed time is measured from the order's last action, so a delayed
    /// scan acts as soon as it runs. Cancels are only requested while
    /// `connected`. A cancel left unconfirmed past the cancel timeout is
    /// requested again, up to [`MAX_CANCEL_ATTEMPTS`] times, after which
    /// the order is resolved as `UNKNOWN_TERMINAL`.
    pub fn scan(&mut self, now: DateTime<Utc>, connected: bool) -> Vec<TimerAction> {
        let settings = self.settings;
        let mut ids: Vec<(DateTime<Utc>, OrderId)> = self
            .live_orders()
            .map(|o| (o.created_at, o.id.clone()))
            .collect();
        ids.sort();

        let mut actions = Vec::new();
        for (_, order_id) in ids {
            let Some(order) = self.orders.get_mut(&order_id) else {
                continue;
            };
            let age = elapsed(order.created_at, now);

            if order.order_type == OrderType::Market {
                if !order.stale_reported && age >= settings.market_order_timeout {
                    order.stale_reported = true;
                    actions.push(TimerAction::MarketOrderStale {
                        order_id: order_id.clone(),
                        symbol: order.symbol.clone(),
                        age,
                    });
                }
                continue;
            }

            let Some(leg) = order.current_leg() else {
                continue;
            };

            if leg.state == LegState::Unsent {
                if age >= settings.order_timeout {
                    let client_order_id = leg.client_order_id.clone();
                    order.complete(OrderStatus::Expired, "expired before submission", now);
                    self.record_completed(&order_id);
                    actions.push(TimerAction::ExpiredUnsent {
                        order_id,
                        client_order_id,
                    });
                }
                continue;
            }

            if !connected {
                continue;
            }
            if leg.state == LegState::CancelRequested {
                let Some(purpose) = order.pending_action else {
                    continue;
                };
                // A leg restored without a request time is due now.
                let waited = leg
                    .cancel_requested_at
                    .map_or(settings.cancel_timeout, |at| elapsed(at, now));
                if waited < settings.cancel_timeout {
                    continue;
                }
                let attempts = leg.cancel_attempts;
                let client_order_id = leg.client_order_id.clone();
                match leg.broker_order_id.clone() {
                    Some(broker_order_id) if attempts < MAX_CANCEL_ATTEMPTS => {
                        warn!(
                            order_id = %order_id,
                            attempts,
                            purpose = ?purpose,
                            "Cancel unconfirmed, requesting again"
                        );
                        if let Some(leg) = order.current_leg_mut() {
                            leg.request_cancel(now);
                        }
                        actions.push(TimerAction::Cancel {
                            order_id,
                            client_order_id,
                            broker_order_id,
                            purpose,
                        });
                    }
                    _ => {
                        let reason = format!("cancel unconfirmed after {attempts} requests");
                        if self.mark_unknown(&order_id, &reason, now) {
                            actions.push(TimerAction::CancelUnconfirmed { order_id, reason });
                        }
                    }
                }
                continue;
            }
            if leg.state != LegState::Working || order.pending_action.is_some() {
                continue;
            }
            let Some(broker_order_id) = leg.broker_order_id.clone() else {
                continue;
            };
            let client_order_id = leg.client_order_id.clone();

            let since = elapsed(order.last_action_at(), now);
            let interval_due = since >= Duration::from_secs(order.resubmit_interval_secs);
            let purpose = if age >= settings.order_timeout
                || (order.resubmit_count >= settings.max_resubmissions && interval_due)
            {
                PendingAction::Expire
            } else if order.resubmission_enabled && interval_due {
                PendingAction::Replace
            } else {
                continue;
            };

            info!(
                order_id = %order_id,
                symbol = %order.symbol,
                resubmit_count = order.resubmit_count,
                age_secs = age.as_secs(),
                purpose = ?purpose,
                "Cancelling resting order"
            );
            order.pending_action = Some(purpose);
            if let Some(leg) = order.current_leg_mut() {
                leg.request_cancel(now);
            }
            actions.push(TimerAction::Cancel {
                order_id,
                client_order_id,
                broker_order_id,
                purpose,
            });
        }
        actions
    }

    /// Start the next leg of an order whose cancel for resubmission was
    /// confirmed. Returns the new leg id.
    pub fn begin_replacement(
        &mut self,
        order_id: &OrderId,
        interval_secs: u64,
        now: DateTime<Utc>,
    ) -> Option<ClientOrderId> {
        let order = self.orders.get_mut(order_id)?;
        if order.status.is_terminal() || order.pending_action != Some(PendingAction::Replace) {
            return None;
        }
        order.pending_action = None;
        order.resubmit_count += 1;
        order.last_resubmit_at = Some(now);
        order.resubmit_interval_secs = interval_secs;
        let client_order_id = order.push_leg().client_order_id.clone();
        info!(
            order_id = %order_id,
            client_order_id = %client_order_id,
            resubmit_count = order.resubmit_count,
            remaining = order.remaining_quantity(),
            "Order resubmission"
        );
        self.legs.insert(client_order_id.clone(), order_id.clone());
        Some(client_order_id)
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Legs the broker may hold for live orders.
    #[must_use]
    pub fn reconcile_candidates(&self) -> Vec<ReconcileCandidate> {
        self.live_orders()
            .filter_map(Order::current_leg)
            .filter(|leg| {
                matches!(
                    leg.state,
                    LegState::InFlight | LegState::Working | LegState::CancelRequested
                )
            })
            .map(|leg| ReconcileCandidate {
                client_order_id: leg.client_order_id.clone(),
                broker_order_id: leg.broker_order_id.clone(),
            })
            .collect()
    }

    fn adopt(&mut self, candidate: &ReconcileCandidate, snapshot: &BrokerOrderSnapshot) {
        self.broker_ids.insert(
            snapshot.broker_order_id.clone(),
            candidate.client_order_id.clone(),
        );
        let Some(order_id) = self.legs.get(&candidate.client_order_id).cloned() else {
            return;
        };
        if let Some(order) = self.orders.get_mut(&order_id) {
            if let Some(leg) = order.leg_mut(&candidate.client_order_id) {
                leg.broker_order_id = Some(snapshot.broker_order_id.clone());
            }
            if order.is_current_leg(&candidate.client_order_id) {
                order.broker_order_id = Some(snapshot.broker_order_id.clone());
            }
        }
    }

    /// Apply the outcome of a reconciliation run.
    pub fn apply_reconciliation(
        &mut self,
        report: &ReconciliationReport,
        now: DateTime<Utc>,
    ) -> Vec<SupervisorEffect> {
        let mut effects = Vec::new();
        for (candidate, resolution) in &report.resolutions {
            let Some(order_id) = self.legs.get(&candidate.client_order_id).cloned() else {
                continue;
            };
            match resolution {
                LegResolution::Open(snapshot) => {
                    self.adopt(candidate, snapshot);
                    // A cancel that is still open at the broker was lost.
                    if let Some(order) = self.orders.get_mut(&order_id) {
                        if let Some(leg) = order.leg_mut(&candidate.client_order_id) {
                            if leg.state == LegState::CancelRequested {
                                leg.resume_working();
                                order.pending_action = None;
                            }
                        }
                    }
                    effects.extend(self.apply_status(
                        &order_id,
                        &candidate.client_order_id,
                        snapshot.status,
                        snapshot.filled_quantity,
                        snapshot.avg_fill_price,
                        None,
                        now,
                    ));
                }
                LegResolution::Closed(snapshot) => {
                    self.adopt(candidate, snapshot);
                    effects.extend(self.apply_status(
                        &order_id,
                        &candidate.client_order_id,
                        snapshot.status,
                        snapshot.filled_quantity,
                        snapshot.avg_fill_price,
                        Some("closed while disconnected"),
                        now,
                    ));
                }
                LegResolution::NeverReceived => {
                    if let Some(leg) = self
                        .orders
                        .get_mut(&order_id)
                        .and_then(|o| o.leg_mut(&candidate.client_order_id))
                    {
                        leg.state = LegState::Unsent;
                        leg.submitted_at = None;
                    }
                    effects.push(SupervisorEffect::Requeue(candidate.client_order_id.clone()));
                }
                LegResolution::Unknown(reason) => {
                    if self.mark_unknown(&order_id, reason, now) {
                        effects.push(SupervisorEffect::Unknown {
                            order_id,
                            reason: reason.clone(),
                        });
                    }
                }
            }
        }
        effects
    }

    /// Resolve an order as `UNKNOWN_TERMINAL`. Returns false if the order is
    /// unknown or already terminal.
    pub fn mark_unknown(&mut self, order_id: &OrderId, reason: &str, now: DateTime<Utc>) -> bool {
        let Some(order) = self.orders.get_mut(order_id) else {
            return false;
        };
        if order.status.is_terminal() {
            return false;
        }
        warn!(order_id = %order_id, symbol = %order.symbol, reason = %reason, "Order outcome unknown");
        order.complete(OrderStatus::UnknownTerminal, reason, now);
        self.record_completed(order_id);
        true
    }

    fn record_completed(&mut self, order_id: &OrderId) {
        self.completed.push_back(order_id.clone());
        while self.completed.len() > COMPLETED_HISTORY {
            let Some(evicted) = self.completed.pop_front() else {
                break;
            };
            if let Some(order) = self.orders.remove(&evicted) {
                for leg in &order.legs {
                    self.legs.remove(&leg.client_order_id);
                    if let Some(broker_id) = &leg.broker_order_id {
                        self.broker_ids.remove(broker_id);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::reconcile::reconcile;
    use crate::broker::ReconcileFetch;
    use crate::models::TradeAction;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 4, 12, 0, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::TimeDelta {
        chrono::TimeDelta::seconds(n)
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            max_resubmissions: 2,
            order_timeout: Duration::from_secs(1800),
            market_order_timeout: Duration::from_secs(30),
            limit_price_buffer_bps: dec!(10),
            cancel_timeout: Duration::from_secs(30),
        }
    }

    fn limit_request(quantity: u64) -> NewOrder {
        NewOrder {
            symbol: "TSLA".to_string(),
            action: TradeAction::Short,
            quantity,
            order_type: OrderType::Limit,
            alert_price: None,
            resubmission_enabled: true,
            resubmit_interval_secs: 200,
        }
    }

    fn market_request(quantity: u64) -> NewOrder {
        NewOrder {
            symbol: "AAPL".to_string(),
            action: TradeAction::Buy,
            quantity,
            order_type: OrderType::Market,
            alert_price: None,
            resubmission_enabled: false,
            resubmit_interval_secs: 0,
        }
    }

    fn ack(broker: &str, price: Option<Decimal>) -> Result<SubmitAck, BrokerError> {
        Ok(SubmitAck {
            broker_order_id: BrokerOrderId::new(broker),
            limit_price: price,
        })
    }

    /// Open an order, send its first leg and acknowledge it.
    fn working(sup: &mut OrderSupervisor, new_order: NewOrder) -> (OrderId, ClientOrderId) {
        let id = OrderId::new("ord");
        sup.open(id.clone(), new_order, t0());
        let leg = id.leg(0);
        sup.mark_sent(&leg, t0());
        let effects = sup.on_submit_completed(&leg, ack("B1", Some(dec!(250))), t0());
        assert_eq!(effects, vec![SupervisorEffect::Working(id.clone())]);
        (id, leg)
    }

    fn status(
        leg: &ClientOrderId,
        broker: &str,
        status: BrokerOrderStatus,
        filled: u64,
    ) -> BrokerEvent {
        BrokerEvent::OrderStatus {
            client_order_id: Some(leg.clone()),
            broker_order_id: BrokerOrderId::new(broker),
            status,
            filled_quantity: filled,
            avg_fill_price: if filled > 0 { dec!(250) } else { Decimal::ZERO },
            message: None,
        }
    }

    fn fill(leg: Option<&ClientOrderId>, broker: &str, cumulative: u64) -> BrokerEvent {
        BrokerEvent::OrderFilled {
            client_order_id: leg.cloned(),
            broker_order_id: BrokerOrderId::new(broker),
            last_quantity: cumulative,
            last_price: dec!(250),
            cumulative_quantity: cumulative,
            avg_fill_price: dec!(250),
        }
    }

    #[test]
    fn test_market_fill_is_terminal_once() {
        let mut sup = OrderSupervisor::new(settings());
        let (id, leg) = working(&mut sup, market_request(100));

        let effects = sup.on_broker_event(&fill(Some(&leg), "B1", 100), t0());
        assert!(effects.contains(&SupervisorEffect::Terminal(id.clone())));
        assert_eq!(sup.get(&id).unwrap().status, OrderStatus::Filled);

        // Duplicate delivery changes nothing.
        assert!(sup.on_broker_event(&fill(Some(&leg), "B1", 100), t0()).is_empty());
        assert!(
            sup.on_broker_event(&status(&leg, "B1", BrokerOrderStatus::Filled, 100), t0())
                .is_empty()
        );
    }

    #[test]
    fn test_fill_routed_by_broker_id() {
        let mut sup = OrderSupervisor::new(settings());
        let (id, _) = working(&mut sup, market_request(100));

        let effects = sup.on_broker_event(&fill(None, "B1", 40), t0());
        assert_eq!(
            effects,
            vec![SupervisorEffect::Fill {
                order_id: id.clone(),
                quantity: 40,
                avg_price: dec!(250),
            }]
        );
        assert_eq!(sup.get(&id).unwrap().status, OrderStatus::PartiallyFilled);
    }

    #[test]
    fn test_fill_before_ack_is_routed() {
        let mut sup = OrderSupervisor::new(settings());
        let id = OrderId::new("ord");
        sup.open(id.clone(), market_request(10), t0());
        let leg = id.leg(0);
        sup.mark_sent(&leg, t0());

        let effects = sup.on_broker_event(&fill(Some(&leg), "B7", 10), t0());
        assert!(effects.contains(&SupervisorEffect::Terminal(id.clone())));
        // The acknowledgement that follows is harmless.
        assert!(sup.on_submit_completed(&leg, ack("B7", None), t0()).is_empty());
    }

    #[test]
    fn test_unknown_events_are_unmatched() {
        let mut sup = OrderSupervisor::new(settings());
        let effects = sup.on_broker_event(&fill(None, "X", 1), t0());
        assert!(matches!(effects[0], SupervisorEffect::Unmatched { .. }));
    }

    #[test]
    fn test_connectivity_failure_requeues_other_failure_rejects() {
        let mut sup = OrderSupervisor::new(settings());
        let id = OrderId::new("ord");
        sup.open(id.clone(), market_request(10), t0());
        let leg = id.leg(0);
        sup.mark_sent(&leg, t0());

        let effects = sup.on_submit_completed(&leg, Err(BrokerError::NotConnected), t0());
        assert_eq!(effects, vec![SupervisorEffect::Requeue(leg.clone())]);
        assert_eq!(sup.unsent_legs(), vec![leg.clone()]);

        sup.mark_sent(&leg, t0());
        let effects = sup.on_submit_completed(
            &leg,
            Err(BrokerError::Timeout {
                operation: "submit",
                secs: 10,
            }),
            t0(),
        );
        assert_eq!(effects, vec![SupervisorEffect::Terminal(id.clone())]);
        assert_eq!(sup.get(&id).unwrap().status, OrderStatus::Rejected);
    }

    #[test]
    fn test_resubmission_cycle_keeps_id_and_remaining() {
        let mut sup = OrderSupervisor::new(settings());
        let (id, leg) = working(&mut sup, limit_request(50));
        sup.on_broker_event(&fill(Some(&leg), "B1", 20), t0());

        assert!(sup.scan(t0() + secs(199), true).is_empty());
        let actions = sup.scan(t0() + secs(200), true);
        assert!(matches!(
            actions.as_slice(),
            [TimerAction::Cancel { purpose: PendingAction::Replace, .. }]
        ));
        // Pending cancel is not requested twice inside the cancel timeout.
        assert!(sup.scan(t0() + secs(229), true).is_empty());

        let effects =
            sup.on_broker_event(&status(&leg, "B1", BrokerOrderStatus::Cancelled, 20), t0() + secs(201));
        assert_eq!(effects, vec![SupervisorEffect::ReplaceReady(id.clone())]);

        let next = sup.begin_replacement(&id, 240, t0() + secs(201)).unwrap();
        assert_eq!(next, id.leg(1));
        let order = sup.get(&id).unwrap();
        assert_eq!(order.id, id);
        assert_eq!(order.resubmit_count, 1);
        assert_eq!(order.current_leg().unwrap().quantity, 30);

        let command = sup.leg_command(&next, "DU1").unwrap();
        assert_eq!(command.request.quantity, 30);
        assert_eq!(
            command.pricing,
            PriceInstruction::FromQuote {
                buffer_bps: dec!(10),
                fallback: Some(dec!(250)),
            }
        );
    }

    #[test]
    fn test_expiry_after_max_resubmissions() {
        let mut sup = OrderSupervisor::new(settings());
        let (id, mut leg) = working(&mut sup, limit_request(50));
        let mut now = t0();

        for n in 0..2 {
            now += secs(200);
            let actions = sup.scan(now, true);
            assert!(matches!(
                actions.as_slice(),
                [TimerAction::Cancel { purpose: PendingAction::Replace, .. }]
            ));
            let broker = format!("B{}", n + 1);
            sup.on_broker_event(&status(&leg, &broker, BrokerOrderStatus::Cancelled, 0), now);
            leg = sup.begin_replacement(&id, 200, now).unwrap();
            sup.mark_sent(&leg, now);
            sup.on_submit_completed(&leg, ack(&format!("B{}", n + 2), Some(dec!(251))), now);
        }

        now += secs(200);
        let actions = sup.scan(now, true);
        assert!(matches!(
            actions.as_slice(),
            [TimerAction::Cancel { purpose: PendingAction::Expire, .. }]
        ));
        let effects = sup.on_broker_event(&status(&leg, "B3", BrokerOrderStatus::Cancelled, 0), now);
        assert_eq!(effects, vec![SupervisorEffect::Terminal(id.clone())]);
        let order = sup.get(&id).unwrap();
        assert_eq!(order.status, OrderStatus::Expired);
        assert_eq!(order.resubmit_count, 2);
    }

    #[test]
    fn test_unconfirmed_cancel_is_requested_again_then_unknown() {
        let mut sup = OrderSupervisor::new(settings());
        let (id, leg) = working(&mut sup, limit_request(50));
        let cancel_at = t0() + secs(200);

        let actions = sup.scan(cancel_at, true);
        assert!(matches!(
            actions.as_slice(),
            [TimerAction::Cancel { purpose: PendingAction::Replace, .. }]
        ));
        // Accepted by the broker, but no confirmation ever arrives.
        sup.on_cancel_completed(&leg, &Ok(()));

        let mut now = cancel_at;
        for attempt in 2..=MAX_CANCEL_ATTEMPTS {
            assert!(sup.scan(now + secs(29), true).is_empty());
            now += secs(30);
            let actions = sup.scan(now, true);
            assert!(
                matches!(
                    actions.as_slice(),
                    [TimerAction::Cancel { purpose: PendingAction::Replace, .. }]
                ),
                "attempt {attempt} should re-send the cancel"
            );
            sup.on_cancel_completed(&leg, &Ok(()));
            let order = sup.get(&id).unwrap();
            assert_eq!(order.current_leg().unwrap().cancel_attempts, attempt);
        }

        now += secs(30);
        let actions = sup.scan(now, true);
        assert_eq!(
            actions,
            vec![TimerAction::CancelUnconfirmed {
                order_id: id.clone(),
                reason: format!("cancel unconfirmed after {MAX_CANCEL_ATTEMPTS} requests"),
            }]
        );
        let order = sup.get(&id).unwrap();
        assert_eq!(order.status, OrderStatus::UnknownTerminal);
        assert_eq!(sup.live_count(), 0);

        // A confirmation arriving afterwards does not revive the order.
        let effects =
            sup.on_broker_event(&status(&leg, "B1", BrokerOrderStatus::Cancelled, 0), now);
        assert!(!effects.contains(&SupervisorEffect::ReplaceReady(id.clone())));
        assert!(sup.scan(now + secs(600), true).is_empty());
    }

    #[test]
    fn test_unconfirmed_cancel_waits_for_connection() {
        let mut sup = OrderSupervisor::new(settings());
        let (id, _) = working(&mut sup, limit_request(50));
        assert_eq!(sup.scan(t0() + secs(200), true).len(), 1);

        assert!(sup.scan(t0() + secs(500), false).is_empty());
        assert_eq!(sup.get(&id).unwrap().status, OrderStatus::Working);
        assert_eq!(sup.scan(t0() + secs(500), true).len(), 1);
    }

    #[test]
    fn test_failed_cancel_resets_attempts() {
        let mut sup = OrderSupervisor::new(settings());
        let (id, leg) = working(&mut sup, limit_request(50));
        assert_eq!(sup.scan(t0() + secs(200), true).len(), 1);

        sup.on_cancel_completed(
            &leg,
            &Err(BrokerError::Timeout {
                operation: "cancel",
                secs: 10,
            }),
        );
        let order = sup.get(&id).unwrap();
        let current = order.current_leg().unwrap();
        assert_eq!(order.pending_action, None);
        assert_eq!(current.state, LegState::Working);
        assert_eq!(current.cancel_attempts, 0);
        assert_eq!(current.cancel_requested_at, None);

        // The next scan asks again from a fresh budget.
        let actions = sup.scan(t0() + secs(201), true);
        assert!(matches!(actions.as_slice(), [TimerAction::Cancel { .. }]));
        assert_eq!(sup.get(&id).unwrap().current_leg().unwrap().cancel_attempts, 1);
    }

    #[test]
    fn test_fill_racing_expiry_cancel_wins() {
        let mut sup = OrderSupervisor::new(settings());
        let (id, leg) = working(&mut sup, limit_request(50));

        let actions = sup.scan(t0() + secs(1800), true);
        assert!(matches!(
            actions.as_slice(),
            [TimerAction::Cancel { purpose: PendingAction::Expire, .. }]
        ));
        let effects = sup.on_broker_event(&fill(Some(&leg), "B1", 50), t0() + secs(1801));
        assert!(effects.contains(&SupervisorEffect::Terminal(id.clone())));
        assert_eq!(sup.get(&id).unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn test_late_fill_on_rejected_order() {
        let mut sup = OrderSupervisor::new(settings());
        let id = OrderId::new("ord");
        sup.open(id.clone(), market_request(10), t0());
        let leg = id.leg(0);
        sup.mark_sent(&leg, t0());
        sup.on_submit_completed(
            &leg,
            Err(BrokerError::Timeout {
                operation: "submit",
                secs: 10,
            }),
            t0(),
        );

        let effects = sup.on_broker_event(&fill(Some(&leg), "B1", 10), t0());
        assert_eq!(
            effects,
            vec![SupervisorEffect::LateFill {
                order_id: id,
                symbol: "AAPL".to_string(),
                quantity: 10,
            }]
        );
    }

    #[test]
    fn test_scan_without_connection_defers_cancels() {
        let mut sup = OrderSupervisor::new(settings());
        working(&mut sup, limit_request(50));
        assert!(sup.scan(t0() + secs(400), false).is_empty());
        assert_eq!(sup.scan(t0() + secs(400), true).len(), 1);
    }

    #[test]
    fn test_stale_market_order_reported_once() {
        let mut sup = OrderSupervisor::new(settings());
        working(&mut sup, market_request(10));
        assert!(sup.scan(t0() + secs(10), true).is_empty());
        assert!(matches!(
            sup.scan(t0() + secs(30), true).as_slice(),
            [TimerAction::MarketOrderStale { .. }]
        ));
        assert!(sup.scan(t0() + secs(90), true).is_empty());
    }

    #[test]
    fn test_unsent_order_expires() {
        let mut sup = OrderSupervisor::new(settings());
        let id = OrderId::new("ord");
        sup.open(id.clone(), limit_request(5), t0());
        let actions = sup.scan(t0() + secs(1800), false);
        assert_eq!(
            actions,
            vec![TimerAction::ExpiredUnsent {
                order_id: id.clone(),
                client_order_id: id.leg(0),
            }]
        );
        assert_eq!(sup.get(&id).unwrap().status, OrderStatus::Expired);
    }

    #[test]
    fn test_reconciliation_outcomes() {
        let mut sup = OrderSupervisor::new(settings());
        let (filled_id, filled_leg) = working(&mut sup, limit_request(50));

        let lost_id = OrderId::new("lost");
        sup.open(lost_id.clone(), market_request(5), t0());
        sup.mark_sent(&lost_id.leg(0), t0());

        let candidates = sup.reconcile_candidates();
        assert_eq!(candidates.len(), 2);

        let fetch = ReconcileFetch {
            open_orders: Vec::new(),
            history: HashMap::from([
                (
                    filled_leg.clone(),
                    crate::broker::HistoryLookup::Found(BrokerOrderSnapshot {
                        client_order_id: filled_leg.clone(),
                        broker_order_id: BrokerOrderId::new("B1"),
                        symbol: "TSLA".to_string(),
                        side: crate::models::OrderSide::Sell,
                        quantity: 50,
                        filled_quantity: 50,
                        avg_fill_price: dec!(250),
                        status: BrokerOrderStatus::Filled,
                    }),
                ),
                (lost_id.leg(0), crate::broker::HistoryLookup::NotFound),
            ]),
            positions: None,
        };
        let report = reconcile(&candidates, &fetch);
        let effects = sup.apply_reconciliation(&report, t0());

        assert!(effects.contains(&SupervisorEffect::Terminal(filled_id.clone())));
        assert!(effects.contains(&SupervisorEffect::Requeue(lost_id.leg(0))));
        assert_eq!(sup.get(&filled_id).unwrap().status, OrderStatus::Filled);
        assert_eq!(sup.live_count(), 1);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Advance(i64),
        Scan { connected: bool },
        CancelAccepted,
        CancelFailed,
        Confirm,
        PartialFill(u64),
    }

    fn step_strategy() -> impl Strategy<Value = Step> {
        prop_oneof![
            (1_i64..120).prop_map(Step::Advance),
            any::<bool>().prop_map(|connected| Step::Scan { connected }),
            Just(Step::CancelAccepted),
            Just(Step::CancelFailed),
            Just(Step::Confirm),
            (1_u64..10).prop_map(Step::PartialFill),
        ]
    }

    proptest! {
        #[test]
        fn prop_outstanding_cancel_always_resolves(steps in prop::collection::vec(step_strategy(), 1..80)) {
            let mut sup = OrderSupervisor::new(settings());
            let (id, _) = working(&mut sup, limit_request(50));
            let mut now = t0();
            let mut broker_seq = 1_u32;

            for step in steps {
                let Some(order) = sup.get(&id).filter(|o| !o.status.is_terminal()) else {
                    break;
                };
                let current = order.current_leg().unwrap().clone();
                let broker = format!("B{broker_seq}");
                match step {
                    Step::Advance(n) => now += secs(n),
                    Step::Scan { connected } => {
                        sup.scan(now, connected);
                    }
                    Step::CancelAccepted => sup.on_cancel_completed(&current.client_order_id, &Ok(())),
                    Step::CancelFailed => sup.on_cancel_completed(
                        &current.client_order_id,
                        &Err(BrokerError::Connection("reset".to_string())),
                    ),
                    Step::Confirm if current.state == LegState::CancelRequested => {
                        let effects = sup.on_broker_event(
                            &status(&current.client_order_id, &broker, BrokerOrderStatus::Cancelled, current.filled_quantity),
                            now,
                        );
                        if effects.contains(&SupervisorEffect::ReplaceReady(id.clone())) {
                            let leg = sup.begin_replacement(&id, 200, now).unwrap();
                            broker_seq += 1;
                            sup.mark_sent(&leg, now);
                            sup.on_submit_completed(&leg, ack(&format!("B{broker_seq}"), Some(dec!(250))), now);
                        }
                    }
                    Step::Confirm => {}
                    Step::PartialFill(qty) => {
                        let cumulative = (current.filled_quantity + qty).min(current.quantity - 1);
                        sup.on_broker_event(&fill(Some(&current.client_order_id), &broker, cumulative), now);
                    }
                }

                if let Some(order) = sup.get(&id).filter(|o| !o.status.is_terminal()) {
                    let leg = order.current_leg().unwrap();
                    prop_assert_eq!(
                        leg.state == LegState::CancelRequested,
                        order.pending_action.is_some()
                    );
                    prop_assert!(leg.cancel_attempts <= MAX_CANCEL_ATTEMPTS);
                }
            }

            // With the connection up and no confirmation, every outstanding
            // cancel ends within a bounded number of timeouts.
            for _ in 0..=MAX_CANCEL_ATTEMPTS + 1 {
                let Some(order) = sup.get(&id).filter(|o| !o.status.is_terminal()) else {
                    break;
                };
                if order.pending_action.is_none() {
                    break;
                }
                now += secs(30);
                sup.scan(now, true);
            }
            let order = sup.get(&id).unwrap();
            prop_assert!(order.status.is_terminal() || order.pending_action.is_none());
        }
    }
}
