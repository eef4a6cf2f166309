// Allow unwrap/expect in tests - tests should panic on unexpected errors
// Allow test-specific patterns and pedantic lints in test code
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Trade Engine - alert-driven order execution core.
//!
//! Turns trading alerts (`BUY`, `SELL`, `SHORT`, `COVER`) into broker orders
//! and supervises them until they resolve.
//!
//! # Layout
//!
//! - `session`: market session resolution and per-session order policy
//! - `ledger`: per-symbol position state machine and reservations
//! - `execution`: order supervision (fills, expiry, resubmission) and
//!   limit pricing
//! - `broker`: the broker client abstraction, the connection-owning
//!   gateway, reconciliation and a paper broker
//! - `engine`: the single-writer sequencer tying it together
//! - `persistence`: durable positions and live orders
//! - `notify`: operator notifications
//! - `observability`: metrics and log output

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

/// Broker client abstraction and connection gateway.
pub mod broker;

/// Configuration loading and validation.
pub mod config;

/// Trading engine sequencer and handle.
pub mod engine;

/// Error taxonomy.
pub mod error;

/// Order supervision and pricing.
pub mod execution;

/// Position ledger.
pub mod ledger;

/// Domain models.
pub mod models;

/// Operator notifications.
pub mod notify;

/// Metrics and tracing.
pub mod observability;

/// Durable state.
pub mod persistence;

/// Market sessions.
pub mod session;

// =============================================================================
// Re-exports
// =============================================================================

pub use broker::{BrokerClient, BrokerError, BrokerEvent, PaperBroker, Quote};
pub use config::{Config, ConfigError, load_config, load_config_from_string};
pub use engine::{
    AlertAck, EngineHandle, EngineSnapshot, OrderStatistics, TradingEngine, spawn_ticker,
};
pub use error::{EngineError, ErrorCode, ErrorKind};
pub use ledger::{LedgerRejection, PositionLedger, PositionOverride};
pub use models::{
    Alert, Order, OrderId, OrderStatus, OrderType, Position, PositionState, RawAlert, TradeAction,
};
pub use notify::{ChannelNotifier, Notification, Notifier, TracingNotifier};
pub use persistence::{InMemoryStateStore, SqliteStateStore, StateStore};
pub use session::{Clock, ManualClock, MarketSession, SessionResolver, SystemClock};
