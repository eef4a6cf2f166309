//! Error taxonomy for the trade engine.
//!
//! Every error surfaced by the engine carries an [`ErrorCode`]; each code
//! belongs to one [`ErrorKind`] that decides how the engine reacts.
//!
//! | Kind | Reaction |
//! |------|----------|
//! | `Validation` | Local reject, no broker call |
//! | `Submission` | Order REJECTED, reservation reverted |
//! | `Connectivity` | Recoverable; submissions queue up to a bounded depth |
//! | `ReconciliationAmbiguity` | `UNKNOWN_TERMINAL`, symbol locked until cleared |
//! | `ResubmissionExhausted` | Order EXPIRED, reverted, reported |
//! | `Storage` | Fatal: the sequencer stops |
//! | `Internal` | Unexpected condition, reported to the caller |

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::LedgerRejection;
use crate::models::AlertError;
use crate::persistence::PersistenceError;
use crate::session::SessionRejection;

/// How the engine reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Rejected locally before any broker call.
    Validation,
    /// Broker rejected the order or did not acknowledge it in time.
    Submission,
    /// Broker connection unavailable.
    Connectivity,
    /// Broker outcome of an order could not be determined.
    ReconciliationAmbiguity,
    /// Order gave up after the resubmission cap or the age limit.
    ResubmissionExhausted,
    /// Local durable storage failed.
    Storage,
    /// Unexpected internal condition.
    Internal,
}

/// Error codes for the trade engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors
    /// Alert could not be normalised.
    InvalidAlert,
    /// Alert replayed inside the de-duplication window.
    DuplicateAlert,
    /// Market is closed.
    SessionClosed,
    /// Extended-hours session disabled by configuration.
    SessionDisabled,
    /// Short selling disabled by configuration.
    ShortSellingDisabled,
    /// Closing action without a matching open position.
    NoPriorPosition,
    /// Opening action while a position is already held.
    PositionAlreadyOpen,
    /// Another order is changing the symbol's position.
    SymbolBusy,
    /// Close quantity larger than the held quantity.
    QuantityExceedsHeld,
    /// Quantity above the configured maximum position size.
    QuantityExceedsLimit,
    /// Zero quantity.
    InvalidQuantity,
    /// Symbol locked pending operator acknowledgement.
    SymbolLocked,
    /// Symbol has no recorded position.
    UnknownSymbol,

    // Submission errors
    /// Order rejected by broker.
    OrderRejected,
    /// Broker did not acknowledge the submission in time.
    AckTimeout,

    // Connectivity errors
    /// Broker unreachable and the submission queue is full.
    EngineUnavailable,
    /// Broker API error.
    BrokerApiError,

    // Reconciliation
    /// Broker outcome unknown after reconnection.
    UnknownTerminal,

    // Resubmission
    /// Resubmission cap or order age limit reached.
    ResubmissionExhausted,

    // Storage
    /// Durable state could not be read or written.
    StorageFailure,

    // Internal errors
    /// Order not found.
    OrderNotFound,
    /// Internal error.
    InternalError,
}

impl ErrorCode {
    /// Taxonomy kind of this code.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAlert
            | Self::DuplicateAlert
            | Self::SessionClosed
            | Self::SessionDisabled
            | Self::ShortSellingDisabled
            | Self::NoPriorPosition
            | Self::PositionAlreadyOpen
            | Self::SymbolBusy
            | Self::QuantityExceedsHeld
            | Self::QuantityExceedsLimit
            | Self::InvalidQuantity
            | Self::SymbolLocked
            | Self::UnknownSymbol => ErrorKind::Validation,

            Self::OrderRejected | Self::AckTimeout => ErrorKind::Submission,

            Self::EngineUnavailable | Self::BrokerApiError => ErrorKind::Connectivity,

            Self::UnknownTerminal => ErrorKind::ReconciliationAmbiguity,

            Self::ResubmissionExhausted => ErrorKind::ResubmissionExhausted,

            Self::StorageFailure => ErrorKind::Storage,

            Self::OrderNotFound | Self::InternalError => ErrorKind::Internal,
        }
    }

    /// Get the error reason string.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::InvalidAlert => "INVALID_ALERT",
            Self::DuplicateAlert => "DUPLICATE_ALERT",
            Self::SessionClosed => "SESSION_CLOSED",
            Self::SessionDisabled => "SESSION_DISABLED",
            Self::ShortSellingDisabled => "SHORT_SELLING_DISABLED",
            Self::NoPriorPosition => "NO_PRIOR_POSITION",
            Self::PositionAlreadyOpen => "POSITION_ALREADY_OPEN",
            Self::SymbolBusy => "SYMBOL_BUSY",
            Self::QuantityExceedsHeld => "QUANTITY_EXCEEDS_HELD",
            Self::QuantityExceedsLimit => "QUANTITY_EXCEEDS_LIMIT",
            Self::InvalidQuantity => "INVALID_QUANTITY",
            Self::SymbolLocked => "SYMBOL_LOCKED",
            Self::UnknownSymbol => "UNKNOWN_SYMBOL",
            Self::OrderRejected => "ORDER_REJECTED",
            Self::AckTimeout => "ACK_TIMEOUT",
            Self::EngineUnavailable => "ENGINE_UNAVAILABLE",
            Self::BrokerApiError => "BROKER_API_ERROR",
            Self::UnknownTerminal => "UNKNOWN_TERMINAL",
            Self::ResubmissionExhausted => "RESUBMISSION_EXHAUSTED",
            Self::StorageFailure => "STORAGE_FAILURE",
            Self::OrderNotFound => "ORDER_NOT_FOUND",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason())
    }
}

/// A rich error with context for the trade engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct EngineError {
    /// Error code.
    code: ErrorCode,
    /// Human-readable message.
    message: String,
    /// Additional context (key-value pairs).
    context: Vec<(String, String)>,
}

impl EngineError {
    /// Create a new engine error.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: Vec::new(),
        }
    }

    /// Add context to the error.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.push((key.into(), value.into()));
        self
    }

    /// Get the error code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the taxonomy kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.code.kind()
    }

    /// Get the message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the context.
    #[must_use]
    pub fn context(&self) -> &[(String, String)] {
        &self.context
    }

    /// Whether the engine must stop.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self.code.kind(), ErrorKind::Storage)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code.reason(), self.message)
    }
}

/// Convenience constructors for common errors.
impl EngineError {
    /// Alert replayed inside the de-duplication window.
    #[must_use]
    pub fn duplicate_alert(key: &str) -> Self {
        Self::new(
            ErrorCode::DuplicateAlert,
            "Alert already processed inside the de-duplication window",
        )
        .with_context("dedup_key", key)
    }

    /// Quantity above the configured maximum.
    #[must_use]
    pub fn quantity_exceeds_limit(symbol: &str, quantity: u64, limit: u64) -> Self {
        Self::new(
            ErrorCode::QuantityExceedsLimit,
            format!("Quantity {quantity} exceeds maximum position size {limit}"),
        )
        .with_context("symbol", symbol)
    }

    /// Short selling disabled.
    #[must_use]
    pub fn short_selling_disabled(symbol: &str) -> Self {
        Self::new(ErrorCode::ShortSellingDisabled, "Short selling is disabled")
            .with_context("symbol", symbol)
    }

    /// Broker unreachable and the submission queue is full.
    #[must_use]
    pub fn engine_unavailable(queued: usize) -> Self {
        Self::new(
            ErrorCode::EngineUnavailable,
            format!("Broker disconnected and {queued} submissions already queued"),
        )
    }

    /// Order not found.
    #[must_use]
    pub fn order_not_found(order_id: &str) -> Self {
        Self::new(
            ErrorCode::OrderNotFound,
            format!("Order {order_id} not found"),
        )
        .with_context("order_id", order_id)
    }

    /// Symbol with no recorded position.
    #[must_use]
    pub fn unknown_symbol(symbol: &str) -> Self {
        Self::new(
            ErrorCode::UnknownSymbol,
            format!("No position recorded for {symbol}"),
        )
        .with_context("symbol", symbol)
    }

    /// Internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl From<LedgerRejection> for EngineError {
    fn from(rejection: LedgerRejection) -> Self {
        let code = match &rejection {
            LedgerRejection::NoPriorPosition { .. } => ErrorCode::NoPriorPosition,
            LedgerRejection::PositionAlreadyOpen { .. } => ErrorCode::PositionAlreadyOpen,
            LedgerRejection::SymbolBusy { .. } => ErrorCode::SymbolBusy,
            LedgerRejection::QuantityExceedsHeld { .. } => ErrorCode::QuantityExceedsHeld,
            LedgerRejection::SymbolLocked { .. } => ErrorCode::SymbolLocked,
            LedgerRejection::InvalidQuantity { .. } => ErrorCode::InvalidQuantity,
        };
        Self::new(code, rejection.to_string()).with_context("symbol", rejection.symbol())
    }
}

impl From<SessionRejection> for EngineError {
    fn from(rejection: SessionRejection) -> Self {
        let code = match rejection {
            SessionRejection::Closed => ErrorCode::SessionClosed,
            SessionRejection::Disabled(_) => ErrorCode::SessionDisabled,
        };
        Self::new(code, rejection.to_string())
    }
}

impl From<AlertError> for EngineError {
    fn from(error: AlertError) -> Self {
        Self::new(ErrorCode::InvalidAlert, error.to_string())
    }
}

impl From<PersistenceError> for EngineError {
    fn from(error: PersistenceError) -> Self {
        Self::new(ErrorCode::StorageFailure, error.to_string())
    }
}
