//! Market session resolution.
//!
//! Maps an instant to a [`MarketSession`] and the [`OrderPolicy`] the engine
//! applies to new orders during that session. Resolution is a pure function
//! of the injected time; the [`Clock`] trait supplies "now" so tests can
//! drive the engine through sessions deterministically.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ConfigError, MarketHoursConfig, SessionTimes, TradingConfig};
use crate::models::OrderType;

// ============================================================================
// Clock
// ============================================================================

/// Source of the current time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and simulations.
///
/// Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Set the current instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = instant;
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Sessions and policies
// ============================================================================

/// Trading session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketSession {
    /// Before the regular open.
    PreMarket,
    /// Regular trading hours.
    Market,
    /// After the regular close.
    PostMarket,
    /// No trading (overnight and weekends).
    Closed,
}

impl MarketSession {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreMarket => "PRE_MARKET",
            Self::Market => "MARKET",
            Self::PostMarket => "POST_MARKET",
            Self::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for MarketSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How new orders are placed during a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderPolicy {
    /// Order type for new orders.
    pub order_type: OrderType,
    /// Whether unfilled orders are periodically repriced.
    pub resubmission_enabled: bool,
    /// Shortest resubmission interval.
    pub min_interval: Duration,
    /// Longest resubmission interval.
    pub max_interval: Duration,
}

impl OrderPolicy {
    /// Draw a per-order resubmission interval from the configured range.
    ///
    /// Returns zero when resubmission is disabled.
    pub fn draw_interval<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if !self.resubmission_enabled {
            return Duration::ZERO;
        }
        let min = self.min_interval.as_secs();
        let max = self.max_interval.as_secs().max(min);
        Duration::from_secs(rng.random_range(min..=max))
    }
}

/// Result of resolving an instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Session at the instant.
    pub session: MarketSession,
    /// Policy for new orders.
    pub order_policy: OrderPolicy,
}

/// Why no order may be placed right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionRejection {
    /// Market closed.
    #[error("market is closed")]
    Closed,
    /// Extended-hours session disabled by configuration.
    #[error("{0} trading is disabled")]
    Disabled(MarketSession),
}

// ============================================================================
// Resolver
// ============================================================================

/// Resolves sessions and order policies from configured boundaries.
#[derive(Debug, Clone)]
pub struct SessionResolver {
    times: SessionTimes,
    enable_pre_market: bool,
    enable_post_market: bool,
    min_interval: Duration,
    max_interval: Duration,
}

impl SessionResolver {
    /// Build a resolver from configuration.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the market hours cannot be parsed.
    pub fn from_config(
        hours: &MarketHoursConfig,
        trading: &TradingConfig,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            times: hours.parse()?,
            enable_pre_market: trading.enable_pre_market,
            enable_post_market: trading.enable_post_market,
            min_interval: Duration::from_secs(trading.resubmit_interval_min_secs),
            max_interval: Duration::from_secs(trading.resubmit_interval_max_secs),
        })
    }

    /// Exchange timezone.
    #[must_use]
    pub const fn timezone(&self) -> Tz {
        self.times.timezone
    }

    /// Session at `now`. Boundaries are half-open: `[start, end)`.
    #[must_use]
    pub fn session_at(&self, now: DateTime<Utc>) -> MarketSession {
        let local = now.with_timezone(&self.times.timezone);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return MarketSession::Closed;
        }
        self.session_for_time(local.time())
    }

    fn session_for_time(&self, time: NaiveTime) -> MarketSession {
        let t = &self.times;
        if time >= t.pre_market_start && time < t.market_open {
            MarketSession::PreMarket
        } else if time >= t.market_open && time < t.market_close {
            MarketSession::Market
        } else if time >= t.market_close && time < t.post_market_end {
            MarketSession::PostMarket
        } else {
            MarketSession::Closed
        }
    }

    /// Resolve the session at `now` and the policy for new orders.
    ///
    /// # Errors
    ///
    /// Returns `SessionRejection::Closed` outside trading hours and
    /// `SessionRejection::Disabled` for a disabled extended-hours session.
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<SessionPolicy, SessionRejection> {
        let session = self.session_at(now);
        let order_policy = match session {
            MarketSession::Closed => return Err(SessionRejection::Closed),
            MarketSession::PreMarket if !self.enable_pre_market => {
                return Err(SessionRejection::Disabled(session));
            }
            MarketSession::PostMarket if !self.enable_post_market => {
                return Err(SessionRejection::Disabled(session));
            }
            MarketSession::Market => OrderPolicy {
                order_type: OrderType::Market,
                resubmission_enabled: false,
                min_interval: Duration::ZERO,
                max_interval: Duration::ZERO,
            },
            MarketSession::PreMarket | MarketSession::PostMarket => OrderPolicy {
                order_type: OrderType::Limit,
                resubmission_enabled: true,
                min_interval: self.min_interval,
                max_interval: self.max_interval,
            },
        };
        Ok(SessionPolicy {
            session,
            order_policy,
        })
    }

    /// Next instant after `now` at which the session changes, and the
    /// session that starts there.
    #[must_use]
    pub fn next_change(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, MarketSession)> {
        let current = self.session_at(now);
        let tz = self.times.timezone;
        let today = now.with_timezone(&tz).date_naive();
        let boundaries = [
            self.times.pre_market_start,
            self.times.market_open,
            self.times.market_close,
            self.times.post_market_end,
        ];

        // A week always contains a trading day
        (0..=7_u64)
            .filter_map(|offset| today.checked_add_days(chrono::Days::new(offset)))
            .flat_map(|date| boundaries.iter().map(move |time| date.and_time(*time)))
            .filter_map(|local| tz.from_local_datetime(&local).earliest())
            .map(|instant| instant.with_timezone(&Utc))
            .filter(|instant| *instant > now)
            .map(|instant| (instant, self.session_at(instant)))
            .find(|(_, session)| *session != current)
    }
}
