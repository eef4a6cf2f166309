//! Reconciliation of locally tracked legs against the broker after a
//! reconnect.
//!
//! The gateway fetches the broker's open orders and, for every tracked leg
//! missing from that set, its historical status. [`reconcile`] then decides
//! per leg what happened while the connection was down, and
//! [`position_mismatches`] compares the broker's net holdings with the
//! ledger.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use super::{BrokerOrderSnapshot, BrokerPosition};
use crate::models::{BrokerOrderId, ClientOrderId, Position};

/// A leg the engine believes may be live at the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileCandidate {
    /// Engine leg id.
    pub client_order_id: ClientOrderId,
    /// Broker id, if the submission was acknowledged.
    pub broker_order_id: Option<BrokerOrderId>,
}

/// Outcome of a historical lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum HistoryLookup {
    /// Broker has a record of the order.
    Found(BrokerOrderSnapshot),
    /// Broker has no record of the order.
    NotFound,
    /// History could not be queried.
    Unavailable(String),
}

/// Broker state gathered by the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileFetch {
    /// Orders open at the broker.
    pub open_orders: Vec<BrokerOrderSnapshot>,
    /// History for candidates absent from `open_orders`.
    pub history: HashMap<ClientOrderId, HistoryLookup>,
    /// Net broker positions; `None` if the broker cannot report them.
    pub positions: Option<Vec<BrokerPosition>>,
}

/// What happened to one leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LegResolution {
    /// Still open at the broker.
    Open(BrokerOrderSnapshot),
    /// Reached a terminal status at the broker.
    Closed(BrokerOrderSnapshot),
    /// Broker never received the submission; safe to send again.
    NeverReceived,
    /// Outcome cannot be determined.
    Unknown(String),
}

/// Result of a reconciliation run.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    /// Per-leg outcome.
    pub resolutions: Vec<(ReconcileCandidate, LegResolution)>,
    /// Open broker orders the engine does not track.
    pub orphans: Vec<BrokerOrderSnapshot>,
    /// Number of legs compared.
    pub orders_compared: usize,
}

impl ReconciliationReport {
    /// Number of legs whose outcome is unknown.
    #[must_use]
    pub fn unknown_count(&self) -> usize {
        self.resolutions
            .iter()
            .filter(|(_, r)| matches!(r, LegResolution::Unknown(_)))
            .count()
    }

    /// Whether anything needs operator attention.
    #[must_use]
    pub fn has_anomalies(&self) -> bool {
        self.unknown_count() > 0 || !self.orphans.is_empty()
    }
}

/// A symbol whose ledger holding disagrees with the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PositionMismatch {
    /// Ticker symbol.
    pub symbol: String,
    /// Signed ledger quantity.
    pub local: i64,
    /// Signed broker quantity.
    pub broker: i64,
}

impl PositionMismatch {
    /// Operator-facing description.
    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "broker holds {} shares of {} but the ledger records {}",
            self.broker, self.symbol, self.local
        )
    }
}

fn matches_candidate(snapshot: &BrokerOrderSnapshot, candidate: &ReconcileCandidate) -> bool {
    snapshot.client_order_id == candidate.client_order_id
        || candidate.broker_order_id.as_ref() == Some(&snapshot.broker_order_id)
}

/// Candidates that need a historical lookup because they are not open.
#[must_use]
pub fn absent_candidates<'a>(
    candidates: &'a [ReconcileCandidate],
    open_orders: &[BrokerOrderSnapshot],
) -> Vec<&'a ReconcileCandidate> {
    candidates
        .iter()
        .filter(|c| !open_orders.iter().any(|o| matches_candidate(o, c)))
        .collect()
}

/// Decide the outcome of every candidate leg.
#[must_use]
pub fn reconcile(candidates: &[ReconcileCandidate], fetch: &ReconcileFetch) -> ReconciliationReport {
    let mut matched: HashSet<&BrokerOrderId> = HashSet::new();
    let mut resolutions = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let open = fetch
            .open_orders
            .iter()
            .find(|o| matches_candidate(o, candidate));

        let resolution = if let Some(snapshot) = open {
            matched.insert(&snapshot.broker_order_id);
            LegResolution::Open(snapshot.clone())
        } else {
            match fetch.history.get(&candidate.client_order_id) {
                Some(HistoryLookup::Found(snapshot)) if snapshot.status.is_terminal() => {
                    LegResolution::Closed(snapshot.clone())
                }
                Some(HistoryLookup::Found(snapshot)) => LegResolution::Open(snapshot.clone()),
                Some(HistoryLookup::NotFound) if candidate.broker_order_id.is_none() => {
                    LegResolution::NeverReceived
                }
                Some(HistoryLookup::NotFound) => LegResolution::Unknown(
                    "acknowledged order has no broker record".to_string(),
                ),
                Some(HistoryLookup::Unavailable(reason)) => LegResolution::Unknown(reason.clone()),
                None => LegResolution::Unknown("no broker history available".to_string()),
            }
        };
        resolutions.push((candidate.clone(), resolution));
    }

    let orphans = fetch
        .open_orders
        .iter()
        .filter(|o| !matched.contains(&o.broker_order_id))
        .cloned()
        .collect();

    ReconciliationReport {
        resolutions,
        orphans,
        orders_compared: candidates.len(),
    }
}

/// Symbols whose settled ledger holding differs from the broker's.
///
/// Symbols with an order in flight or an existing lock are skipped; their
/// ledger entry is not expected to be settled yet. A symbol held at the
/// broker with no ledger entry is a mismatch.
#[must_use]
pub fn position_mismatches<'a>(
    ledger: impl IntoIterator<Item = &'a Position>,
    broker: &[BrokerPosition],
) -> Vec<PositionMismatch> {
    let held: HashMap<&str, i64> = broker
        .iter()
        .map(|p| (p.symbol.as_str(), p.quantity))
        .collect();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut mismatches = Vec::new();

    for position in ledger {
        seen.insert(position.symbol.as_str());
        if position.is_busy() || position.is_locked() {
            continue;
        }
        let local = position.signed_quantity();
        let broker = held.get(position.symbol.as_str()).copied().unwrap_or(0);
        if local != broker {
            mismatches.push(PositionMismatch {
                symbol: position.symbol.clone(),
                local,
                broker,
            });
        }
    }

    for p in broker {
        if p.quantity != 0 && !seen.contains(p.symbol.as_str()) {
            mismatches.push(PositionMismatch {
                symbol: p.symbol.clone(),
                local: 0,
                broker: p.quantity,
            });
        }
    }
    mismatches.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    mismatches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerOrderStatus;
    use crate::models::{OrderId, OrderSide, PositionState};
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn snapshot(client: &str, broker: &str, status: BrokerOrderStatus, filled: u64) -> BrokerOrderSnapshot {
        BrokerOrderSnapshot {
            client_order_id: ClientOrderId::new(client),
            broker_order_id: BrokerOrderId::new(broker),
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            quantity: 100,
            filled_quantity: filled,
            avg_fill_price: if filled > 0 { dec!(180) } else { Decimal::ZERO },
            status,
        }
    }

    fn candidate(client: &str, broker: Option<&str>) -> ReconcileCandidate {
        ReconcileCandidate {
            client_order_id: ClientOrderId::new(client),
            broker_order_id: broker.map(BrokerOrderId::new),
        }
    }

    #[test]
    fn test_open_leg_matched_by_client_or_broker_id() {
        let candidates = [candidate("a.0", None), candidate("b.0", Some("B2"))];
        let fetch = ReconcileFetch {
            open_orders: vec![
                snapshot("a.0", "B1", BrokerOrderStatus::Submitted, 0),
                snapshot("other", "B2", BrokerOrderStatus::PartiallyFilled, 10),
            ],
            history: HashMap::new(),
            positions: None,
        };

        let report = reconcile(&candidates, &fetch);
        assert!(matches!(report.resolutions[0].1, LegResolution::Open(_)));
        assert!(matches!(report.resolutions[1].1, LegResolution::Open(_)));
        assert!(report.orphans.is_empty());
        assert!(!report.has_anomalies());
    }

    #[test]
    fn test_absent_leg_resolved_from_history() {
        let candidates = [candidate("a.0", Some("B1"))];
        let open = Vec::new();
        assert_eq!(absent_candidates(&candidates, &open).len(), 1);

        let fetch = ReconcileFetch {
            open_orders: open,
            history: HashMap::from([(
                ClientOrderId::new("a.0"),
                HistoryLookup::Found(snapshot("a.0", "B1", BrokerOrderStatus::Filled, 100)),
            )]),
            positions: None,
        };
        let report = reconcile(&candidates, &fetch);
        let LegResolution::Closed(s) = &report.resolutions[0].1 else {
            panic!("expected closed leg");
        };
        assert_eq!(s.filled_quantity, 100);
    }

    #[test]
    fn test_unacknowledged_leg_without_record_was_never_received() {
        let candidates = [candidate("a.0", None)];
        let fetch = ReconcileFetch {
            open_orders: Vec::new(),
            history: HashMap::from([(ClientOrderId::new("a.0"), HistoryLookup::NotFound)]),
            positions: None,
        };
        let report = reconcile(&candidates, &fetch);
        assert_eq!(report.resolutions[0].1, LegResolution::NeverReceived);
    }

    #[test]
    fn test_missing_history_is_unknown() {
        let candidates = [candidate("a.0", Some("B1")), candidate("b.0", Some("B2"))];
        let fetch = ReconcileFetch {
            open_orders: Vec::new(),
            history: HashMap::from([
                (
                    ClientOrderId::new("a.0"),
                    HistoryLookup::Unavailable("unsupported".to_string()),
                ),
                (ClientOrderId::new("b.0"), HistoryLookup::NotFound),
            ]),
            positions: None,
        };
        let report = reconcile(&candidates, &fetch);
        assert_eq!(report.unknown_count(), 2);
        assert!(report.has_anomalies());
    }

    #[test]
    fn test_untracked_open_orders_are_orphans() {
        let fetch = ReconcileFetch {
            open_orders: vec![snapshot("manual", "B9", BrokerOrderStatus::Submitted, 0)],
            history: HashMap::new(),
            positions: None,
        };
        let report = reconcile(&[], &fetch);
        assert_eq!(report.orphans.len(), 1);
        assert!(report.has_anomalies());
    }

    fn held(symbol: &str, state: PositionState, quantity: u64) -> Position {
        let at = Utc.with_ymd_and_hms(2025, 3, 4, 15, 0, 0).unwrap();
        let mut position = Position::flat(symbol, at);
        position.set_holding(state, quantity, dec!(100));
        position
    }

    fn broker_position(symbol: &str, quantity: i64) -> BrokerPosition {
        BrokerPosition {
            symbol: symbol.to_string(),
            quantity,
            avg_cost: dec!(100),
        }
    }

    #[test]
    fn test_matching_positions_have_no_mismatch() {
        let ledger = [
            held("AAPL", PositionState::Long, 50),
            held("TSLA", PositionState::Short, 20),
            held("MSFT", PositionState::Flat, 0),
        ];
        let broker = [broker_position("AAPL", 50), broker_position("TSLA", -20)];
        assert!(position_mismatches(&ledger, &broker).is_empty());
    }

    #[test]
    fn test_position_differences_are_reported() {
        let ledger = [
            held("AAPL", PositionState::Long, 50),
            held("TSLA", PositionState::Short, 20),
        ];
        let broker = [
            broker_position("AAPL", 80),
            broker_position("NVDA", 10),
        ];

        let mismatches = position_mismatches(&ledger, &broker);
        assert_eq!(
            mismatches,
            vec![
                PositionMismatch {
                    symbol: "AAPL".to_string(),
                    local: 50,
                    broker: 80,
                },
                PositionMismatch {
                    symbol: "NVDA".to_string(),
                    local: 0,
                    broker: 10,
                },
                PositionMismatch {
                    symbol: "TSLA".to_string(),
                    local: -20,
                    broker: 0,
                },
            ]
        );
        assert!(mismatches[0].describe().contains("80 shares of AAPL"));
    }

    #[test]
    fn test_busy_and_locked_symbols_are_skipped() {
        let mut busy = held("AAPL", PositionState::Flat, 0);
        busy.open_order_id = Some(OrderId::new("ord"));
        let mut locked = held("TSLA", PositionState::Long, 10);
        locked.lock = Some("outcome unknown".to_string());

        let broker = [broker_position("AAPL", 100), broker_position("TSLA", 30)];
        assert!(position_mismatches(&[busy, locked], &broker).is_empty());
    }
}
