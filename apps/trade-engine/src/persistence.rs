//! Durable engine state.
//!
//! Positions and non-terminal orders are written on every transition so a
//! restart reconciles from the last known state instead of starting blank.
//! Rows hold JSON snapshots of the domain types.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use rusqlite::{Connection, params};
use thiserror::Error;
use tracing::{debug, info};

use crate::models::{Order, OrderId, Position};

// ============================================================================
// Errors
// ============================================================================

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Database error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Snapshot could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database directory could not be created.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Store
// ============================================================================

/// State loaded at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedState {
    /// Every recorded position.
    pub positions: Vec<Position>,
    /// Orders that were live when last written.
    pub orders: Vec<Order>,
}

/// Durable storage for positions and live orders.
pub trait StateStore: Send + Sync {
    /// Insert or replace a position.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn save_position(&self, position: &Position) -> Result<(), PersistenceError>;

    /// Insert or replace a live order.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn save_order(&self, order: &Order) -> Result<(), PersistenceError>;

    /// Remove an order that reached a terminal status.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn delete_order(&self, order_id: &OrderId) -> Result<(), PersistenceError>;

    /// Load everything written so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or a row cannot be decoded.
    fn load(&self) -> Result<PersistedState, PersistenceError>;
}

/// SQLite-backed store.
#[derive(Debug)]
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open or create the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or database cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        let store = Self::with_connection(conn)?;
        info!(path = %path.display(), "State store opened");
        Ok(store)
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, PersistenceError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS positions (
                symbol TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS open_orders (
                order_id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_open_orders_symbol ON open_orders(symbol);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StateStore for SqliteStateStore {
    fn save_position(&self, position: &Position) -> Result<(), PersistenceError> {
        let body = serde_json::to_string(position)?;
        self.conn().execute(
            "INSERT INTO positions (symbol, body, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(symbol) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
            params![position.symbol, body, Utc::now().to_rfc3339()],
        )?;
        debug!(symbol = %position.symbol, state = %position.state, "Position saved");
        Ok(())
    }

    fn save_order(&self, order: &Order) -> Result<(), PersistenceError> {
        let body = serde_json::to_string(order)?;
        self.conn().execute(
            "INSERT INTO open_orders (order_id, symbol, body, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(order_id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
            params![order.id.as_str(), order.symbol, body, Utc::now().to_rfc3339()],
        )?;
        debug!(order_id = %order.id, status = %order.status, "Order saved");
        Ok(())
    }

    fn delete_order(&self, order_id: &OrderId) -> Result<(), PersistenceError> {
        self.conn()
            .execute("DELETE FROM open_orders WHERE order_id = ?1", params![order_id.as_str()])?;
        Ok(())
    }

    fn load(&self) -> Result<PersistedState, PersistenceError> {
        let conn = self.conn();

        let mut stmt = conn.prepare("SELECT body FROM positions ORDER BY symbol")?;
        let positions = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|body| Ok(serde_json::from_str(&body?)?))
            .collect::<Result<Vec<Position>, PersistenceError>>()?;

        let mut stmt = conn.prepare("SELECT body FROM open_orders ORDER BY updated_at")?;
        let orders = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|body| Ok(serde_json::from_str(&body?)?))
            .collect::<Result<Vec<Order>, PersistenceError>>()?;

        Ok(PersistedState { positions, orders })
    }
}

/// Volatile store for tests and runs without persistence.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    positions: Mutex<HashMap<String, Position>>,
    orders: Mutex<HashMap<OrderId, Order>>,
}

impl InMemoryStateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store preloaded with `state`.
    #[must_use]
    pub fn with_state(state: PersistedState) -> Self {
        let store = Self::default();
        store.positions_mut().extend(
            state
                .positions
                .into_iter()
                .map(|p| (p.symbol.clone(), p)),
        );
        store
            .orders_mut()
            .extend(state.orders.into_iter().map(|o| (o.id.clone(), o)));
        store
    }

    fn positions_mut(&self) -> MutexGuard<'_, HashMap<String, Position>> {
        self.positions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn orders_mut(&self) -> MutexGuard<'_, HashMap<OrderId, Order>> {
        self.orders.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StateStore for InMemoryStateStore {
    fn save_position(&self, position: &Position) -> Result<(), PersistenceError> {
        self.positions_mut()
            .insert(position.symbol.clone(), position.clone());
        Ok(())
    }

    fn save_order(&self, order: &Order) -> Result<(), PersistenceError> {
        self.orders_mut().insert(order.id.clone(), order.clone());
        Ok(())
    }

    fn delete_order(&self, order_id: &OrderId) -> Result<(), PersistenceError> {
        self.orders_mut().remove(order_id);
        Ok(())
    }

    fn load(&self) -> Result<PersistedState, PersistenceError> {
        let mut positions: Vec<Position> = self.positions_mut().values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        let mut orders: Vec<Order> = self.orders_mut().values().cloned().collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(PersistedState { positions, orders })
    }
}
