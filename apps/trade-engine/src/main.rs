//! Trade Engine Binary
//!
//! Reads trading alerts as newline-delimited JSON on stdin and writes one
//! JSON verdict per alert to stdout.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin trade-engine -- config.yaml < alerts.ndjson
//! ```
//!
//! # Environment Variables
//!
//! - `TRADE_ENGINE_CONFIG`: config file path when no argument is given
//!   (default: `config.yaml`)
//! - `RUST_LOG`: overrides the configured log level

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

use trade_engine::broker::PaperBroker;
use trade_engine::config::load_config;
use trade_engine::engine::{EngineHandle, TradingEngine, spawn_ticker};
use trade_engine::error::{EngineError, ErrorCode};
use trade_engine::models::{Alert, RawAlert};
use trade_engine::notify::TracingNotifier;
use trade_engine::observability::init_tracing;
use trade_engine::persistence::{InMemoryStateStore, SqliteStateStore, StateStore};
use trade_engine::session::{Clock, SessionResolver, SystemClock};

/// Grace period for the engine to persist state on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TRADE_ENGINE_CONFIG").ok());
    let config = load_config(path.as_deref()).context("failed to load configuration")?;
    init_tracing(&config.logging);

    tracing::info!(
        name = %config.engine.name,
        account_id = %config.engine.account_id,
        "Starting trade engine"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let resolver = SessionResolver::from_config(&config.market_hours, &config.trading)?;
    let now = clock.now();
    let session = resolver.session_at(now);
    match resolver.next_change(now) {
        Some((at, next)) => tracing::info!(%session, next = %next, at = %at, "Market session"),
        None => tracing::info!(%session, "Market session"),
    }

    let store: Box<dyn StateStore> = if config.persistence.enabled {
        Box::new(SqliteStateStore::open(&config.persistence.path)?)
    } else {
        tracing::warn!("Persistence disabled, state is lost on exit");
        Box::new(InMemoryStateStore::new())
    };

    let broker = Arc::new(PaperBroker::new());
    let (engine, handle) = TradingEngine::new(
        &config,
        broker,
        store,
        Arc::new(TracingNotifier),
        Arc::clone(&clock),
    )?;
    let engine_task = tokio::spawn(engine.run());
    let ticker = spawn_ticker(handle.clone(), config.engine.tick_interval());

    tokio::select! {
        result = read_alerts(&handle) => {
            result?;
            tracing::info!("Alert input closed");
        }
        () = shutdown_signal() => {}
    }

    ticker.abort();
    if let Err(e) = handle.shutdown().await {
        tracing::warn!(error = %e, "Engine already stopped");
    }
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, engine_task).await {
        Ok(Ok(Ok(()))) => tracing::info!("Shutdown complete"),
        Ok(Ok(Err(e))) => return Err(e.into()),
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Engine did not stop in time"
        ),
    }
    Ok(())
}

/// Forward NDJSON alerts from stdin to the engine until EOF.
async fn read_alerts(handle: &EngineHandle) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let verdict = match parse_alert(line) {
            Ok(alert) => match handle.submit_alert(alert).await {
                Ok(ack) => json!({ "accepted": true, "order": ack }),
                Err(e) => rejection(&e),
            },
            Err(e) => rejection(&e),
        };
        println!("{verdict}");
    }
    Ok(())
}

fn parse_alert(line: &str) -> Result<Alert, EngineError> {
    let raw: RawAlert = serde_json::from_str(line)
        .map_err(|e| EngineError::new(ErrorCode::InvalidAlert, e.to_string()))?;
    Ok(Alert::parse(raw, Utc::now())?)
}

fn rejection(error: &EngineError) -> serde_json::Value {
    json!({
        "accepted": false,
        "code": error.code(),
        "message": error.message(),
    })
}

/// Load .env from the working directory or the nearest ancestor.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, initiating shutdown"),
        () = terminate => tracing::info!("Received SIGTERM, initiating shutdown"),
    }
}
