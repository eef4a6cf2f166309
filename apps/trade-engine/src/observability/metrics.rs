//! Engine metrics.
//!
//! Recorded through the `metrics` facade. No exporter is installed here; a
//! host process may install one (the calls are no-ops without a recorder).

use metrics::{counter, gauge, histogram};

// ============================================================================
// Alerts
// ============================================================================

/// Record the outcome of an inbound alert.
///
/// # Arguments
///
/// * `result` - `"accepted"`, `"duplicate"`, or the rejection reason
pub fn record_alert(result: &str) {
    counter!("alerts_total", "result" => result.to_string()).increment(1);
}

// ============================================================================
// Orders
// ============================================================================

/// Record an order handed to the gateway.
///
/// # Arguments
///
/// * `order_type` - `"MARKET"` or `"LIMIT"`
/// * `queued` - Whether it was held for a reconnect
pub fn record_order_submission(order_type: &str, queued: bool) {
    counter!(
        "order_submissions_total",
        "order_type" => order_type.to_string(),
        "queued" => queued.to_string()
    )
    .increment(1);
}

/// Record an execution.
pub fn record_order_fill(quantity: u64) {
    counter!("order_fills_total").increment(1);
    counter!("order_filled_shares_total").increment(quantity);
}

/// Record the time from order creation to complete fill.
///
/// # Arguments
///
/// * `order_type` - Order type
/// * `latency_seconds` - Time from creation to fill in seconds
pub fn record_time_to_fill(order_type: &str, latency_seconds: f64) {
    histogram!(
        "order_time_to_fill_seconds",
        "order_type" => order_type.to_string()
    )
    .record(latency_seconds);
}

/// Record a resubmission.
pub fn record_resubmission() {
    counter!("order_resubmissions_total").increment(1);
}

/// Record an order reaching a terminal status.
pub fn record_order_terminal(status: &str) {
    counter!("order_terminal_total", "status" => status.to_string()).increment(1);
}

/// Update the open orders gauge.
pub fn update_open_orders(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("open_orders").set(count as f64);
}

// ============================================================================
// Broker connection
// ============================================================================

/// Record a lost broker connection.
pub fn record_broker_disconnect(broker: &str) {
    counter!("broker_disconnects_total", "broker" => broker.to_string()).increment(1);
}

/// Record a reconciliation run.
///
/// # Arguments
///
/// * `orders_compared` - Legs compared against the broker
/// * `anomalies` - Legs with unknown outcome plus untracked broker orders
pub fn record_reconciliation(orders_compared: usize, anomalies: usize) {
    counter!("reconciliations_total").increment(1);
    #[allow(clippy::cast_precision_loss)]
    gauge!("reconciliation_last_compared").set(orders_compared as f64);
    counter!("reconciliation_anomalies_total").increment(anomalies as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder() {
        // No recorder installed; calls must be no-ops
        record_alert("accepted");
        record_order_submission("LIMIT", true);
        record_order_fill(100);
        record_time_to_fill("MARKET", 0.25);
        record_resubmission();
        record_order_terminal("FILLED");
        update_open_orders(3);
        record_broker_disconnect("paper");
        record_reconciliation(2, 0);
    }
}
