//! Observability: metrics and log output.

mod logging;
mod metrics;

pub use logging::{init_tracing, log_filter};
pub use metrics::{
    record_alert, record_broker_disconnect, record_order_fill, record_order_submission,
    record_order_terminal, record_reconciliation, record_resubmission, record_time_to_fill,
    update_open_orders,
};
