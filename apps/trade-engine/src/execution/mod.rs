//! Order execution.
//!
//! Order supervision from submission to terminal status, and limit price
//! selection.

pub mod pricing;
pub mod supervisor;

pub use pricing::PriceInstruction;
pub use supervisor::{OrderSupervisor, SupervisorEffect, SupervisorSettings, TimerAction};
