//! Thermal Monitor
//!
//! Polls per-backend telemetry (temperature, fan, throttle state, power
//! draw) from OS interfaces and derives the health classification the
//! router reads on every decision.

pub mod monitor;
pub mod probe;

pub use monitor::*;
pub use probe::*;
