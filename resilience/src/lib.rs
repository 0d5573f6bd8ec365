//! Failure isolation for backend engines
//!
//! Each backend gets its own circuit breaker; the router consults breaker
//! phase when building candidate sets and the execution path records call
//! outcomes.

pub mod breaker;

pub use breaker::*;
