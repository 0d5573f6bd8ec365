//! Inference Router
//!
//! The decision engine: classifies prompts, detects workload intent, and
//! picks one backend per request from the candidates that survive health,
//! thermal, profile, model, and breaker filters.

pub mod classifier;
pub mod router;
pub mod scoring;
pub mod workload;

pub use classifier::*;
pub use router::*;
pub use scoring::*;
pub use workload::*;
