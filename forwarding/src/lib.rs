//! Forwarding Loop
//!
//! Wraps the router for non-streaming generation: call the cheapest
//! viable tier, score the answer, and climb the escalation ladder until
//! a response clears the confidence bar or the ladder runs out.

pub mod confidence;
pub mod service;

pub use confidence::*;
pub use service::*;
