//! Efficiency Manager
//!
//! Owns the machine-wide efficiency mode, resolves Auto from battery and
//! clock state, and publishes the active profile as an atomic snapshot
//! that routing decisions hold start-to-finish.

pub mod manager;
pub mod power;

pub use manager::*;
pub use power::*;
