//! Configuration
//!
//! Loaded once at boot from a TOML file with environment overrides,
//! validated before the server opens any ports. Invalid configs are
//! rejected with a clear error rather than silently defaulted.

pub mod schema;

pub use schema::*;
