//! Backend Registry
//!
//! Owns the backend pool: immutable descriptors, mutable runtime state
//! behind fine-grained locks, and the adapter each backend is called
//! through. The router iterates snapshots and never holds a registry lock
//! across a backend call.

pub mod adapter;
pub mod http;
pub mod registry;

pub use adapter::*;
pub use http::*;
pub use registry::*;
