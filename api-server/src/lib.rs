//! HTTP surface for the inference fabric
//!
//! OpenAI-compatible generation endpoints with SSE and WebSocket
//! streaming, the efficiency control surface, and the operational
//! endpoints (`/healthz`, `/readyz`, `/metrics`).

pub mod error;
pub mod headers;
pub mod metrics;
pub mod openai;
pub mod ops;
pub mod rate_limiter;
pub mod routes;
pub mod state;
pub mod ws;

pub use routes::build_router;
pub use state::AppState;
