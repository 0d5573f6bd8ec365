//! Backend adapter contract
//!
//! Every execution engine is reached through this trait. Errors carry a
//! transient/permanent classification so the circuit breaker and the
//! forwarding loop can decide what to do next.

use async_trait::async_trait;
use inference_fabric_contracts::{Capability, GenerateRequest, StreamChunk};
use thiserror::Error;
use tokio::sync::mpsc;

/// Bounded chunk channel capacity; a full channel back-pressures the
/// producer and, through it, the backend connection.
pub const STREAM_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// 5xx, 429, timeout, connection reset — worth retrying elsewhere
    #[error("transient: {0}")]
    Transient(String),
    /// 4xx or malformed response — retrying will not help
    #[error("permanent: {0}")]
    Permanent(String),
    /// The engine cannot serve this operation at all
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }
}

/// One finished generation from an engine
#[derive(Debug, Clone)]
pub struct AdapterResponse {
    pub text: String,
    pub tokens: u32,
}

/// A model visible on an engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterModel {
    pub id: String,
}

#[async_trait]
pub trait BackendAdapter: Send + Sync + std::fmt::Debug {
    fn backend_id(&self) -> &str;

    async fn generate(&self, request: &GenerateRequest) -> Result<AdapterResponse, AdapterError>;

    /// Streamed generation. Chunks arrive on a bounded channel; the
    /// producer task ends when the stream completes, errors, or the
    /// receiver is dropped.
    async fn generate_stream(
        &self,
        request: &GenerateRequest,
    ) -> Result<mpsc::Receiver<Result<StreamChunk, AdapterError>>, AdapterError>;

    async fn embed(
        &self,
        model: &str,
        inputs: &[String],
    ) -> Result<Vec<Vec<f32>>, AdapterError>;

    async fn list_models(&self) -> Result<Vec<AdapterModel>, AdapterError>;

    /// Lightweight reachability check used by the startup sweep
    async fn ping(&self) -> Result<(), AdapterError>;

    fn supports(&self, capability: Capability) -> bool;
}
