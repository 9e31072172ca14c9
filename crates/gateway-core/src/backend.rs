//! Completion backend contract.
//!
//! Provider-specific adapters live outside this workspace. They plug in by
//! implementing [`CompletionBackend`].

use crate::error::GatewayResult;
use crate::frame::{FrameMeta, MessageKey, Payload, QosTier};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Resource usage of a single completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed
    pub tokens: u64,
    /// Cost in micro-dollars
    pub usd_micros: u64,
}

impl Usage {
    /// Create a usage record
    #[must_use]
    pub fn new(tokens: u64, usd_micros: u64) -> Self {
        Self { tokens, usd_micros }
    }

    /// Cost in dollars
    #[must_use]
    pub fn usd(&self) -> f64 {
        self.usd_micros as f64 / 1_000_000.0
    }
}

/// A fully reassembled message handed to a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Message identity
    pub key: MessageKey,
    /// QoS tier of the message
    pub qos: QosTier,
    /// Task metadata
    pub meta: FrameMeta,
    /// Fragment payloads ordered by `frag_seq`
    pub payloads: Vec<Payload>,
}

/// Backend answer to a completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Message the response belongs to
    pub key: MessageKey,
    /// Completion content
    pub content: serde_json::Value,
    /// Actual resource usage
    pub usage: Usage,
}

/// A pluggable completion backend
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Stable identifier, used as the circuit breaker call site
    fn id(&self) -> &str;

    /// Run a completion
    async fn complete(&self, request: CompletionRequest) -> GatewayResult<CompletionResponse>;
}
