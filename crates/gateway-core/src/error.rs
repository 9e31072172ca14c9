//! Error types for the completion gateway.
//!
//! Throttling outcomes (full admission window, exhausted budget, a queue
//! timeout) are ordinary values returned by the admission components. The
//! variants here cover genuine failures: a backend that errored, a call that
//! was refused by an open circuit, or a frame that could not be accepted.

use thiserror::Error;

/// Result type used across the gateway crates
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors that can occur while moving a frame through the gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The completion backend returned an error
    #[error("Backend '{backend}' failed: {message}")]
    Backend {
        /// Backend identifier
        backend: String,
        /// Error message
        message: String,
        /// Whether retrying the call may succeed
        retryable: bool,
    },

    /// The circuit breaker guarding a call site is open
    #[error("Circuit breaker open for '{target}'")]
    CircuitOpen {
        /// Protected call site
        target: String,
    },

    /// An inbound frame failed validation
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Frame could not be decoded from the wire
    #[error("Frame decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// A downstream call exceeded its deadline
    #[error("Timed out after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Deadline in milliseconds
        timeout_ms: u64,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Create a backend error
    pub fn backend(backend: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.into(),
            retryable,
        }
    }

    /// Create a circuit-open error
    pub fn circuit_open(target: impl Into<String>) -> Self {
        Self::CircuitOpen {
            target: target.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether the caller may retry the operation later
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend { retryable, .. } => *retryable,
            Self::CircuitOpen { .. } | Self::Timeout { .. } => true,
            Self::InvalidFrame(_) | Self::Decode(_) | Self::Internal(_) => false,
        }
    }
}

impl From<validator::ValidationErrors> for GatewayError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::InvalidFrame(errors.to_string())
    }
}
