//! Integration tests for the completion gateway
//!
//! This crate provides end-to-end tests covering:
//! - Fragment reassembly, ACK/NACK and retransmission
//! - Budget, admission window and circuit breaker throttling
//! - Weighted fairness, agent status overrides and backpressure

pub mod fixtures;
pub mod helpers;
pub mod mock_backends;

// Re-export commonly used items
pub use fixtures::*;
pub use helpers::*;
pub use mock_backends::*;

#[cfg(test)]
mod admission_tests;
#[cfg(test)]
mod fairness_tests;
#[cfg(test)]
mod pipeline_tests;
