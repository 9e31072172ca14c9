//! # Gateway Core
//!
//! Core types, traits, and error handling for the completion gateway.
//!
//! This crate provides the shared vocabulary used throughout the gateway:
//! - Wire frames and message/fragment identity
//! - Control frames emitted back toward senders
//! - The completion backend contract
//! - Error types and handling

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod control;
pub mod error;
pub mod frame;

// Re-export commonly used types
pub use backend::{CompletionBackend, CompletionRequest, CompletionResponse, Usage};
pub use control::ControlFrame;
pub use error::{GatewayError, GatewayResult};
pub use frame::{
    Flag, Frame, FrameMeta, MessageKey, Payload, QosTier, Window, MAX_FRAG_SEQ, WIRE_VERSION,
};
