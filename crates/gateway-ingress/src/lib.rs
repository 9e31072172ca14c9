//! # Gateway Ingress
//!
//! The inbound side of the completion gateway.
//!
//! This crate provides:
//! - Fragment payload reassembly
//! - Per-frame ACK/NACK processing with selective retransmission
//! - The admission path: budget, anomaly screen, window, fair scheduler,
//!   circuit breaker and backend call
//! - [`AdmissionCore`], wiring every component from [`gateway_config::GatewayConfig`]

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admission;
pub mod dispatcher;
pub mod processor;
pub mod reassembly;

// Re-export main types
pub use admission::{AdmissionCore, FrameHandled, GatewaySnapshot, WindowSnapshot};
pub use dispatcher::{
    AdmissionComponents, DispatchOutcome, DispatchSettings, Dispatched, Dispatcher, ThrottleReason,
};
pub use processor::{FrameProcessor, FrameResult};
pub use reassembly::{AssembledMessage, Reassembler};
