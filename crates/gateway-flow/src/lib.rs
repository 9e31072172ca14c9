//! # Gateway Flow
//!
//! Reliable-delivery and flow-control primitives for the completion gateway:
//! - ACK/NACK bookkeeping for fragmented messages
//! - De-duplicated, rate-limited retransmission requests
//! - Admission window over parallelism, tokens and cost
//! - Throttled window-update notifications
//! - Hysteresis backpressure watermark

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod ack;
pub mod backpressure;
pub mod retransmit;
pub mod window;
pub mod window_update;

// Re-export main types
pub use ack::{AckConfig, AckOutcome, AckTracker};
pub use backpressure::{BackpressureWatermark, WatermarkConfig, WatermarkSnapshot, WatermarkTransition};
pub use retransmit::{RetransmitConfig, RetransmitQueue};
pub use window::{WindowEntry, WindowStore};
pub use window_update::{WindowUpdate, WindowUpdateConfig, WindowUpdateEmitter};
