//! # Gateway Routing
//!
//! Admission scheduling for the completion gateway.
//!
//! This crate provides:
//! - Agent-reported throughput overrides (READY/BUSY/PAUSE/DRAINING)
//! - Weighted fair queuing of contending sessions
//! - Queue-wait histograms and Jain's fairness index

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod agent_status;
pub mod fairness;
pub mod histogram;
pub mod scheduler;

// Re-export main types
pub use agent_status::{AgentStatus, AgentStatusConfig, AgentStatusRegistry};
pub use fairness::jains_index;
pub use histogram::{WaitHistogram, WaitPercentiles, WAIT_BUCKETS_MS};
pub use scheduler::{
    AcquireOutcome, FairScheduler, SchedulerConfig, SchedulerSnapshot, SessionSnapshot,
};
