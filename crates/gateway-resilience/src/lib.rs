//! # Gateway Resilience
//!
//! Economic admission control and fail-fast protection for the completion gateway:
//! - Circuit breaker for preventing cascading failures
//! - Per-session token and cost budgets with window rollover
//! - Burn-rate anomaly detection (EWMA + z-score with cooldown)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod anomaly;
pub mod budget;
pub mod circuit_breaker;

// Re-export main types
pub use anomaly::{AnomalyConfig, AnomalyGuard, AnomalySnapshot};
pub use budget::{
    BudgetConfig, BudgetDecision, BudgetExceededReason, BudgetGovernor, BudgetRemaining,
    BudgetSnapshot,
};
pub use circuit_breaker::{
    BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
};
