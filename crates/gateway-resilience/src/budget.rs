//! Per-session token and cost budgets.
//!
//! Every session owns a ledger of tokens and USD (in micro-dollars) consumed
//! during the current budget window. Ledgers roll over once the window has
//! elapsed.
//!
//! ## Budget Limits
//!
//! - **Tokens**: Maximum tokens per window (default: 1,000,000)
//! - **Cost**: Maximum spend per window (default: $10.00)
//! - **Window**: Ledger lifetime before rollover (default: 1h)
//!
//! Running over budget is an expected outcome: `check` returns a
//! [`BudgetDecision`] and callers decide how to throttle.

use dashmap::DashMap;
use gateway_core::Usage;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Burn rates are computed over at least this much elapsed time
const MIN_BURN_WINDOW: Duration = Duration::from_secs(60);

// =============================================================================
// Configuration
// =============================================================================

/// Budget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Maximum tokens per session per window
    pub token_limit: u64,
    /// Maximum spend per session per window, in micro-dollars
    pub usd_limit_micros: u64,
    /// Ledger lifetime
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            token_limit: 1_000_000,
            usd_limit_micros: 10_000_000,
            window: Duration::from_secs(3600),
        }
    }
}

// =============================================================================
// Budget Decision
// =============================================================================

/// Reason why a budget would be exceeded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BudgetExceededReason {
    /// Token budget exhausted.
    TokensExceeded {
        /// Tokens consumed in the current window.
        used: u64,
        /// Tokens the request would add.
        requested: u64,
        /// Token limit.
        max: u64,
    },

    /// Cost budget exhausted.
    CostExceeded {
        /// Micro-dollars consumed in the current window.
        used_micros: u64,
        /// Micro-dollars the request would add.
        requested_micros: u64,
        /// Cost limit in micro-dollars.
        max_micros: u64,
    },
}

impl std::fmt::Display for BudgetExceededReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TokensExceeded {
                used,
                requested,
                max,
            } => write!(
                f,
                "Token budget exceeded: {used} used + {requested} requested, max {max}"
            ),
            Self::CostExceeded {
                used_micros,
                requested_micros,
                max_micros,
            } => write!(
                f,
                "Cost budget exceeded: ${:.6} used + ${:.6} requested, max ${:.6}",
                *used_micros as f64 / 1e6,
                *requested_micros as f64 / 1e6,
                *max_micros as f64 / 1e6
            ),
        }
    }
}

/// Outcome of a pre-flight budget check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetDecision {
    /// The request fits in the remaining budget
    Allowed,
    /// The request would exceed the budget
    Denied {
        /// Which limit would be exceeded
        reason: BudgetExceededReason,
    },
}

impl BudgetDecision {
    /// Whether the request may proceed
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

// =============================================================================
// Budget Governor
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct BudgetLedger {
    tokens_consumed: u64,
    usd_micros_consumed: u64,
    window_start: Instant,
}

impl BudgetLedger {
    fn new(now: Instant) -> Self {
        Self {
            tokens_consumed: 0,
            usd_micros_consumed: 0,
            window_start: now,
        }
    }
}

/// Budget left in the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BudgetRemaining {
    /// Tokens left
    pub tokens: u64,
    /// Micro-dollars left
    pub usd_micros: u64,
}

/// Point-in-time view of a session's ledger
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetSnapshot {
    /// Session identifier
    pub session_id: String,
    /// Tokens consumed in the current window
    pub tokens_consumed: u64,
    /// USD consumed in the current window
    pub usd_consumed: f64,
    /// Budget left
    pub remaining: BudgetRemaining,
    /// Spend rate over the current window
    pub burn_rate_usd_per_min: f64,
}

/// Per-session budget ledgers
#[derive(Debug)]
pub struct BudgetGovernor {
    config: BudgetConfig,
    ledgers: DashMap<String, BudgetLedger>,
}

impl BudgetGovernor {
    /// Create a governor
    #[must_use]
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            ledgers: DashMap::new(),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(BudgetConfig::default())
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Debit `usage` from the session's ledger
    pub fn consume(&self, session: &str, usage: Usage) {
        self.consume_at(session, usage, Instant::now());
    }

    /// Debit `usage` from the session's ledger at `now`
    ///
    /// Actual usage is always recorded, even when it overshoots the limit.
    pub fn consume_at(&self, session: &str, usage: Usage, now: Instant) {
        let mut ledger = self
            .ledgers
            .entry(session.to_string())
            .or_insert_with(|| BudgetLedger::new(now));
        self.roll_over(session, &mut ledger, now);
        ledger.tokens_consumed = ledger.tokens_consumed.saturating_add(usage.tokens);
        ledger.usd_micros_consumed = ledger.usd_micros_consumed.saturating_add(usage.usd_micros);
        debug!(
            session = %session,
            tokens = usage.tokens,
            usd_micros = usage.usd_micros,
            tokens_consumed = ledger.tokens_consumed,
            "Budget consumed"
        );
    }

    /// Whether a request with the given estimate fits the remaining budget
    #[must_use]
    pub fn check(&self, session: &str, estimate: Usage) -> BudgetDecision {
        self.check_at(session, estimate, Instant::now())
    }

    /// Whether a request with the given estimate fits at `now`
    #[must_use]
    pub fn check_at(&self, session: &str, estimate: Usage, now: Instant) -> BudgetDecision {
        let (used_tokens, used_micros) = self.consumed_at(session, now);

        if used_tokens.saturating_add(estimate.tokens) > self.config.token_limit {
            return BudgetDecision::Denied {
                reason: BudgetExceededReason::TokensExceeded {
                    used: used_tokens,
                    requested: estimate.tokens,
                    max: self.config.token_limit,
                },
            };
        }
        if used_micros.saturating_add(estimate.usd_micros) > self.config.usd_limit_micros {
            return BudgetDecision::Denied {
                reason: BudgetExceededReason::CostExceeded {
                    used_micros,
                    requested_micros: estimate.usd_micros,
                    max_micros: self.config.usd_limit_micros,
                },
            };
        }
        BudgetDecision::Allowed
    }

    /// Budget left for the session
    #[must_use]
    pub fn remaining(&self, session: &str) -> BudgetRemaining {
        self.remaining_at(session, Instant::now())
    }

    /// Budget left for the session at `now`
    #[must_use]
    pub fn remaining_at(&self, session: &str, now: Instant) -> BudgetRemaining {
        let (tokens, micros) = self.consumed_at(session, now);
        BudgetRemaining {
            tokens: self.config.token_limit.saturating_sub(tokens),
            usd_micros: self.config.usd_limit_micros.saturating_sub(micros),
        }
    }

    /// USD spent per minute since the window started
    #[must_use]
    pub fn burn_rate_usd_per_min(&self, session: &str) -> f64 {
        self.burn_rate_usd_per_min_at(session, Instant::now())
    }

    /// USD spent per minute since the window started, at `now`
    ///
    /// Elapsed time is floored at one minute so a fresh window does not
    /// report an inflated rate.
    #[must_use]
    pub fn burn_rate_usd_per_min_at(&self, session: &str, now: Instant) -> f64 {
        let Some(ledger) = self.live_ledger(session, now) else {
            return 0.0;
        };
        let elapsed = now
            .saturating_duration_since(ledger.window_start)
            .max(MIN_BURN_WINDOW);
        (ledger.usd_micros_consumed as f64 / 1e6) / (elapsed.as_secs_f64() / 60.0)
    }

    /// Drop a session's ledger
    pub fn reset(&self, session: &str) -> bool {
        self.ledgers.remove(session).is_some()
    }

    /// Snapshot of one session's ledger
    #[must_use]
    pub fn snapshot(&self, session: &str) -> BudgetSnapshot {
        self.snapshot_at(session, Instant::now())
    }

    /// Snapshot of one session's ledger at `now`
    #[must_use]
    pub fn snapshot_at(&self, session: &str, now: Instant) -> BudgetSnapshot {
        let (tokens, micros) = self.consumed_at(session, now);
        BudgetSnapshot {
            session_id: session.to_string(),
            tokens_consumed: tokens,
            usd_consumed: micros as f64 / 1e6,
            remaining: self.remaining_at(session, now),
            burn_rate_usd_per_min: self.burn_rate_usd_per_min_at(session, now),
        }
    }

    /// Snapshots of every tracked session, sorted by session
    #[must_use]
    pub fn snapshots(&self) -> Vec<BudgetSnapshot> {
        let now = Instant::now();
        let mut sessions: Vec<String> = self.ledgers.iter().map(|e| e.key().clone()).collect();
        sessions.sort();
        sessions.iter().map(|s| self.snapshot_at(s, now)).collect()
    }

    /// Drop ledgers whose window expired before `now`
    ///
    /// An expired ledger reads as a fresh one, so dropping it changes no
    /// decision. Returns the number of sessions removed.
    pub fn purge_idle_at(&self, now: Instant) -> usize {
        let before = self.ledgers.len();
        self.ledgers
            .retain(|_, l| now.saturating_duration_since(l.window_start) < self.config.window);
        let purged = before.saturating_sub(self.ledgers.len());
        if purged > 0 {
            debug!(purged, remaining = self.ledgers.len(), "Purged expired budget ledgers");
        }
        purged
    }

    /// Number of tracked sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.ledgers.len()
    }

    /// Whether no session is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ledgers.is_empty()
    }

    fn consumed_at(&self, session: &str, now: Instant) -> (u64, u64) {
        self.live_ledger(session, now)
            .map_or((0, 0), |l| (l.tokens_consumed, l.usd_micros_consumed))
    }

    /// Ledger for `session` unless its window already expired
    fn live_ledger(&self, session: &str, now: Instant) -> Option<BudgetLedger> {
        let ledger = *self.ledgers.get(session)?;
        (now.saturating_duration_since(ledger.window_start) < self.config.window).then_some(ledger)
    }

    fn roll_over(&self, session: &str, ledger: &mut BudgetLedger, now: Instant) {
        if now.saturating_duration_since(ledger.window_start) >= self.config.window {
            info!(
                session = %session,
                tokens_consumed = ledger.tokens_consumed,
                usd_micros_consumed = ledger.usd_micros_consumed,
                "Budget window rolled over"
            );
            *ledger = BudgetLedger::new(now);
        }
    }
}

impl Default for BudgetGovernor {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor() -> BudgetGovernor {
        BudgetGovernor::new(BudgetConfig {
            token_limit: 1_000,
            usd_limit_micros: 2_000_000,
            window: Duration::from_secs(3600),
        })
    }

    #[test]
    fn test_consume_and_remaining() {
        let gov = governor();
        gov.consume("s1", Usage::new(400, 500_000));
        assert_eq!(
            gov.remaining("s1"),
            BudgetRemaining {
                tokens: 600,
                usd_micros: 1_500_000
            }
        );
        assert_eq!(gov.remaining("other").tokens, 1_000);
    }

    #[test]
    fn test_check_token_limit() {
        let gov = governor();
        gov.consume("s1", Usage::new(900, 0));
        assert!(gov.check("s1", Usage::new(100, 0)).is_allowed());

        let decision = gov.check("s1", Usage::new(101, 0));
        assert_eq!(
            decision,
            BudgetDecision::Denied {
                reason: BudgetExceededReason::TokensExceeded {
                    used: 900,
                    requested: 101,
                    max: 1_000
                }
            }
        );
    }

    #[test]
    fn test_check_cost_limit() {
        let gov = governor();
        gov.consume("s1", Usage::new(1, 1_999_999));
        let decision = gov.check("s1", Usage::new(1, 2));
        assert!(matches!(
            decision,
            BudgetDecision::Denied {
                reason: BudgetExceededReason::CostExceeded { .. }
            }
        ));
    }

    #[test]
    fn test_overshoot_saturates_remaining() {
        let gov = governor();
        gov.consume("s1", Usage::new(5_000, 0));
        assert_eq!(gov.remaining("s1").tokens, 0);
    }

    #[test]
    fn test_window_rollover() {
        let gov = governor();
        let t0 = Instant::now();
        gov.consume_at("s1", Usage::new(1_000, 0), t0);
        assert!(!gov.check_at("s1", Usage::new(1, 0), t0).is_allowed());

        let later = t0 + Duration::from_secs(3600);
        assert!(gov.check_at("s1", Usage::new(1, 0), later).is_allowed());
        gov.consume_at("s1", Usage::new(10, 0), later);
        assert_eq!(gov.remaining_at("s1", later).tokens, 990);
    }

    #[test]
    fn test_burn_rate() {
        let gov = governor();
        let t0 = Instant::now();
        gov.consume_at("s1", Usage::new(0, 1_000_000), t0);

        // Floored at one minute.
        let early = gov.burn_rate_usd_per_min_at("s1", t0 + Duration::from_secs(1));
        assert!((early - 1.0).abs() < 1e-9);

        let later = gov.burn_rate_usd_per_min_at("s1", t0 + Duration::from_secs(240));
        assert!((later - 0.25).abs() < 1e-9);

        assert!(gov.burn_rate_usd_per_min("unknown").abs() < f64::EPSILON);
    }

    #[test]
    fn test_reason_display() {
        let reason = BudgetExceededReason::CostExceeded {
            used_micros: 1_500_000,
            requested_micros: 600_000,
            max_micros: 2_000_000,
        };
        assert_eq!(
            reason.to_string(),
            "Cost budget exceeded: $1.500000 used + $0.600000 requested, max $2.000000"
        );
    }

    #[test]
    fn test_snapshot() {
        let gov = governor();
        gov.consume("s1", Usage::new(10, 250_000));
        let snap = gov.snapshot("s1");
        assert_eq!(snap.tokens_consumed, 10);
        assert!((snap.usd_consumed - 0.25).abs() < 1e-9);
        assert_eq!(gov.snapshots().len(), 1);
        assert!(gov.reset("s1"));
        assert!(gov.is_empty());
    }

    #[test]
    fn test_purge_drops_only_expired_ledgers() {
        let gov = governor();
        let t0 = Instant::now();
        gov.consume_at("old", Usage::new(10, 10), t0);
        gov.consume_at("new", Usage::new(10, 10), t0 + Duration::from_secs(3000));

        assert_eq!(gov.purge_idle_at(t0 + Duration::from_secs(3599)), 0);
        assert_eq!(gov.purge_idle_at(t0 + Duration::from_secs(3600)), 1);
        assert_eq!(gov.len(), 1);
        assert_eq!(
            gov.remaining_at("new", t0 + Duration::from_secs(3600)).tokens,
            gov.config().token_limit - 10
        );
    }
}
