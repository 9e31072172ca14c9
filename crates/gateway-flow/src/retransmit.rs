//! Rate-limited retransmission requests.
//!
//! A peer that keeps reporting the same gaps must not cause a storm of
//! re-requests. Each missing fragment is re-requested at most once per
//! `ttl`; state for a message is dropped once it has been idle for
//! `idle_timeout`.

use dashmap::DashMap;
use gateway_core::MessageKey;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Retransmit queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetransmitConfig {
    /// Minimum interval between two requests for the same fragment
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Message state untouched for this long is purged
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// How often request calls sweep for idle state
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct RetransmitState {
    requested: BTreeMap<u32, Instant>,
    last_touch: Instant,
}

/// De-duplicating retransmit request queue
#[derive(Debug)]
pub struct RetransmitQueue {
    config: RetransmitConfig,
    states: DashMap<MessageKey, RetransmitState>,
    last_sweep: Mutex<Option<Instant>>,
}

impl RetransmitQueue {
    /// Create a queue
    #[must_use]
    pub fn new(config: RetransmitConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
            last_sweep: Mutex::new(None),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RetransmitConfig::default())
    }

    /// Filter `missing` down to the fragments that should be requested now
    pub fn request(&self, key: &MessageKey, missing: &[u32]) -> Vec<u32> {
        self.request_at(key, missing, Instant::now())
    }

    /// Filter `missing` down to the fragments that should be requested at `now`
    pub fn request_at(&self, key: &MessageKey, missing: &[u32], now: Instant) -> Vec<u32> {
        self.maybe_sweep(now);

        let mut ordered: Vec<u32> = missing.to_vec();
        ordered.sort_unstable();
        ordered.dedup();

        let ttl = self.config.ttl;
        let mut state = self.states.entry(key.clone()).or_insert_with(|| RetransmitState {
            requested: BTreeMap::new(),
            last_touch: now,
        });
        state.last_touch = now;

        let mut due = Vec::with_capacity(ordered.len());
        for idx in ordered {
            let is_due = state
                .requested
                .get(&idx)
                .map_or(true, |last| now.saturating_duration_since(*last) >= ttl);
            if is_due {
                state.requested.insert(idx, now);
                due.push(idx);
            }
        }

        if !due.is_empty() {
            debug!(message = %key, fragments = ?due, "Requesting retransmission");
        }
        due
    }

    /// Drop state for a message, typically once it has completed
    pub fn forget(&self, key: &MessageKey) -> bool {
        self.states.remove(key).is_some()
    }

    /// Number of messages with outstanding retransmit state
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether no retransmit state is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Purge state idle for longer than `idle_timeout`
    pub fn purge_idle_at(&self, now: Instant) -> usize {
        let idle = self.config.idle_timeout;
        let before = self.states.len();
        self.states
            .retain(|_, state| now.saturating_duration_since(state.last_touch) <= idle);
        let purged = before.saturating_sub(self.states.len());
        if purged > 0 {
            debug!(count = purged, "Purged idle retransmit state");
        }
        purged
    }

    fn maybe_sweep(&self, now: Instant) {
        let due = {
            let mut last = self.last_sweep.lock();
            match *last {
                Some(at) if now.saturating_duration_since(at) < self.config.sweep_interval => false,
                _ => {
                    *last = Some(now);
                    true
                }
            }
        };
        if due {
            self.purge_idle_at(now);
        }
    }
}

impl Default for RetransmitQueue {
    fn default() -> Self {
        Self::with_defaults()
    }
}
