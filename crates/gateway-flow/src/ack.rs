//! ACK/NACK bookkeeping for fragmented messages.
//!
//! One [`SequenceState`] exists per in-flight message. It is created by the
//! first fragment, discarded when the message completes, and purged if the
//! sender goes quiet for longer than the idle timeout.
//!
//! Fragment indices are bounded by `max_fragments`, and one outcome reports
//! at most `max_nacks` gaps, so a single frame cannot make the tracker
//! allocate in proportion to an arbitrary `frag_seq`.

use dashmap::DashMap;
use gateway_core::{GatewayError, GatewayResult, MessageKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::debug;

/// AckTracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AckConfig {
    /// Incomplete messages untouched for this long are discarded
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Fragments a single message may have; indices at or above are refused
    pub max_fragments: u32,
    /// Most missing indices reported in one outcome, lowest first
    pub max_nacks: usize,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            max_fragments: 4096,
            max_nacks: 256,
        }
    }
}

/// Per-message reassembly state
#[derive(Debug, Clone)]
struct SequenceState {
    received: BTreeSet<u32>,
    expected_last: Option<u32>,
    /// Highest index of the contiguous prefix starting at 0
    ack_up_to: Option<u32>,
    last_seen: Instant,
}

impl SequenceState {
    fn new(now: Instant) -> Self {
        Self {
            received: BTreeSet::new(),
            expected_last: None,
            ack_up_to: None,
            last_seen: now,
        }
    }

    fn advance(&mut self) {
        let mut next = self.ack_up_to.map_or(Some(0), |a| a.checked_add(1));
        while let Some(idx) = next {
            if !self.received.contains(&idx) {
                break;
            }
            self.ack_up_to = Some(idx);
            next = idx.checked_add(1);
        }
    }

    /// Lowest `limit` gaps in `[0, expected_last]`
    fn missing(&self, limit: usize) -> Vec<u32> {
        let Some(last) = self.expected_last else {
            return Vec::new();
        };
        // Everything up to ack_up_to is present by construction.
        let start = self.ack_up_to.map_or(0, |a| a.saturating_add(1));
        if start > last {
            return Vec::new();
        }
        (start..=last)
            .filter(|idx| !self.received.contains(idx))
            .take(limit)
            .collect()
    }

    fn is_complete(&self) -> bool {
        match (self.expected_last, self.ack_up_to) {
            (Some(last), Some(acked)) => acked >= last,
            _ => false,
        }
    }
}

/// Result of noting one fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckOutcome {
    /// Highest contiguous index received, `None` until fragment 0 arrives
    pub ack_up_to: Option<u32>,
    /// Confirmed gaps, lowest first and capped at `max_nacks`; empty until
    /// the terminal fragment has been seen
    pub nacks: Vec<u32>,
    /// Every fragment through the terminal one has arrived
    pub completed: bool,
}

/// Tracks fragment receipt for every in-flight message
#[derive(Debug)]
pub struct AckTracker {
    config: AckConfig,
    sequences: DashMap<MessageKey, SequenceState>,
}

impl AckTracker {
    /// Create a tracker
    #[must_use]
    pub fn new(config: AckConfig) -> Self {
        Self {
            config,
            sequences: DashMap::new(),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(AckConfig::default())
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &AckConfig {
        &self.config
    }

    /// Record receipt of `frag_seq` for `key`
    ///
    /// # Errors
    /// Returns `GatewayError::InvalidFrame` if `frag_seq` is outside
    /// `[0, max_fragments)`; no state is created for the message.
    pub fn note(&self, key: &MessageKey, frag_seq: u32, is_last: bool) -> GatewayResult<AckOutcome> {
        self.note_at(key, frag_seq, is_last, Instant::now())
    }

    /// Record receipt of `frag_seq` for `key` at `now`
    ///
    /// # Errors
    /// Returns `GatewayError::InvalidFrame` if `frag_seq` is outside
    /// `[0, max_fragments)`.
    pub fn note_at(
        &self,
        key: &MessageKey,
        frag_seq: u32,
        is_last: bool,
        now: Instant,
    ) -> GatewayResult<AckOutcome> {
        self.check_index(key, frag_seq)?;

        let outcome = {
            let mut state = self
                .sequences
                .entry(key.clone())
                .or_insert_with(|| SequenceState::new(now));

            state.last_seen = now;
            state.received.insert(frag_seq);
            if is_last {
                state.expected_last = Some(state.expected_last.map_or(frag_seq, |e| e.max(frag_seq)));
            }
            state.advance();

            AckOutcome {
                ack_up_to: state.ack_up_to,
                nacks: state.missing(self.config.max_nacks),
                completed: state.is_complete(),
            }
        };

        if outcome.completed {
            self.sequences.remove_if(key, |_, state| state.is_complete());
            debug!(message = %key, fragments = outcome.ack_up_to.map_or(0, |a| u64::from(a) + 1), "Message complete");
        }

        Ok(outcome)
    }

    /// Refuse fragment indices outside `[0, max_fragments)`
    ///
    /// # Errors
    /// Returns `GatewayError::InvalidFrame` for an out-of-range index.
    pub fn check_index(&self, key: &MessageKey, frag_seq: u32) -> GatewayResult<()> {
        if frag_seq < self.config.max_fragments {
            return Ok(());
        }
        debug!(message = %key, frag_seq, max = self.config.max_fragments, "Fragment index out of range");
        Err(GatewayError::InvalidFrame(format!(
            "frag_seq {frag_seq} exceeds the limit of {} fragments per message",
            self.config.max_fragments
        )))
    }

    /// Drop all state for a message
    pub fn forget(&self, key: &MessageKey) -> bool {
        self.sequences.remove(key).is_some()
    }

    /// Whether `key` currently has reassembly state
    #[must_use]
    pub fn is_tracking(&self, key: &MessageKey) -> bool {
        self.sequences.contains_key(key)
    }

    /// Number of in-flight messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    /// Whether no message is in flight
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Discard incomplete messages idle for longer than the configured timeout
    ///
    /// Returns the purged keys so callers can release related state.
    pub fn purge_idle_at(&self, now: Instant) -> Vec<MessageKey> {
        let idle = self.config.idle_timeout;
        let mut purged = Vec::new();
        self.sequences.retain(|key, state| {
            let keep = now.saturating_duration_since(state.last_seen) <= idle;
            if !keep {
                purged.push(key.clone());
            }
            keep
        });
        if !purged.is_empty() {
            debug!(count = purged.len(), "Purged idle message state");
        }
        purged
    }
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::with_defaults()
    }
}
