//! Admission window store.
//!
//! The receive-window analog for completion traffic, generalized to three
//! independent axes: outstanding requests, outstanding tokens and
//! outstanding cost. Each admission key (usually a session, or session plus
//! stream) has one [`WindowEntry`] compared against the limits the sender
//! declared in its frames.
//!
//! Empty entries that have not been touched for a while can be dropped with
//! [`WindowStore::purge_idle_at`].

use dashmap::DashMap;
use gateway_core::Window;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Current occupancy of one admission key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowEntry {
    /// Outstanding requests
    pub inflight: u32,
    /// Outstanding tokens
    pub tokens: u64,
    /// Outstanding cost in micro-dollars
    pub usd_micros: u64,
}

impl WindowEntry {
    fn fits(&self, window: &Window, est_tokens: u64, est_usd_micros: u64) -> bool {
        self.inflight < window.max_parallel
            && self
                .tokens
                .checked_add(est_tokens)
                .is_some_and(|t| t <= window.max_tokens)
            && self
                .usd_micros
                .checked_add(est_usd_micros)
                .is_some_and(|u| u <= window.max_usd_micros)
    }
}

#[derive(Debug)]
struct Slot {
    entry: WindowEntry,
    last_seen: Instant,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            entry: WindowEntry::default(),
            last_seen: Instant::now(),
        }
    }
}

/// Per-key capacity ledger
#[derive(Debug, Default)]
pub struct WindowStore {
    entries: DashMap<String, Slot>,
}

impl WindowStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to admit one request against `window`
    ///
    /// All three counters are updated together or not at all.
    pub fn admit(&self, key: &str, window: &Window, est_tokens: u64, est_usd_micros: u64) -> bool {
        let mut slot = self.entries.entry(key.to_string()).or_default();
        slot.last_seen = Instant::now();
        let entry = &mut slot.entry;
        if !entry.fits(window, est_tokens, est_usd_micros) {
            debug!(
                key = %key,
                inflight = entry.inflight,
                tokens = entry.tokens,
                usd_micros = entry.usd_micros,
                "Admission window full"
            );
            return false;
        }
        entry.inflight += 1;
        entry.tokens += est_tokens;
        entry.usd_micros += est_usd_micros;
        true
    }

    /// Release one request and its reserved tokens and cost
    ///
    /// Counters never go below zero. Underflow means the caller released
    /// more than it admitted; it is logged and clamped.
    pub fn release(&self, key: &str, tokens: u64, usd_micros: u64) {
        let mut slot = self.entries.entry(key.to_string()).or_default();
        slot.last_seen = Instant::now();
        let entry = &mut slot.entry;
        if entry.inflight == 0 || entry.tokens < tokens || entry.usd_micros < usd_micros {
            warn!(
                key = %key,
                inflight = entry.inflight,
                tokens = entry.tokens,
                release_tokens = tokens,
                usd_micros = entry.usd_micros,
                release_usd_micros = usd_micros,
                "Window release underflow, clamping to zero"
            );
        }
        entry.inflight = entry.inflight.saturating_sub(1);
        entry.tokens = entry.tokens.saturating_sub(tokens);
        entry.usd_micros = entry.usd_micros.saturating_sub(usd_micros);
    }

    /// Current occupancy of `key`
    #[must_use]
    pub fn entry(&self, key: &str) -> WindowEntry {
        self.entries.get(key).map(|s| s.entry).unwrap_or_default()
    }

    /// Drop the ledger for `key`
    pub fn remove(&self, key: &str) -> Option<WindowEntry> {
        self.entries.remove(key).map(|(_, slot)| slot.entry)
    }

    /// Drop empty ledgers untouched for at least `idle`
    ///
    /// Entries with outstanding reservations are kept. Returns the number of
    /// keys removed.
    pub fn purge_idle_at(&self, now: Instant, idle: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, slot| {
            slot.entry != WindowEntry::default()
                || now.saturating_duration_since(slot.last_seen) < idle
        });
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            debug!(purged, remaining = self.entries.len(), "Purged idle admission windows");
        }
        purged
    }

    /// Number of tracked keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Occupancy of every tracked key
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, WindowEntry)> {
        let mut all: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().entry))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_then_release_restores_entry() {
        let store = WindowStore::new();
        let window = Window::new(2, 1_000, 5_000);
        store.admit("s1", &window, 100, 500);
        let before = store.entry("s1");

        assert!(store.admit("s1", &window, 250, 1_200));
        store.release("s1", 250, 1_200);
        assert_eq!(store.entry("s1"), before);
    }

    #[test]
    fn test_parallel_limit() {
        let store = WindowStore::new();
        let window = Window::new(1, 1_000, 1_000);
        assert!(store.admit("s1", &window, 0, 0));
        assert!(!store.admit("s1", &window, 0, 0));
        store.release("s1", 0, 0);
        assert!(store.admit("s1", &window, 0, 0));
    }

    #[test]
    fn test_rejection_leaves_entry_untouched() {
        let store = WindowStore::new();
        let window = Window::new(4, 1_000, 1_000);
        assert!(store.admit("s1", &window, 900, 100));
        let before = store.entry("s1");

        assert!(!store.admit("s1", &window, 101, 0), "token axis");
        assert!(!store.admit("s1", &window, 0, 901), "cost axis");
        assert_eq!(store.entry("s1"), before);
    }

    #[test]
    fn test_token_limit_is_inclusive() {
        let store = WindowStore::new();
        let window = Window::new(4, 1_000, u64::MAX);
        assert!(store.admit("s1", &window, 1_000, 0));
    }

    #[test]
    fn test_overflowing_estimate_is_rejected() {
        let store = WindowStore::new();
        let window = Window::new(4, u64::MAX, u64::MAX);
        assert!(store.admit("s1", &window, u64::MAX, 0));
        assert!(!store.admit("s1", &window, 1, 0));
    }

    #[test]
    fn test_double_release_clamps() {
        let store = WindowStore::new();
        let window = Window::new(2, 100, 100);
        assert!(store.admit("s1", &window, 10, 10));
        store.release("s1", 10, 10);
        store.release("s1", 10, 10);
        assert_eq!(store.entry("s1"), WindowEntry::default());
    }

    #[test]
    fn test_keys_are_independent() {
        let store = WindowStore::new();
        let window = Window::new(1, 100, 100);
        assert!(store.admit("s1", &window, 0, 0));
        assert!(store.admit("s2", &window, 0, 0));
        assert_eq!(store.len(), 2);
        assert_eq!(store.snapshot()[0].0, "s1");
    }

    #[test]
    fn test_purge_idle_keeps_outstanding_reservations() {
        let store = WindowStore::new();
        let window = Window::new(2, 100, 100);
        assert!(store.admit("busy", &window, 10, 10));
        assert!(store.admit("done", &window, 10, 10));
        store.release("done", 10, 10);

        let idle = Duration::from_secs(600);
        assert_eq!(store.purge_idle_at(Instant::now(), idle), 0);
        assert_eq!(store.purge_idle_at(Instant::now() + idle, idle), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.entry("busy").inflight, 1);
    }
}
