//! Throttled WINDOW_UPDATE emission.
//!
//! An update is due when the value moved by at least `min_delta` since the
//! previous observation, or when `min_interval` has passed since the last
//! emitted update. The delta rule keeps peers current on real changes; the
//! cadence rule keeps an idle peer from going stale.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Window update configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowUpdateConfig {
    /// Minimum absolute change that triggers an update
    pub min_delta: u64,
    /// Maximum time between two updates to the same session
    #[serde(with = "humantime_serde")]
    pub min_interval: Duration,
}

impl Default for WindowUpdateConfig {
    fn default() -> Self {
        Self {
            min_delta: 1,
            min_interval: Duration::from_millis(500),
        }
    }
}

/// A window update due for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowUpdate {
    /// Session the update is for
    pub session_id: String,
    /// Previously observed value
    pub before: u64,
    /// Current value
    pub after: u64,
    /// Emission time
    pub at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    last_value: u64,
    last_emit: Instant,
    last_seen: Instant,
}

/// Decides when a session's peer should be told about window changes
#[derive(Debug)]
pub struct WindowUpdateEmitter {
    config: WindowUpdateConfig,
    baselines: DashMap<String, Baseline>,
}

impl WindowUpdateEmitter {
    /// Create an emitter
    #[must_use]
    pub fn new(config: WindowUpdateConfig) -> Self {
        Self {
            config,
            baselines: DashMap::new(),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(WindowUpdateConfig::default())
    }

    /// Observe `current` for `session` now
    pub fn maybe_emit(&self, session: &str, current: u64) -> Option<WindowUpdate> {
        self.maybe_emit_at(session, current, Instant::now())
    }

    /// Observe `current` for `session` at `now`
    ///
    /// The first observation for a session only records the baseline.
    pub fn maybe_emit_at(&self, session: &str, current: u64, now: Instant) -> Option<WindowUpdate> {
        let mut baseline = match self.baselines.entry(session.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Baseline {
                    last_value: current,
                    last_emit: now,
                    last_seen: now,
                });
                return None;
            }
            dashmap::mapref::entry::Entry::Occupied(occupied) => occupied.into_ref(),
        };

        let before = baseline.last_value;
        let moved = before.abs_diff(current) >= self.config.min_delta;
        let stale = now.saturating_duration_since(baseline.last_emit) >= self.config.min_interval;

        baseline.last_value = current;
        baseline.last_seen = now;
        if !(moved || stale) {
            return None;
        }
        baseline.last_emit = now;

        trace!(session = %session, before, after = current, moved, stale, "Window update due");
        Some(WindowUpdate {
            session_id: session.to_string(),
            before,
            after: current,
            at: now,
        })
    }

    /// Forget a session's baseline
    pub fn forget(&self, session: &str) -> bool {
        self.baselines.remove(session).is_some()
    }

    /// Forget baselines not observed for at least `idle`
    ///
    /// A purged session starts over with a fresh baseline. Returns the number
    /// of sessions removed.
    pub fn purge_idle_at(&self, now: Instant, idle: Duration) -> usize {
        let before = self.baselines.len();
        self.baselines
            .retain(|_, b| now.saturating_duration_since(b.last_seen) < idle);
        let purged = before.saturating_sub(self.baselines.len());
        if purged > 0 {
            debug!(purged, "Purged idle window-update baselines");
        }
        purged
    }

    /// Number of sessions with a baseline
    #[must_use]
    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    /// Whether no session has a baseline
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }
}

impl Default for WindowUpdateEmitter {
    fn default() -> Self {
        Self::with_defaults()
    }
}
