//! Burn-rate spike detection.
//!
//! Each session keeps an EWMA of its burn rate and a bounded history of raw
//! samples. A sample is a spike when its z-score against the history exceeds
//! the threshold, the history is long enough to be meaningful, and the
//! session is not inside the cooldown of a previous spike.
//!
//! The guard is advisory: it reports spikes and never blocks traffic.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Anomaly detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// EWMA smoothing factor in (0, 1]
    pub alpha: f64,
    /// z-score above which a sample is a spike
    pub z_threshold: f64,
    /// Samples needed before spikes are reported
    pub min_samples: usize,
    /// History length; oldest samples are dropped
    pub max_samples: usize,
    /// Quiet period after a reported spike
    #[serde(with = "humantime_serde")]
    pub spike_cooldown: Duration,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            alpha: 0.2,
            z_threshold: 3.0,
            min_samples: 8,
            max_samples: 100,
            spike_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct AnomalyState {
    ewma: Option<f64>,
    variance: f64,
    history: VecDeque<f64>,
    last_spike: Option<Instant>,
    spikes: u64,
    last_seen: Option<Instant>,
}

impl AnomalyState {
    /// z-score of `x` against the current history
    fn z_score(&self, x: f64) -> f64 {
        let n = self.history.len();
        if n == 0 {
            return 0.0;
        }
        let mean = self.history.iter().sum::<f64>() / n as f64;
        let variance = self.history.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64;
        let std = variance.sqrt();
        if std > f64::EPSILON {
            (x - mean) / std
        } else if x > mean {
            f64::INFINITY
        } else {
            0.0
        }
    }

    fn update_ewma(&mut self, x: f64, alpha: f64) {
        match self.ewma {
            None => {
                self.ewma = Some(x);
                self.variance = 0.0;
            }
            Some(prev) => {
                let diff = x - prev;
                let next = alpha.mul_add(diff, prev);
                self.variance = (1.0 - alpha) * alpha.mul_add(diff * diff, self.variance);
                self.ewma = Some(next);
            }
        }
    }

    fn in_cooldown(&self, now: Instant, cooldown: Duration) -> bool {
        self.last_spike
            .is_some_and(|at| now.saturating_duration_since(at) < cooldown)
    }
}

/// Point-in-time anomaly state of one session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalySnapshot {
    /// Session identifier
    pub session_id: String,
    /// Smoothed burn rate
    pub ewma: f64,
    /// Exponentially weighted variance
    pub variance: f64,
    /// Samples in the history
    pub samples: usize,
    /// Spikes reported since creation
    pub spikes: u64,
    /// Whether the session is inside a spike cooldown
    pub flagged: bool,
}

/// Per-session burn-rate spike detector
#[derive(Debug)]
pub struct AnomalyGuard {
    config: AnomalyConfig,
    states: DashMap<String, AnomalyState>,
}

impl AnomalyGuard {
    /// Create a guard
    #[must_use]
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(AnomalyConfig::default())
    }

    /// Feed a burn-rate sample; true when it is a reportable spike
    pub fn check_for_spike(&self, session: &str, burn_rate: f64) -> bool {
        self.check_for_spike_at(session, burn_rate, Instant::now())
    }

    /// Feed a burn-rate sample at `now`
    ///
    /// The sample is scored against the history that precedes it, then
    /// appended to the history.
    pub fn check_for_spike_at(&self, session: &str, burn_rate: f64, now: Instant) -> bool {
        let mut state = self.states.entry(session.to_string()).or_default();

        let prior = state.history.len();
        let z = state.z_score(burn_rate);
        state.last_seen = Some(now);

        state.update_ewma(burn_rate, self.config.alpha);
        state.history.push_back(burn_rate);
        while state.history.len() > self.config.max_samples {
            state.history.pop_front();
        }

        if z <= self.config.z_threshold || prior < self.config.min_samples {
            return false;
        }
        if state.in_cooldown(now, self.config.spike_cooldown) {
            debug!(session = %session, burn_rate, z, "Spike suppressed by cooldown");
            return false;
        }

        state.last_spike = Some(now);
        state.spikes += 1;
        warn!(
            session = %session,
            burn_rate,
            z,
            ewma = state.ewma.unwrap_or_default(),
            "Burn-rate spike detected"
        );
        true
    }

    /// Current state of one session
    #[must_use]
    pub fn snapshot(&self, session: &str) -> Option<AnomalySnapshot> {
        self.snapshot_at(session, Instant::now())
    }

    /// Current state of one session at `now`
    #[must_use]
    pub fn snapshot_at(&self, session: &str, now: Instant) -> Option<AnomalySnapshot> {
        let state = self.states.get(session)?;
        Some(AnomalySnapshot {
            session_id: session.to_string(),
            ewma: state.ewma.unwrap_or_default(),
            variance: state.variance,
            samples: state.history.len(),
            spikes: state.spikes,
            flagged: state.in_cooldown(now, self.config.spike_cooldown),
        })
    }

    /// Snapshots of every tracked session, sorted by session
    #[must_use]
    pub fn snapshots(&self) -> Vec<AnomalySnapshot> {
        let now = Instant::now();
        let mut sessions: Vec<String> = self.states.iter().map(|e| e.key().clone()).collect();
        sessions.sort();
        sessions
            .iter()
            .filter_map(|s| self.snapshot_at(s, now))
            .collect()
    }

    /// Forget a session
    pub fn remove(&self, session: &str) -> bool {
        self.states.remove(session).is_some()
    }

    /// Forget sessions with no sample for at least `idle`
    ///
    /// Sessions inside a spike cooldown are kept. Returns the number removed.
    pub fn purge_idle_at(&self, now: Instant, idle: Duration) -> usize {
        let before = self.states.len();
        self.states.retain(|_, state| {
            state.in_cooldown(now, self.config.spike_cooldown)
                || state
                    .last_seen
                    .is_some_and(|at| now.saturating_duration_since(at) < idle)
        });
        let purged = before.saturating_sub(self.states.len());
        if purged > 0 {
            debug!(purged, remaining = self.states.len(), "Purged idle anomaly state");
        }
        purged
    }

    /// Number of tracked sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether no session is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl Default for AnomalyGuard {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STABLE: [f64; 8] = [9.5, 10.5, 10.0, 9.8, 10.2, 10.0, 9.9, 10.1];

    fn warmed(guard: &AnomalyGuard, session: &str, now: Instant) {
        for x in STABLE {
            assert!(!guard.check_for_spike_at(session, x, now));
        }
    }

    #[test]
    fn test_spike_then_cooldown_then_spike() {
        let guard = AnomalyGuard::with_defaults();
        let t0 = Instant::now();
        warmed(&guard, "s1", t0);

        assert!(guard.check_for_spike_at("s1", 50.0, t0));
        assert!(!guard.check_for_spike_at("s1", 50.0, t0 + Duration::from_secs(1)));

        let later = t0 + Duration::from_secs(61);
        assert!(guard.check_for_spike_at("s1", 500.0, later));
    }

    #[test]
    fn test_no_spike_before_min_samples() {
        let guard = AnomalyGuard::with_defaults();
        let t0 = Instant::now();
        for x in &STABLE[..7] {
            guard.check_for_spike_at("s1", *x, t0);
        }
        assert!(!guard.check_for_spike_at("s1", 1_000.0, t0));
    }

    #[test]
    fn test_normal_sample_is_not_spike() {
        let guard = AnomalyGuard::with_defaults();
        let t0 = Instant::now();
        warmed(&guard, "s1", t0);
        assert!(!guard.check_for_spike_at("s1", 10.3, t0));
    }

    #[test]
    fn test_sessions_are_independent() {
        let guard = AnomalyGuard::with_defaults();
        let t0 = Instant::now();
        warmed(&guard, "a", t0);
        warmed(&guard, "b", t0);
        assert!(guard.check_for_spike_at("a", 50.0, t0));
        assert!(guard.check_for_spike_at("b", 50.0, t0));
    }

    #[test]
    fn test_history_is_bounded() {
        let guard = AnomalyGuard::new(AnomalyConfig {
            max_samples: 10,
            ..AnomalyConfig::default()
        });
        for i in 0..25 {
            guard.check_for_spike("s1", f64::from(i));
        }
        let snap = guard.snapshot("s1").expect("tracked");
        assert_eq!(snap.samples, 10);
    }

    #[test]
    fn test_ewma_first_sample_initialises() {
        let guard = AnomalyGuard::new(AnomalyConfig {
            alpha: 0.5,
            ..AnomalyConfig::default()
        });
        guard.check_for_spike("s1", 4.0);
        assert!((guard.snapshot("s1").expect("tracked").ewma - 4.0).abs() < 1e-12);
        guard.check_for_spike("s1", 8.0);
        assert!((guard.snapshot("s1").expect("tracked").ewma - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_snapshot_flags_cooldown() {
        let guard = AnomalyGuard::with_defaults();
        let t0 = Instant::now();
        warmed(&guard, "s1", t0);
        guard.check_for_spike_at("s1", 50.0, t0);

        let snap = guard.snapshot_at("s1", t0).expect("tracked");
        assert!(snap.flagged);
        assert_eq!(snap.spikes, 1);
        assert!(!guard.snapshot_at("s1", t0 + Duration::from_secs(60)).expect("tracked").flagged);
        assert!(guard.snapshot("missing").is_none());
    }

    #[test]
    fn test_purge_idle_spares_cooldown() {
        let guard = AnomalyGuard::new(AnomalyConfig {
            spike_cooldown: Duration::from_secs(600),
            ..AnomalyConfig::default()
        });
        let t0 = Instant::now();
        warmed(&guard, "quiet", t0);
        warmed(&guard, "spiky", t0);
        assert!(guard.check_for_spike_at("spiky", 50.0, t0));

        let idle = Duration::from_secs(300);
        assert_eq!(guard.purge_idle_at(t0 + Duration::from_secs(100), idle), 0);
        assert_eq!(guard.purge_idle_at(t0 + Duration::from_secs(400), idle), 1);
        assert!(guard.snapshot("quiet").is_none());
        assert_eq!(guard.len(), 1);
        assert_eq!(guard.purge_idle_at(t0 + Duration::from_secs(700), idle), 1);
        assert!(guard.is_empty());
    }
}
