//! Dual-threshold backpressure watermark.
//!
//! Engages after `require_n` consecutive wait samples above `high_ms` and
//! stays engaged until a sample at or below `low_ms` is observed. Each
//! excursion above the high watermark produces exactly one engage event.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Watermark configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatermarkConfig {
    /// Samples above this are considered congested (ms)
    pub high_ms: f64,
    /// Samples at or below this clear congestion (ms)
    pub low_ms: f64,
    /// Consecutive high samples required to engage
    pub require_n: u32,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            high_ms: 250.0,
            low_ms: 50.0,
            require_n: 3,
        }
    }
}

/// State change produced by a sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WatermarkTransition {
    /// Congestion confirmed; senders should back off
    Engaged {
        /// Mean wait of the confirming streak, as a hint to senders
        suggested_wait_ms: u64,
    },
    /// Congestion cleared
    Released,
}

/// Point-in-time watermark state
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WatermarkSnapshot {
    /// Whether the watermark is engaged
    pub under_high: bool,
    /// Current streak of high samples
    pub consecutive_high: u32,
    /// Engage events since creation
    pub triggers: u64,
}

#[derive(Debug, Default)]
struct WatermarkState {
    consecutive_high: u32,
    streak_sum_ms: f64,
    under_high: bool,
    triggers: u64,
}

/// Hysteresis congestion detector over wait-time samples
#[derive(Debug)]
pub struct BackpressureWatermark {
    config: WatermarkConfig,
    state: Mutex<WatermarkState>,
}

impl BackpressureWatermark {
    /// Create a watermark
    #[must_use]
    pub fn new(config: WatermarkConfig) -> Self {
        Self {
            config,
            state: Mutex::new(WatermarkState::default()),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(WatermarkConfig::default())
    }

    /// Feed one wait-time sample in milliseconds
    pub fn observe(&self, sample_ms: f64) -> Option<WatermarkTransition> {
        let mut state = self.state.lock();

        if sample_ms > self.config.high_ms {
            state.consecutive_high = state.consecutive_high.saturating_add(1);
            state.streak_sum_ms += sample_ms;
            if !state.under_high && state.consecutive_high >= self.config.require_n {
                state.under_high = true;
                state.triggers += 1;
                let suggested_wait_ms =
                    (state.streak_sum_ms / f64::from(state.consecutive_high)).round() as u64;
                warn!(
                    consecutive_high = state.consecutive_high,
                    suggested_wait_ms,
                    high_ms = self.config.high_ms,
                    "Backpressure engaged"
                );
                return Some(WatermarkTransition::Engaged { suggested_wait_ms });
            }
            return None;
        }

        state.consecutive_high = 0;
        state.streak_sum_ms = 0.0;
        if state.under_high && sample_ms <= self.config.low_ms {
            state.under_high = false;
            info!(sample_ms, low_ms = self.config.low_ms, "Backpressure released");
            return Some(WatermarkTransition::Released);
        }
        None
    }

    /// Whether the watermark is currently engaged
    #[must_use]
    pub fn is_engaged(&self) -> bool {
        self.state.lock().under_high
    }

    /// Current state
    #[must_use]
    pub fn snapshot(&self) -> WatermarkSnapshot {
        let state = self.state.lock();
        WatermarkSnapshot {
            under_high: state.under_high,
            consecutive_high: state.consecutive_high,
            triggers: state.triggers,
        }
    }
}

impl Default for BackpressureWatermark {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engaged(transitions: &[Option<WatermarkTransition>]) -> usize {
        transitions
            .iter()
            .filter(|t| matches!(t, Some(WatermarkTransition::Engaged { .. })))
            .count()
    }

    #[test]
    fn test_three_high_samples_trigger_once() {
        let wm = BackpressureWatermark::with_defaults();
        let out: Vec<_> = [300.0, 310.0, 320.0, 400.0, 500.0]
            .iter()
            .map(|s| wm.observe(*s))
            .collect();
        assert_eq!(engaged(&out), 1);
        assert_eq!(
            out[2],
            Some(WatermarkTransition::Engaged {
                suggested_wait_ms: 310
            })
        );
        assert!(wm.is_engaged());
    }

    #[test]
    fn test_no_retrigger_until_low_sample() {
        let wm = BackpressureWatermark::with_defaults();
        for s in [300.0, 300.0, 300.0] {
            wm.observe(s);
        }
        // Dips between the watermarks neither clear nor re-trigger.
        let mid: Vec<_> = [100.0, 300.0, 300.0, 300.0]
            .iter()
            .map(|s| wm.observe(*s))
            .collect();
        assert_eq!(engaged(&mid), 0);
        assert!(wm.is_engaged());

        assert_eq!(wm.observe(40.0), Some(WatermarkTransition::Released));
        assert!(!wm.is_engaged());

        let again: Vec<_> = [300.0, 300.0, 300.0]
            .iter()
            .map(|s| wm.observe(*s))
            .collect();
        assert_eq!(engaged(&again), 1);
        assert_eq!(wm.snapshot().triggers, 2);
    }

    #[test]
    fn test_streak_broken_by_normal_sample() {
        let wm = BackpressureWatermark::with_defaults();
        assert!(wm.observe(300.0).is_none());
        assert!(wm.observe(300.0).is_none());
        assert!(wm.observe(250.0).is_none());
        assert!(wm.observe(300.0).is_none());
        assert_eq!(wm.snapshot().consecutive_high, 1);
        assert!(!wm.is_engaged());
    }

    #[test]
    fn test_low_sample_while_clear_is_silent() {
        let wm = BackpressureWatermark::with_defaults();
        assert!(wm.observe(10.0).is_none());
    }
}
