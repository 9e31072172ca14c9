//! Fixed-bucket queue-wait histogram.

use serde::Serialize;

/// Upper bounds of the wait buckets in milliseconds
///
/// Samples above the last bound land in an overflow bucket.
pub const WAIT_BUCKETS_MS: [f64; 9] = [1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0];

/// Wait-time percentiles in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WaitPercentiles {
    /// Median
    pub p50: f64,
    /// 90th percentile
    pub p90: f64,
    /// 95th percentile
    pub p95: f64,
    /// 99th percentile
    pub p99: f64,
}

/// Histogram of queue waits
#[derive(Debug, Clone, Default)]
pub struct WaitHistogram {
    counts: [u64; WAIT_BUCKETS_MS.len() + 1],
    total: u64,
    max_ms: f64,
}

impl WaitHistogram {
    /// Create an empty histogram
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a wait in milliseconds
    pub fn record(&mut self, wait_ms: f64) {
        let wait_ms = wait_ms.max(0.0);
        let bucket = WAIT_BUCKETS_MS
            .iter()
            .position(|bound| wait_ms <= *bound)
            .unwrap_or(WAIT_BUCKETS_MS.len());
        self.counts[bucket] += 1;
        self.total += 1;
        self.max_ms = self.max_ms.max(wait_ms);
    }

    /// Number of recorded samples
    #[must_use]
    pub fn count(&self) -> u64 {
        self.total
    }

    /// Upper bound of the bucket holding quantile `q` (0.0-1.0)
    ///
    /// The overflow bucket reports the largest sample seen.
    #[must_use]
    pub fn percentile(&self, q: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let rank = ((q.clamp(0.0, 1.0) * self.total as f64).ceil() as u64).max(1);
        let mut seen = 0;
        for (idx, count) in self.counts.iter().enumerate() {
            seen += count;
            if seen >= rank {
                return WAIT_BUCKETS_MS.get(idx).copied().unwrap_or(self.max_ms);
            }
        }
        self.max_ms
    }

    /// p50/p90/p95/p99
    #[must_use]
    pub fn percentiles(&self) -> WaitPercentiles {
        WaitPercentiles {
            p50: self.percentile(0.50),
            p90: self.percentile(0.90),
            p95: self.percentile(0.95),
            p99: self.percentile(0.99),
        }
    }
}
