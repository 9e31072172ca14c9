//! Agent-reported throughput overrides.
//!
//! A served agent can tell the gateway to slow down or stop sending it work.
//! The reported status caps the number of items the scheduler lets a session
//! have in service at once.
//!
//! A reported status holds until the agent reports again or, once purged as
//! idle, the session falls back to READY.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Status reported by an agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentStatus {
    /// Accepting work normally
    #[default]
    Ready,
    /// Not accepting work
    Busy,
    /// Stopping after a grace period
    Pause,
    /// Finishing outstanding work, one item at a time
    Draining,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ready => "READY",
            Self::Busy => "BUSY",
            Self::Pause => "PAUSE",
            Self::Draining => "DRAINING",
        };
        f.write_str(name)
    }
}

/// Agent status configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentStatusConfig {
    /// How long a paused session keeps being served
    #[serde(with = "humantime_serde")]
    pub pause_grace: Duration,
}

impl Default for AgentStatusConfig {
    fn default() -> Self {
        Self {
            pause_grace: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AgentStatusRecord {
    status: AgentStatus,
    pause_grace_until: Option<Instant>,
    updated: Instant,
}

/// Per-session agent status
#[derive(Debug)]
pub struct AgentStatusRegistry {
    config: AgentStatusConfig,
    records: DashMap<String, AgentStatusRecord>,
}

impl AgentStatusRegistry {
    /// Create a registry
    #[must_use]
    pub fn new(config: AgentStatusConfig) -> Self {
        Self {
            config,
            records: DashMap::new(),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(AgentStatusConfig::default())
    }

    /// Set a session's status now, returning the previous one
    pub fn set_status(&self, session: &str, status: AgentStatus) -> AgentStatus {
        self.set_status_at(session, status, Instant::now())
    }

    /// Set a session's status at `now`, returning the previous one
    ///
    /// Entering PAUSE starts the grace timer; re-reporting PAUSE keeps the
    /// running timer. Leaving PAUSE clears it.
    pub fn set_status_at(&self, session: &str, status: AgentStatus, now: Instant) -> AgentStatus {
        let mut record = self
            .records
            .entry(session.to_string())
            .or_insert(AgentStatusRecord {
                status: AgentStatus::Ready,
                pause_grace_until: None,
                updated: now,
            });
        let previous = record.status;

        let grace_until = match (previous, status) {
            (AgentStatus::Pause, AgentStatus::Pause) => record.pause_grace_until,
            (_, AgentStatus::Pause) => Some(now + self.config.pause_grace),
            _ => None,
        };
        record.status = status;
        record.pause_grace_until = grace_until;
        record.updated = now;

        if previous != status {
            info!(session = %session, from = %previous, to = %status, "Agent status changed");
        }
        previous
    }

    /// Current status; unknown sessions are READY
    #[must_use]
    pub fn status(&self, session: &str) -> AgentStatus {
        self.records
            .get(session)
            .map_or(AgentStatus::Ready, |r| r.status)
    }

    /// Effective number of items `session` may have in service now
    #[must_use]
    pub fn effective_window(&self, session: &str, router_allowed: u32, suggested: Option<u32>) -> u32 {
        self.effective_window_at(session, router_allowed, suggested, Instant::now())
    }

    /// Effective number of items `session` may have in service at `now`
    #[must_use]
    pub fn effective_window_at(
        &self,
        session: &str,
        router_allowed: u32,
        suggested: Option<u32>,
        now: Instant,
    ) -> u32 {
        let record = self.records.get(session).map(|r| *r);
        let open = router_allowed.min(suggested.unwrap_or(router_allowed));

        match record {
            None => open,
            Some(AgentStatusRecord {
                status,
                pause_grace_until,
                ..
            }) => match status {
                AgentStatus::Ready => open,
                AgentStatus::Busy => 0,
                AgentStatus::Draining => router_allowed.min(1),
                AgentStatus::Pause => match pause_grace_until {
                    Some(until) if now < until => open,
                    _ => 0,
                },
            },
        }
    }

    /// System-wide throughput multiplier: `1 - (busy + paused) / tracked`
    #[must_use]
    pub fn capacity_reduction_factor(&self) -> f64 {
        let total = self.records.len();
        if total == 0 {
            return 1.0;
        }
        let throttled = self
            .records
            .iter()
            .filter(|r| matches!(r.status, AgentStatus::Busy | AgentStatus::Pause))
            .count();
        1.0 - throttled as f64 / total as f64
    }

    /// Forget a session
    pub fn remove(&self, session: &str) -> bool {
        self.records.remove(session).is_some()
    }

    /// Forget statuses not reported for at least `idle`
    ///
    /// Purged sessions are READY again. Returns the number removed.
    pub fn purge_idle_at(&self, now: Instant, idle: Duration) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, r| now.saturating_duration_since(r.updated) < idle);
        let purged = before.saturating_sub(self.records.len());
        if purged > 0 {
            debug!(purged, remaining = self.records.len(), "Purged stale agent statuses");
        }
        purged
    }

    /// Number of sessions with a reported status
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no session has reported a status
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for AgentStatusRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
