//! Weighted fair admission scheduler.
//!
//! Sessions contend for a fixed number of serving slots. Under contention
//! slots are granted in start-time fair queuing order: every request is
//! stamped with a virtual finish tag `max(V, last_finish(session)) +
//! cost / weight` and the smallest eligible tag is served next. A session
//! with weight 4 therefore receives roughly four times the grants of a
//! weight-1 session while both have work queued.
//!
//! A session is eligible only while its in-service count is below the
//! effective window reported by [`AgentStatusRegistry`].
//!
//! A caller that leaves the queue without a grant hands its finish tag back,
//! so timeouts and cancellations do not push the session's later requests
//! behind other sessions.

use crate::agent_status::{AgentStatus, AgentStatusRegistry};
use crate::fairness::jains_index;
use crate::histogram::{WaitHistogram, WaitPercentiles};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Fixed-point scale for virtual time
const TAG_SCALE: f64 = 1_000_000.0;

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Total serving slots shared by all sessions
    pub capacity: usize,
    /// Most items one session may have in service before agent overrides
    pub per_session_limit: u32,
    /// Weight of sessions without an explicit weight
    pub default_weight: f64,
    /// Explicit per-session weights
    pub weights: HashMap<String, f64>,
    /// Wait samples kept per session
    pub recent_waits: usize,
    /// Default `acquire` timeout used by callers
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            capacity: 8,
            per_session_limit: 4,
            default_weight: 1.0,
            weights: HashMap::new(),
            recent_waits: 32,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of an `acquire` attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// A slot was granted after waiting `waited`
    Granted {
        /// Time spent queued
        waited: Duration,
    },
    /// No slot was granted before the timeout
    TimedOut {
        /// Time spent queued
        waited: Duration,
    },
}

impl AcquireOutcome {
    /// Whether a slot was granted
    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }

    /// Time spent queued
    #[must_use]
    pub fn waited(&self) -> Duration {
        match self {
            Self::Granted { waited } | Self::TimedOut { waited } => *waited,
        }
    }
}

/// Per-session scheduling statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    /// Session identifier
    pub session_id: String,
    /// Scheduling weight
    pub weight: f64,
    /// Completed grants
    pub served: u64,
    /// Items currently in service
    pub active: u32,
    /// Mean of the recent queue waits (ms)
    pub mean_recent_wait_ms: f64,
}

/// Point-in-time scheduler statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerSnapshot {
    /// Total serving slots
    pub capacity: usize,
    /// Slots in use
    pub in_service: usize,
    /// Callers waiting for a slot
    pub queued: usize,
    /// Jain's index over `served`
    pub jains_index: f64,
    /// Queue-wait percentiles
    pub wait_percentiles: WaitPercentiles,
    /// Per-session statistics
    pub sessions: Vec<SessionSnapshot>,
}

#[derive(Debug)]
struct SessionState {
    weight: f64,
    served: u64,
    active: u32,
    recent_waits: VecDeque<f64>,
    last_finish: u64,
    suggested: Option<u32>,
    last_seen: Instant,
}

#[derive(Debug)]
struct Waiter {
    session: String,
    start: u64,
    finish: u64,
    /// Session finish tag before this request was stamped
    prev_finish: u64,
    enqueued: Instant,
    grant: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
struct SchedulerInner {
    in_service: usize,
    virtual_time: u64,
    next_ticket: u64,
    sessions: HashMap<String, SessionState>,
    /// (finish tag, ticket), smallest first
    order: BTreeSet<(u64, u64)>,
    waiters: HashMap<u64, Waiter>,
    histogram: WaitHistogram,
}

enum Enqueued {
    Granted,
    Queued(u64, oneshot::Receiver<()>),
}

/// Weighted fair queuing across sessions
#[derive(Debug)]
pub struct FairScheduler {
    config: SchedulerConfig,
    agent_status: Arc<AgentStatusRegistry>,
    inner: Mutex<SchedulerInner>,
}

impl FairScheduler {
    /// Create a scheduler
    #[must_use]
    pub fn new(config: SchedulerConfig, agent_status: Arc<AgentStatusRegistry>) -> Self {
        Self {
            config,
            agent_status,
            inner: Mutex::new(SchedulerInner::default()),
        }
    }

    /// Create with default configuration and a private status registry
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(
            SchedulerConfig::default(),
            Arc::new(AgentStatusRegistry::with_defaults()),
        )
    }

    /// Scheduler configuration
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Agent status registry consulted for effective windows
    #[must_use]
    pub fn agent_status(&self) -> &Arc<AgentStatusRegistry> {
        &self.agent_status
    }

    /// Try to obtain a serving slot for `session`, waiting up to `timeout`
    pub async fn acquire(&self, session: &str, cost: f64, timeout: Duration) -> bool {
        self.acquire_timed(session, cost, timeout).await.is_granted()
    }

    /// Like [`acquire`](Self::acquire), also reporting the time spent queued
    ///
    /// A timed-out caller is removed from the queue without being granted.
    /// Dropping the returned future behaves the same way; if a grant raced
    /// with the drop, the slot is handed back without counting as served.
    pub async fn acquire_timed(&self, session: &str, cost: f64, timeout: Duration) -> AcquireOutcome {
        let started = Instant::now();
        let (ticket, rx) = match self.enqueue(session, cost, started) {
            Enqueued::Granted => {
                return AcquireOutcome::Granted {
                    waited: Duration::ZERO,
                }
            }
            Enqueued::Queued(ticket, rx) => (ticket, rx),
        };

        let mut pending = PendingAcquire {
            scheduler: self,
            ticket,
            session,
            rx,
            armed: true,
        };

        let granted = match tokio::time::timeout(timeout, &mut pending.rx).await {
            Ok(Ok(())) => {
                pending.armed = false;
                true
            }
            // Timed out, or the grant channel closed: leave the queue unless
            // a grant already went through.
            Ok(Err(_)) | Err(_) => !pending.cancel(),
        };

        let waited = started.elapsed();
        if granted {
            AcquireOutcome::Granted { waited }
        } else {
            debug!(session = %session, waited_ms = waited.as_millis() as u64, "Acquire timed out");
            AcquireOutcome::TimedOut { waited }
        }
    }

    /// Free a slot held by `session` and count it as served
    pub fn release(&self, session: &str) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let in_service = inner.in_service;
        match inner.sessions.get_mut(session) {
            Some(state) if state.active > 0 && in_service > 0 => {
                state.active -= 1;
                state.served += 1;
                state.last_seen = Instant::now();
                inner.in_service -= 1;
            }
            _ => {
                warn!(session = %session, in_service, "Release without a matching acquire");
                return;
            }
        }
        self.dispatch_locked(inner);
    }

    /// Free a slot held by `session` whose work was abandoned
    ///
    /// Unlike [`release`](Self::release) the item is not counted as served.
    pub fn abandon(&self, session: &str) {
        let mut inner = self.inner.lock();
        let held = inner.in_service > 0 && Self::active_in(&inner, session) > 0;
        if !held {
            warn!(
                session = %session,
                in_service = inner.in_service,
                "Abandon without a matching acquire"
            );
            return;
        }
        Self::ungrant_locked(&mut inner, session);
        debug!(session = %session, "Serving slot abandoned");
        self.dispatch_locked(&mut inner);
    }

    /// Drop state of sessions idle for at least `idle`
    ///
    /// Sessions with items in service or callers queued are kept. Returns the
    /// number of sessions removed.
    pub fn purge_idle(&self, idle: Duration) -> usize {
        self.purge_idle_at(Instant::now(), idle)
    }

    /// Like [`purge_idle`](Self::purge_idle) at an explicit instant
    pub fn purge_idle_at(&self, now: Instant, idle: Duration) -> usize {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let waiting: HashSet<&str> =
            inner.waiters.values().map(|w| w.session.as_str()).collect();
        let before = inner.sessions.len();
        inner.sessions.retain(|id, state| {
            state.active > 0
                || waiting.contains(id.as_str())
                || now.saturating_duration_since(state.last_seen) < idle
        });
        let purged = before - inner.sessions.len();
        if purged > 0 {
            debug!(purged, remaining = inner.sessions.len(), "Purged idle scheduler sessions");
        }
        purged
    }

    /// Number of sessions with scheduler state
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Set a session's scheduling weight (non-positive values are ignored)
    pub fn set_weight(&self, session: &str, weight: f64) {
        if !(weight.is_finite() && weight > 0.0) {
            warn!(session = %session, weight, "Ignoring invalid scheduling weight");
            return;
        }
        let mut inner = self.inner.lock();
        self.session_mut(&mut inner, session).weight = weight;
    }

    /// Record the window an agent suggested for its session
    pub fn set_suggested_window(&self, session: &str, suggested: Option<u32>) {
        let mut inner = self.inner.lock();
        self.session_mut(&mut inner, session).suggested = suggested;
        self.dispatch_locked(&mut inner);
    }

    /// Update an agent's status and re-evaluate queued callers
    pub fn set_agent_status(&self, session: &str, status: AgentStatus) -> AgentStatus {
        let previous = self.agent_status.set_status(session, status);
        self.reschedule();
        previous
    }

    /// Re-evaluate queued callers, e.g. after an external status change
    pub fn reschedule(&self) {
        let mut inner = self.inner.lock();
        self.dispatch_locked(&mut inner);
    }

    /// Completed grants for `session`
    #[must_use]
    pub fn served(&self, session: &str) -> u64 {
        self.inner.lock().sessions.get(session).map_or(0, |s| s.served)
    }

    /// Items `session` currently has in service
    #[must_use]
    pub fn active(&self, session: &str) -> u32 {
        self.inner.lock().sessions.get(session).map_or(0, |s| s.active)
    }

    /// Callers currently waiting
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Slots currently in use
    #[must_use]
    pub fn in_service(&self) -> usize {
        self.inner.lock().in_service
    }

    /// Jain's fairness index over every session's `served` count
    #[must_use]
    pub fn compute_jains_index(&self) -> f64 {
        let inner = self.inner.lock();
        jains_index(inner.sessions.values().map(|s| s.served))
    }

    /// Queue-wait percentiles
    #[must_use]
    pub fn wait_percentiles(&self) -> WaitPercentiles {
        self.inner.lock().histogram.percentiles()
    }

    /// Administrative reset of every `served` counter
    pub fn reset_served(&self) {
        let mut inner = self.inner.lock();
        for state in inner.sessions.values_mut() {
            state.served = 0;
        }
        debug!("Scheduler served counters reset");
    }

    /// Point-in-time statistics
    #[must_use]
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let inner = self.inner.lock();
        let mut sessions: Vec<SessionSnapshot> = inner
            .sessions
            .iter()
            .map(|(id, s)| SessionSnapshot {
                session_id: id.clone(),
                weight: s.weight,
                served: s.served,
                active: s.active,
                mean_recent_wait_ms: if s.recent_waits.is_empty() {
                    0.0
                } else {
                    s.recent_waits.iter().sum::<f64>() / s.recent_waits.len() as f64
                },
            })
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));

        SchedulerSnapshot {
            capacity: self.config.capacity,
            in_service: inner.in_service,
            queued: inner.waiters.len(),
            jains_index: jains_index(inner.sessions.values().map(|s| s.served)),
            wait_percentiles: inner.histogram.percentiles(),
            sessions,
        }
    }

    fn enqueue(&self, session: &str, cost: f64, now: Instant) -> Enqueued {
        let mut inner = self.inner.lock();
        let virtual_time = inner.virtual_time;
        let state = self.session_mut(&mut inner, session);

        let prev_finish = state.last_finish;
        let start = virtual_time.max(prev_finish);
        let increment = (cost.max(0.0) * TAG_SCALE / state.weight).round() as u64;
        let finish = start.saturating_add(increment);
        state.last_finish = finish;
        state.last_seen = now;

        // Fast path: nobody is queued and the session may run now.
        if inner.waiters.is_empty() && inner.in_service < self.config.capacity && self.eligible(&inner, session) {
            Self::grant_locked(&mut inner, session, start, Duration::ZERO, self.config.recent_waits);
            return Enqueued::Granted;
        }

        let ticket = inner.next_ticket;
        inner.next_ticket += 1;
        let (tx, rx) = oneshot::channel();
        inner.order.insert((finish, ticket));
        inner.waiters.insert(
            ticket,
            Waiter {
                session: session.to_string(),
                start,
                finish,
                prev_finish,
                enqueued: now,
                grant: tx,
            },
        );
        debug!(session = %session, ticket, finish, queued = inner.waiters.len(), "Queued for a serving slot");

        // A slot may be free while earlier waiters are blocked by their agents.
        self.dispatch_locked(&mut inner);
        Enqueued::Queued(ticket, rx)
    }

    fn session_mut<'a>(&self, inner: &'a mut SchedulerInner, session: &str) -> &'a mut SessionState {
        inner
            .sessions
            .entry(session.to_string())
            .or_insert_with(|| SessionState {
                weight: self
                    .config
                    .weights
                    .get(session)
                    .copied()
                    .filter(|w| w.is_finite() && *w > 0.0)
                    .unwrap_or(self.config.default_weight),
                served: 0,
                active: 0,
                recent_waits: VecDeque::new(),
                last_finish: 0,
                suggested: None,
                last_seen: Instant::now(),
            })
    }

    fn eligible(&self, inner: &SchedulerInner, session: &str) -> bool {
        Self::active_in(inner, session) < self.session_limit(inner, session)
    }

    fn active_in(inner: &SchedulerInner, session: &str) -> u32 {
        inner.sessions.get(session).map_or(0, |s| s.active)
    }

    fn session_limit(&self, inner: &SchedulerInner, session: &str) -> u32 {
        let suggested = inner.sessions.get(session).and_then(|s| s.suggested);
        self.agent_status
            .effective_window(session, self.config.per_session_limit, suggested)
    }

    fn grant_locked(inner: &mut SchedulerInner, session: &str, start: u64, waited: Duration, keep: usize) {
        let wait_ms = waited.as_secs_f64() * 1000.0;
        inner.in_service += 1;
        inner.virtual_time = inner.virtual_time.max(start);
        inner.histogram.record(wait_ms);
        if let Some(state) = inner.sessions.get_mut(session) {
            state.active += 1;
            state.recent_waits.push_back(wait_ms);
            while state.recent_waits.len() > keep {
                state.recent_waits.pop_front();
            }
        }
    }

    fn dispatch_locked(&self, inner: &mut SchedulerInner) {
        let now = Instant::now();
        // Effective windows do not change while the lock is held.
        let mut limits: HashMap<String, u32> = HashMap::new();
        while inner.in_service < self.config.capacity {
            let next = inner
                .order
                .iter()
                .find(|(_, ticket)| {
                    let Some(waiter) = inner.waiters.get(ticket) else {
                        return false;
                    };
                    let limit = match limits.get(&waiter.session) {
                        Some(limit) => *limit,
                        None => {
                            let limit = self.session_limit(inner, &waiter.session);
                            limits.insert(waiter.session.clone(), limit);
                            limit
                        }
                    };
                    Self::active_in(inner, &waiter.session) < limit
                })
                .copied();
            let Some(entry) = next else {
                break;
            };
            inner.order.remove(&entry);
            let Some(waiter) = inner.waiters.remove(&entry.1) else {
                continue;
            };

            let waited = now.saturating_duration_since(waiter.enqueued);
            Self::grant_locked(inner, &waiter.session, waiter.start, waited, self.config.recent_waits);
            if waiter.grant.send(()).is_err() {
                // Caller vanished without cancelling; take the slot back.
                Self::ungrant_locked(inner, &waiter.session);
            } else {
                debug!(
                    session = %waiter.session,
                    ticket = entry.1,
                    waited_ms = waited.as_millis() as u64,
                    "Serving slot granted"
                );
            }
        }
    }

    fn ungrant_locked(inner: &mut SchedulerInner, session: &str) {
        inner.in_service = inner.in_service.saturating_sub(1);
        if let Some(state) = inner.sessions.get_mut(session) {
            state.active = state.active.saturating_sub(1);
        }
    }
}

impl Default for FairScheduler {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// A queued acquire that cleans up after itself if abandoned
struct PendingAcquire<'a> {
    scheduler: &'a FairScheduler,
    ticket: u64,
    session: &'a str,
    rx: oneshot::Receiver<()>,
    armed: bool,
}

impl PendingAcquire<'_> {
    /// Leave the queue; returns false if a grant already went through
    fn cancel(&mut self) -> bool {
        self.armed = false;
        let mut guard = self.scheduler.inner.lock();
        let inner = &mut *guard;
        let Some(waiter) = inner.waiters.remove(&self.ticket) else {
            return false;
        };
        inner.order.remove(&(waiter.finish, self.ticket));
        if let Some(state) = inner.sessions.get_mut(&waiter.session) {
            // Only the newest tag can be handed back without reordering.
            if state.last_finish == waiter.finish {
                state.last_finish = waiter.prev_finish;
            }
        }
        true
    }
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if !self.cancel() {
            let mut inner = self.scheduler.inner.lock();
            FairScheduler::ungrant_locked(&mut inner, self.session);
            self.scheduler.dispatch_locked(&mut inner);
        }
    }
}
