//! Admission path for completed messages.
//!
//! A message passes, in order: the budget pre-flight check, the advisory
//! burn-rate screen, the sender's admission window, the fair scheduler and
//! the backend's circuit breaker. Whatever was reserved is released when the
//! call finishes, or when the dispatch future is dropped part way, and window
//! or congestion changes are reported back as control frames.

use crate::reassembly::AssembledMessage;
use chrono::Utc;
use gateway_core::{
    CompletionBackend, CompletionRequest, CompletionResponse, ControlFrame, GatewayError,
    GatewayResult, Usage, Window,
};
use gateway_flow::{
    BackpressureWatermark, WatermarkTransition, WindowStore, WindowUpdateEmitter,
};
use gateway_resilience::{AnomalyGuard, BreakerRegistry, BudgetDecision, BudgetExceededReason, BudgetGovernor};
use gateway_routing::{AcquireOutcome, FairScheduler};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Scheduler cost of one request
const REQUEST_COST: f64 = 1.0;

/// Why a message was not served
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThrottleReason {
    /// The session's token or cost budget is exhausted
    Budget {
        /// Exceeded limit
        reason: BudgetExceededReason,
    },
    /// The sender's admission window is full
    WindowFull,
    /// No scheduler slot became free in time
    SchedulerTimeout {
        /// Time spent queued (ms)
        waited_ms: u64,
    },
    /// The backend's circuit is open
    CircuitOpen {
        /// Backend identifier
        backend: String,
    },
}

impl fmt::Display for ThrottleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Budget { reason } => write!(f, "{reason}"),
            Self::WindowFull => f.write_str("Admission window full"),
            Self::SchedulerTimeout { waited_ms } => {
                write!(f, "No scheduling slot after {waited_ms}ms")
            }
            Self::CircuitOpen { backend } => write!(f, "Circuit open for backend {backend}"),
        }
    }
}

/// Result of dispatching one message
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The backend answered
    Completed(CompletionResponse),
    /// The message was refused by admission control
    Throttled(ThrottleReason),
    /// The backend call failed
    Failed(GatewayError),
}

impl DispatchOutcome {
    /// Whether the backend answered
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Outcome plus the control frames it produced
#[derive(Debug)]
pub struct Dispatched {
    /// What happened to the message
    pub outcome: DispatchOutcome,
    /// WINDOW_UPDATE and backpressure frames for the sender
    pub controls: Vec<ControlFrame>,
    /// The session's cost burn rate spiked at admission; advisory only
    pub burn_rate_spike: bool,
}

/// Per-request estimates and limits
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Reservation charged before a call
    pub estimate: Usage,
    /// Maximum time spent waiting for a scheduler slot
    pub acquire_timeout: Duration,
    /// Maximum duration of a backend call
    pub backend_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            estimate: Usage::new(1_000, 2_000),
            acquire_timeout: Duration::from_secs(30),
            backend_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared admission components consulted by the dispatcher
#[derive(Debug)]
pub struct AdmissionComponents {
    /// Sender admission windows
    pub windows: WindowStore,
    /// WINDOW_UPDATE cadence
    pub window_updates: WindowUpdateEmitter,
    /// Congestion detector fed with scheduler waits
    pub watermark: BackpressureWatermark,
    /// Weighted fair scheduler
    pub scheduler: FairScheduler,
    /// Token and cost ledgers
    pub budget: BudgetGovernor,
    /// Burn-rate spike detector
    pub anomaly: AnomalyGuard,
    /// One breaker per backend
    pub breakers: BreakerRegistry,
}

/// Runs completed messages through admission control to a backend
pub struct Dispatcher {
    settings: DispatchSettings,
    components: Arc<AdmissionComponents>,
    backend: Arc<dyn CompletionBackend>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("settings", &self.settings)
            .field("backend", &self.backend.id())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher
    #[must_use]
    pub fn new(
        settings: DispatchSettings,
        components: Arc<AdmissionComponents>,
        backend: Arc<dyn CompletionBackend>,
    ) -> Self {
        Self {
            settings,
            components,
            backend,
        }
    }

    /// Shared components
    #[must_use]
    pub fn components(&self) -> &Arc<AdmissionComponents> {
        &self.components
    }

    /// Dispatch settings
    #[must_use]
    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Admit, schedule and execute one message
    pub async fn dispatch(&self, message: AssembledMessage) -> Dispatched {
        let c = &self.components;
        let session = message.key.session_id.clone();
        let estimate = self.settings.estimate;
        let mut controls = Vec::new();

        if let BudgetDecision::Denied { reason } = c.budget.check(&session, estimate) {
            info!(session = %session, %reason, "Message throttled by budget");
            return Dispatched {
                outcome: DispatchOutcome::Throttled(ThrottleReason::Budget { reason }),
                controls,
                burn_rate_spike: false,
            };
        }

        // Advisory only; a spike never refuses the message.
        let burn_rate = c.budget.burn_rate_usd_per_min(&session);
        let burn_rate_spike = c.anomaly.check_for_spike(&session, burn_rate);

        let window = message.window;
        if !c.windows.admit(&session, &window, estimate.tokens, estimate.usd_micros) {
            debug!(session = %session, message = %message.key, "Admission window full");
            return Dispatched {
                outcome: DispatchOutcome::Throttled(ThrottleReason::WindowFull),
                controls,
                burn_rate_spike,
            };
        }
        let reservation = WindowReservation {
            windows: &c.windows,
            session: &session,
            estimate,
        };
        self.push_window_update(&session, &window, &mut controls);

        let acquired = c
            .scheduler
            .acquire_timed(&session, REQUEST_COST, self.settings.acquire_timeout)
            .await;
        self.observe_wait(acquired.waited(), &mut controls);

        let outcome = match acquired {
            AcquireOutcome::TimedOut { waited } => {
                info!(session = %session, waited_ms = waited.as_millis() as u64, "No scheduling slot");
                DispatchOutcome::Throttled(ThrottleReason::SchedulerTimeout {
                    waited_ms: waited.as_millis() as u64,
                })
            }
            AcquireOutcome::Granted { .. } => {
                let slot = SchedulerSlot {
                    scheduler: &c.scheduler,
                    session: &session,
                    served: false,
                };
                let outcome = self.call_backend(&session, message).await;
                slot.release();
                outcome
            }
        };

        drop(reservation);
        self.push_window_update(&session, &window, &mut controls);

        Dispatched {
            outcome,
            controls,
            burn_rate_spike,
        }
    }

    async fn call_backend(&self, session: &str, message: AssembledMessage) -> DispatchOutcome {
        let c = &self.components;
        let backend_id = self.backend.id().to_string();
        let breaker = c.breakers.get(&backend_id);
        let request = CompletionRequest {
            key: message.key,
            qos: message.qos,
            meta: message.meta,
            payloads: message.payloads,
        };

        let result = breaker.call(|| self.complete_with_timeout(request)).await;
        match result {
            Ok(response) => {
                c.budget.consume(session, response.usage);
                DispatchOutcome::Completed(response)
            }
            Err(GatewayError::CircuitOpen { .. }) => {
                info!(session = %session, backend = %backend_id, "Message throttled by open circuit");
                DispatchOutcome::Throttled(ThrottleReason::CircuitOpen {
                    backend: backend_id,
                })
            }
            Err(error) => {
                warn!(session = %session, backend = %backend_id, %error, "Backend call failed");
                DispatchOutcome::Failed(error)
            }
        }
    }

    async fn complete_with_timeout(&self, request: CompletionRequest) -> GatewayResult<CompletionResponse> {
        let timeout = self.settings.backend_timeout;
        match tokio::time::timeout(timeout, self.backend.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::timeout(
                format!("{} completion", self.backend.id()),
                timeout.as_millis() as u64,
            )),
        }
    }

    fn observe_wait(&self, waited: Duration, controls: &mut Vec<ControlFrame>) {
        let sample_ms = waited.as_secs_f64() * 1000.0;
        match self.components.watermark.observe(sample_ms) {
            Some(WatermarkTransition::Engaged { suggested_wait_ms }) => {
                controls.push(ControlFrame::Backpressure {
                    engaged: true,
                    suggested_wait_ms,
                });
            }
            Some(WatermarkTransition::Released) => {
                controls.push(ControlFrame::Backpressure {
                    engaged: false,
                    suggested_wait_ms: 0,
                });
            }
            None => {}
        }
    }

    /// Report free request slots of the session's window when due
    fn push_window_update(&self, session: &str, window: &Window, controls: &mut Vec<ControlFrame>) {
        let c = &self.components;
        let inflight = c.windows.entry(session).inflight;
        let available = u64::from(window.max_parallel.saturating_sub(inflight));
        if let Some(update) = c.window_updates.maybe_emit(session, available) {
            controls.push(ControlFrame::WindowUpdate {
                session_id: update.session_id,
                before: update.before,
                after: update.after,
                at: Utc::now(),
            });
        }
    }
}

/// Admission-window reservation, returned when dropped
struct WindowReservation<'a> {
    windows: &'a WindowStore,
    session: &'a str,
    estimate: Usage,
}

impl Drop for WindowReservation<'_> {
    fn drop(&mut self) {
        self.windows
            .release(self.session, self.estimate.tokens, self.estimate.usd_micros);
    }
}

/// Granted scheduler slot; abandoned unless released after the call
struct SchedulerSlot<'a> {
    scheduler: &'a FairScheduler,
    session: &'a str,
    served: bool,
}

impl SchedulerSlot<'_> {
    fn release(mut self) {
        self.served = true;
        self.scheduler.release(self.session);
    }
}

impl Drop for SchedulerSlot<'_> {
    fn drop(&mut self) {
        if !self.served {
            debug!(session = %self.session, "Dispatch dropped while holding a slot");
            self.scheduler.abandon(self.session);
        }
    }
}
