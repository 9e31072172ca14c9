//! Assembled admission core.

use crate::dispatcher::{AdmissionComponents, DispatchOutcome, DispatchSettings, Dispatcher};
use crate::processor::FrameProcessor;
use gateway_config::GatewayConfig;
use gateway_core::{CompletionBackend, ControlFrame, Frame, GatewayResult, Usage};
use gateway_flow::{
    BackpressureWatermark, WatermarkSnapshot, WindowEntry, WindowStore, WindowUpdateEmitter,
};
use gateway_resilience::{
    AnomalyGuard, AnomalySnapshot, BreakerRegistry, BudgetGovernor, BudgetSnapshot,
    CircuitBreakerStats,
};
use gateway_routing::{AgentStatus, AgentStatusRegistry, FairScheduler, SchedulerSnapshot};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Occupancy of one admission window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowSnapshot {
    /// Admission key
    pub key: String,
    /// Current occupancy
    #[serde(flatten)]
    pub entry: WindowEntry,
}

/// Read-only view of every admission component
#[derive(Debug, Clone, Serialize)]
pub struct GatewaySnapshot {
    /// Messages being reassembled
    pub in_flight_messages: usize,
    /// Scheduler fairness and wait statistics
    pub scheduler: SchedulerSnapshot,
    /// Backpressure watermark state
    pub backpressure: WatermarkSnapshot,
    /// Admission window occupancy
    pub windows: Vec<WindowSnapshot>,
    /// Budget remaining and burn rate per session
    pub budgets: Vec<BudgetSnapshot>,
    /// Burn-rate anomaly state per session
    pub anomalies: Vec<AnomalySnapshot>,
    /// Circuit breaker state per backend
    pub breakers: Vec<CircuitBreakerStats>,
}

/// Result of handling one inbound frame
#[derive(Debug, Default)]
pub struct FrameHandled {
    /// Control frames for the sender, in emission order
    pub controls: Vec<ControlFrame>,
    /// Dispatch result when the frame completed a message
    pub outcome: Option<DispatchOutcome>,
    /// The sender's burn rate spiked when the message was admitted
    pub burn_rate_spike: bool,
}

/// Frame processing plus admission control in front of one backend
#[derive(Debug)]
pub struct AdmissionCore {
    processor: FrameProcessor,
    dispatcher: Dispatcher,
    session_idle_timeout: Duration,
}

impl AdmissionCore {
    /// Create a core from its parts
    #[must_use]
    pub fn new(processor: FrameProcessor, dispatcher: Dispatcher, session_idle_timeout: Duration) -> Self {
        Self {
            processor,
            dispatcher,
            session_idle_timeout,
        }
    }

    /// Build every component from configuration
    #[must_use]
    pub fn from_config(config: &GatewayConfig, backend: Arc<dyn CompletionBackend>) -> Self {
        let agent_status = Arc::new(AgentStatusRegistry::new(config.agent_status.clone()));
        let components = Arc::new(AdmissionComponents {
            windows: WindowStore::new(),
            window_updates: WindowUpdateEmitter::new(config.window_update.clone()),
            watermark: BackpressureWatermark::new(config.backpressure.clone()),
            scheduler: FairScheduler::new(config.scheduler.clone(), agent_status),
            budget: BudgetGovernor::new(config.budget.clone()),
            anomaly: AnomalyGuard::new(config.anomaly.clone()),
            breakers: BreakerRegistry::new(config.circuit_breaker.clone()),
        });
        let settings = DispatchSettings {
            estimate: Usage::new(
                config.dispatch.estimated_tokens,
                config.dispatch.estimated_usd_micros,
            ),
            acquire_timeout: config.scheduler.acquire_timeout,
            backend_timeout: config.dispatch.backend_timeout,
        };

        info!(
            backend = %backend.id(),
            capacity = config.scheduler.capacity,
            "Admission core initialized"
        );
        Self::new(
            FrameProcessor::new(config.ack.clone(), config.retransmit.clone()),
            Dispatcher::new(settings, components, backend),
            config.dispatch.session_idle_timeout,
        )
    }

    /// Frame processor
    #[must_use]
    pub fn processor(&self) -> &FrameProcessor {
        &self.processor
    }

    /// Dispatcher
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Shared admission components
    #[must_use]
    pub fn components(&self) -> &Arc<AdmissionComponents> {
        self.dispatcher.components()
    }

    /// Process a frame and dispatch the message it completes, if any
    ///
    /// # Errors
    /// Returns `GatewayError::InvalidFrame` for a frame the processor refuses;
    /// such a frame leaves no state behind.
    pub async fn handle_frame(&self, frame: &Frame) -> GatewayResult<FrameHandled> {
        let processed = self.processor.on_frame(frame)?;
        let mut handled = FrameHandled {
            controls: processed.controls,
            ..FrameHandled::default()
        };
        if let Some(message) = processed.completed {
            let dispatched = self.dispatcher.dispatch(message).await;
            handled.controls.extend(dispatched.controls);
            handled.outcome = Some(dispatched.outcome);
            handled.burn_rate_spike = dispatched.burn_rate_spike;
        }
        Ok(handled)
    }

    /// Record an agent's self-reported status
    pub fn set_agent_status(&self, session: &str, status: AgentStatus) -> AgentStatus {
        self.components().scheduler.set_agent_status(session, status)
    }

    /// Discard idle message and per-session state
    pub fn purge_idle(&self) -> usize {
        self.purge_idle_at(Instant::now())
    }

    /// Like [`purge_idle`](Self::purge_idle) at an explicit instant
    ///
    /// Incomplete messages follow the ack idle timeout; per-session admission
    /// state follows `dispatch.session_idle_timeout`. Returns the number of
    /// entries removed across all components.
    pub fn purge_idle_at(&self, now: Instant) -> usize {
        let c = self.components();
        let idle = self.session_idle_timeout;
        let messages = self.processor.purge_idle_at(now);
        let windows = c.windows.purge_idle_at(now, idle);
        let baselines = c.window_updates.purge_idle_at(now, idle);
        let budgets = c.budget.purge_idle_at(now);
        let anomalies = c.anomaly.purge_idle_at(now, idle);
        let statuses = c.scheduler.agent_status().purge_idle_at(now, idle);
        if statuses > 0 {
            c.scheduler.reschedule();
        }
        let sessions = c.scheduler.purge_idle_at(now, idle);

        let total = messages + windows + baselines + budgets + anomalies + statuses + sessions;
        if total > 0 {
            debug!(
                messages,
                windows,
                baselines,
                budgets,
                anomalies,
                statuses,
                sessions,
                "Idle state purged"
            );
        }
        total
    }

    /// Read-only view of every component
    #[must_use]
    pub fn snapshot(&self) -> GatewaySnapshot {
        let c = self.components();
        GatewaySnapshot {
            in_flight_messages: self.processor.in_flight(),
            scheduler: c.scheduler.snapshot(),
            backpressure: c.watermark.snapshot(),
            windows: c
                .windows
                .snapshot()
                .into_iter()
                .map(|(key, entry)| WindowSnapshot { key, entry })
                .collect(),
            budgets: c.budget.snapshots(),
            anomalies: c.anomaly.snapshots(),
            breakers: c.breakers.stats(),
        }
    }
}
