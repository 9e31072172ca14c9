//! Test helper utilities for integration tests

use gateway_config::GatewayConfig;
use gateway_core::{CompletionBackend, ControlFrame, Frame};
use gateway_ingress::{AdmissionCore, DispatchOutcome, FrameHandled};
use once_cell::sync::Lazy;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Initialize tracing for tests (only once)
static TRACING: Lazy<()> = Lazy::new(|| {
    if std::env::var("TEST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
});

/// Initialize tracing for tests
pub fn init_tracing() {
    Lazy::force(&TRACING);
}

/// Build an admission core in front of `backend`
pub fn build_core(config: &GatewayConfig, backend: Arc<dyn CompletionBackend>) -> Arc<AdmissionCore> {
    init_tracing();
    Arc::new(AdmissionCore::from_config(config, backend))
}

/// Handle one frame the core is expected to accept
pub async fn submit(core: &AdmissionCore, frame: &Frame) -> FrameHandled {
    core.handle_frame(frame).await.expect("frame accepted")
}

/// Feed frames in order, collecting every result
pub async fn feed(core: &AdmissionCore, frames: &[Frame]) -> Vec<FrameHandled> {
    let mut results = Vec::with_capacity(frames.len());
    for frame in frames {
        results.push(submit(core, frame).await);
    }
    results
}

/// Kinds of the control frames, in order
pub fn control_kinds(controls: &[ControlFrame]) -> Vec<&'static str> {
    controls.iter().map(ControlFrame::kind).collect()
}

/// Whether a frame result carries a completed dispatch
pub fn is_completed(handled: &FrameHandled) -> bool {
    matches!(handled.outcome, Some(DispatchOutcome::Completed(_)))
}

/// Assert the result is a throttle and return the outcome for inspection
pub fn expect_throttled(handled: FrameHandled) -> gateway_ingress::ThrottleReason {
    match handled.outcome {
        Some(DispatchOutcome::Throttled(reason)) => reason,
        other => panic!("expected throttle, got {other:?}"),
    }
}
