//! Admission control integration tests
//!
//! Budget exhaustion, admission windows and circuit breaking as seen from
//! the frame pipeline.

use crate::fixtures::*;
use crate::helpers::*;
use crate::mock_backends::*;
use gateway_core::{ControlFrame, Usage, Window};
use gateway_ingress::{DispatchOutcome, ThrottleReason};
use gateway_resilience::{BudgetExceededReason, CircuitState};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

/// Test a session is throttled once its token budget is spent
#[tokio::test]
async fn test_budget_exhaustion_throttles() {
    let mut config = test_config();
    config.budget.token_limit = 2_500;
    config.dispatch.estimated_tokens = 1_000;
    let backend = Arc::new(MockBackend::new("mock").with_usage(Usage::new(1_000, 10)));
    let core = build_core(&config, backend.clone());

    assert!(is_completed(&submit(&core, &single_frame_message("s1", 1, "a")).await));
    assert!(is_completed(&submit(&core, &single_frame_message("s1", 2, "b")).await));

    let reason = expect_throttled(submit(&core, &single_frame_message("s1", 3, "c")).await);
    assert_eq!(
        reason,
        ThrottleReason::Budget {
            reason: BudgetExceededReason::TokensExceeded {
                used: 2_000,
                requested: 1_000,
                max: 2_500,
            }
        }
    );
    assert_eq!(backend.calls(), 2);

    // Other sessions are unaffected.
    assert!(is_completed(&submit(&core, &single_frame_message("s2", 1, "d")).await));

    let snapshot = core.snapshot();
    let s1 = snapshot
        .budgets
        .iter()
        .find(|b| b.session_id == "s1")
        .expect("s1 budget");
    assert_eq!(s1.remaining.tokens, 500);
}

/// Test the sender's declared window bounds concurrent requests
#[tokio::test]
async fn test_window_bounds_parallel_requests() {
    let backend = Arc::new(MockBackend::new("mock").with_delay(Duration::from_millis(100)));
    let core = build_core(&test_config(), backend.clone());

    let narrow = Window::new(1, u64::MAX, u64::MAX);
    let first = single_frame_message("s1", 1, "a").with_window(narrow);
    let second = single_frame_message("s1", 2, "b").with_window(narrow);

    let slow = {
        let core = core.clone();
        tokio::spawn(async move { submit(&core, &first).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let reason = expect_throttled(submit(&core, &second).await);
    assert_eq!(reason, ThrottleReason::WindowFull);

    let handled = slow.await.expect("join");
    assert!(is_completed(&handled));
    assert_eq!(core.components().windows.entry("s1").inflight, 0);
    assert_eq!(backend.calls(), 1);
}

/// Test repeated backend failures open the circuit and recover after reset
#[tokio::test]
async fn test_circuit_opens_and_recovers() {
    let mut config = test_config();
    config.circuit_breaker.failure_threshold = 3;
    config.circuit_breaker.success_threshold = 1;
    config.circuit_breaker.reset_timeout = Duration::from_millis(100);
    let backend = Arc::new(MockBackend::new("mock"));
    backend.set_failing(true);
    let core = build_core(&config, backend.clone());

    for seq in 0..3 {
        let handled = submit(&core, &single_frame_message("s1", seq, "x")).await;
        assert!(matches!(handled.outcome, Some(DispatchOutcome::Failed(_))));
    }
    let breaker = core.components().breakers.get("mock");
    assert_eq!(breaker.state(), CircuitState::Open);

    let reason = expect_throttled(submit(&core, &single_frame_message("s1", 3, "x")).await);
    assert_eq!(reason, ThrottleReason::CircuitOpen { backend: "mock".into() });
    assert_eq!(backend.calls(), 3);

    backend.set_failing(false);
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(is_completed(&submit(&core, &single_frame_message("s1", 4, "x")).await));
    assert_eq!(breaker.state(), CircuitState::Closed);
}

/// Test a slow backend is cut off by the dispatch timeout
#[tokio::test]
async fn test_backend_timeout_is_failure() {
    let mut config = test_config();
    config.dispatch.backend_timeout = Duration::from_millis(30);
    let backend = Arc::new(MockBackend::new("mock").with_delay(Duration::from_millis(200)));
    let core = build_core(&config, backend);

    let handled = submit(&core, &single_frame_message("s1", 1, "x")).await;
    match handled.outcome {
        Some(DispatchOutcome::Failed(error)) => {
            assert!(matches!(error, gateway_core::GatewayError::Timeout { .. }));
            assert!(error.is_retryable());
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(core.components().breakers.get("mock").stats().consecutive_failures, 1);
}

/// Test window updates report freed request slots
#[tokio::test]
async fn test_window_update_after_release() {
    let core = build_core(&test_config(), Arc::new(MockBackend::new("mock")));
    let handled = submit(&core, &single_frame_message("s1", 1, "x")).await;

    let update = handled
        .controls
        .iter()
        .find(|c| matches!(c, ControlFrame::WindowUpdate { .. }))
        .expect("window update");
    let ControlFrame::WindowUpdate { session_id, before, after, .. } = update else {
        unreachable!();
    };
    assert_eq!(session_id, "s1");
    assert_eq!(after - before, 1);
}
