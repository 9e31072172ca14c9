//! Mock completion backends for integration testing

use async_trait::async_trait;
use gateway_core::{
    CompletionBackend, CompletionRequest, CompletionResponse, GatewayError, GatewayResult, Usage,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Backend that echoes payloads, optionally after a delay
pub struct MockBackend {
    id: String,
    delay: Duration,
    usage: Usage,
    failing: AtomicBool,
    call_count: AtomicUsize,
    call_log: Mutex<Vec<String>>,
}

impl MockBackend {
    /// Create an instant echo backend
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            delay: Duration::ZERO,
            usage: Usage::new(10, 20),
            failing: AtomicBool::new(false),
            call_count: AtomicUsize::new(0),
            call_log: Mutex::new(Vec::new()),
        }
    }

    /// Answer after `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Report `usage` for every call
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    /// Make subsequent calls fail or succeed
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of calls made to the backend
    pub fn calls(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Session ids in call order
    pub fn call_log(&self) -> Vec<String> {
        self.call_log.lock().map(|log| log.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CompletionBackend for MockBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(&self, request: CompletionRequest) -> GatewayResult<CompletionResponse> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut log) = self.call_log.lock() {
            log.push(request.key.session_id.clone());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::backend(&self.id, "mock failure", true));
        }
        let content: Vec<_> = request.payloads.iter().map(|p| p.content.clone()).collect();
        Ok(CompletionResponse {
            key: request.key,
            content: json!(content),
            usage: self.usage,
        })
    }
}
