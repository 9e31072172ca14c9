//! Test fixtures: frames and configurations

use gateway_config::GatewayConfig;
use gateway_core::{Flag, Frame, FrameMeta, Payload, QosTier, Window};
use serde_json::json;
use std::time::Duration;

/// Window large enough to never throttle
pub fn open_window() -> Window {
    Window::new(64, u64::MAX, u64::MAX)
}

/// A text fragment of message `msg_seq`
pub fn text_fragment(session: &str, msg_seq: u64, frag_seq: u32, text: &str) -> Frame {
    Frame::new(session, "main", msg_seq, frag_seq)
        .with_window(open_window())
        .with_meta(FrameMeta {
            task_type: "chat".to_string(),
            tool_permissions: Vec::new(),
        })
        .with_payload(Payload::new("text", json!(text)))
}

/// A complete single-fragment message
pub fn single_frame_message(session: &str, msg_seq: u64, text: &str) -> Frame {
    text_fragment(session, msg_seq, 0, text).with_flag(Flag::Fin)
}

/// All fragments of a message split into `parts`
pub fn fragmented_message(session: &str, msg_seq: u64, parts: &[&str]) -> Vec<Frame> {
    let last = parts.len().saturating_sub(1);
    parts
        .iter()
        .enumerate()
        .map(|(idx, text)| {
            let frame = text_fragment(session, msg_seq, idx as u32, text);
            if idx == last {
                frame.with_flag(Flag::Fin)
            } else {
                frame
            }
        })
        .collect()
}

/// Wire JSON for a gold-tier frame
pub fn wire_frame_json(session: &str, msg_seq: u64, frag_seq: u32, fin: bool) -> String {
    json!({
        "v": 1,
        "session_id": session,
        "stream_id": "main",
        "msg_seq": msg_seq,
        "frag_seq": frag_seq,
        "flags": if fin { json!(["FIN"]) } else { json!([]) },
        "qos": QosTier::Gold,
        "ttl": 30,
        "window": { "max_parallel": 4, "max_tokens": 100000, "max_usd_micros": 1000000 },
        "meta": { "task_type": "chat", "tool_permissions": [] },
        "payload": { "type": "text", "content": format!("part {frag_seq}") }
    })
    .to_string()
}

/// Default configuration with short timeouts suited to tests
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.scheduler.acquire_timeout = Duration::from_millis(200);
    config.dispatch.backend_timeout = Duration::from_millis(500);
    config
}

/// Configuration with a single scheduling slot
pub fn single_slot_config() -> GatewayConfig {
    let mut config = test_config();
    config.scheduler.capacity = 1;
    config.scheduler.acquire_timeout = Duration::from_secs(5);
    config
}
