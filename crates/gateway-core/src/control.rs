//! Control frames emitted back toward senders.

use crate::frame::MessageKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Control-plane output of the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlFrame {
    /// Contiguous receipt up to and including `ack_up_to`
    Ack {
        /// Session identifier
        session_id: String,
        /// Stream identifier
        stream_id: String,
        /// Message sequence number
        msg_seq: u64,
        /// Highest contiguous fragment index received, absent before fragment 0
        ack_up_to: Option<u32>,
    },

    /// Confirmed gaps the sender should retransmit
    Nack {
        /// Session identifier
        session_id: String,
        /// Stream identifier
        stream_id: String,
        /// Message sequence number
        msg_seq: u64,
        /// Missing fragment indices, ascending
        missing: Vec<u32>,
    },

    /// Window occupancy changed
    WindowUpdate {
        /// Session identifier
        session_id: String,
        /// Value last shown to the peer
        before: u64,
        /// Current value
        after: u64,
        /// Emission time
        at: DateTime<Utc>,
    },

    /// Congestion signal
    Backpressure {
        /// Whether the sender should slow down
        engaged: bool,
        /// Suggested wait before sending more work
        suggested_wait_ms: u64,
    },
}

impl ControlFrame {
    /// Build an ACK for a message
    #[must_use]
    pub fn ack(key: &MessageKey, ack_up_to: Option<u32>) -> Self {
        Self::Ack {
            session_id: key.session_id.clone(),
            stream_id: key.stream_id.clone(),
            msg_seq: key.msg_seq,
            ack_up_to,
        }
    }

    /// Build a NACK for a message
    #[must_use]
    pub fn nack(key: &MessageKey, missing: Vec<u32>) -> Self {
        Self::Nack {
            session_id: key.session_id.clone(),
            stream_id: key.stream_id.clone(),
            msg_seq: key.msg_seq,
            missing,
        }
    }

    /// Wire type tag
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ack { .. } => "ACK",
            Self::Nack { .. } => "NACK",
            Self::WindowUpdate { .. } => "WINDOW_UPDATE",
            Self::Backpressure { .. } => "BACKPRESSURE",
        }
    }
}
