//! Wire frame types.
//!
//! A frame is one fragment of a logical message. Fragments of the same
//! message share the `(session_id, stream_id, msg_seq)` triple and are
//! ordered by `frag_seq`, starting at 0. The field names here are the wire
//! names and must stay stable for compatibility with connected peers.

use crate::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use validator::Validate;

/// Only wire version understood by this gateway
pub const WIRE_VERSION: u32 = 1;

/// Highest `frag_seq` accepted on the wire
///
/// Receivers may configure a lower per-message fragment limit.
pub const MAX_FRAG_SEQ: u32 = 1_048_575;

/// Frame flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Flag {
    /// Opens a stream
    Syn,
    /// Carries an acknowledgment
    Ack,
    /// Carries a negative acknowledgment
    Nack,
    /// Marks the terminal fragment of a message
    Fin,
}

/// Quality-of-service tier declared by the sender
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QosTier {
    /// Best effort
    #[default]
    Bronze,
    /// Standard
    Silver,
    /// Premium
    Gold,
}

impl QosTier {
    /// Wire name of the tier
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bronze => "bronze",
            Self::Silver => "silver",
            Self::Gold => "gold",
        }
    }
}

impl fmt::Display for QosTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission window declared by the sender
///
/// The three axes are independent: a request is admitted only if it fits
/// under every one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Window {
    /// Maximum concurrently outstanding requests
    #[validate(range(min = 1))]
    pub max_parallel: u32,
    /// Maximum tokens outstanding at once
    pub max_tokens: u64,
    /// Maximum cost outstanding at once, in micro-dollars
    pub max_usd_micros: u64,
}

impl Window {
    /// Create a new window
    #[must_use]
    pub fn new(max_parallel: u32, max_tokens: u64, max_usd_micros: u64) -> Self {
        Self {
            max_parallel,
            max_tokens,
            max_usd_micros,
        }
    }
}

/// Task metadata carried by a frame
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMeta {
    /// Kind of task (e.g. "chat", "embedding")
    #[serde(default)]
    pub task_type: String,
    /// Tools the task may invoke
    #[serde(default)]
    pub tool_permissions: Vec<String>,
}

/// Frame payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Payload type tag
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Arbitrary JSON content
    #[serde(default)]
    pub content: serde_json::Value,
}

impl Payload {
    /// Create a payload
    pub fn new(kind: impl Into<String>, content: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            content,
        }
    }
}

/// Identity of a logical message for reassembly
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageKey {
    /// Session identifier
    pub session_id: String,
    /// Stream identifier within the session
    pub stream_id: String,
    /// Message sequence number within the stream
    pub msg_seq: u64,
}

impl MessageKey {
    /// Create a message key
    pub fn new(session_id: impl Into<String>, stream_id: impl Into<String>, msg_seq: u64) -> Self {
        Self {
            session_id: session_id.into(),
            stream_id: stream_id.into(),
            msg_seq,
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.session_id, self.stream_id, self.msg_seq)
    }
}

/// A single wire frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Frame {
    /// Wire version
    #[serde(rename = "v")]
    #[validate(range(min = 1, max = 1))]
    pub version: u32,

    /// Session identifier
    #[validate(length(min = 1, max = 256))]
    pub session_id: String,

    /// Stream identifier
    #[validate(length(min = 1, max = 256))]
    pub stream_id: String,

    /// Message sequence number
    pub msg_seq: u64,

    /// Fragment index within the message
    #[validate(range(max = 1_048_575))]
    pub frag_seq: u32,

    /// Frame flags
    #[serde(default)]
    pub flags: Vec<Flag>,

    /// QoS tier
    #[serde(default)]
    pub qos: QosTier,

    /// Time-to-live hint from the sender
    #[serde(default)]
    pub ttl: u32,

    /// Admission window declared by the sender
    #[validate(nested)]
    pub window: Window,

    /// Task metadata
    #[serde(default)]
    pub meta: FrameMeta,

    /// Payload
    #[serde(default)]
    pub payload: Payload,
}

impl Frame {
    /// Create a frame with no flags, bronze QoS and a single-slot window
    pub fn new(
        session_id: impl Into<String>,
        stream_id: impl Into<String>,
        msg_seq: u64,
        frag_seq: u32,
    ) -> Self {
        Self {
            version: WIRE_VERSION,
            session_id: session_id.into(),
            stream_id: stream_id.into(),
            msg_seq,
            frag_seq,
            flags: Vec::new(),
            qos: QosTier::default(),
            ttl: 0,
            window: Window::new(1, u64::MAX, u64::MAX),
            meta: FrameMeta::default(),
            payload: Payload::default(),
        }
    }

    /// Add a flag
    #[must_use]
    pub fn with_flag(mut self, flag: Flag) -> Self {
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
        self
    }

    /// Set the QoS tier
    #[must_use]
    pub fn with_qos(mut self, qos: QosTier) -> Self {
        self.qos = qos;
        self
    }

    /// Set the admission window
    #[must_use]
    pub fn with_window(mut self, window: Window) -> Self {
        self.window = window;
        self
    }

    /// Set the task metadata
    #[must_use]
    pub fn with_meta(mut self, meta: FrameMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Set the payload
    #[must_use]
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Reassembly key of this frame
    #[must_use]
    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.session_id.clone(), self.stream_id.clone(), self.msg_seq)
    }

    /// Whether the frame carries `flag`
    #[must_use]
    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }

    /// Whether this is the terminal fragment of its message
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.has_flag(Flag::Fin)
    }

    /// Decode and validate a frame from JSON text
    pub fn from_json(text: &str) -> GatewayResult<Self> {
        let frame: Self = serde_json::from_str(text)?;
        frame.validate()?;
        Ok(frame)
    }

    /// Encode the frame as JSON text
    pub fn to_json(&self) -> GatewayResult<String> {
        serde_json::to_string(self).map_err(GatewayError::from)
    }
}
