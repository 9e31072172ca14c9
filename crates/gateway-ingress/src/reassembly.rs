//! Fragment payload reassembly.
//!
//! Buffers payloads per message until the ACK tracker reports the message
//! complete, then hands them out ordered by `frag_seq`. The header (QoS,
//! window, metadata) is taken from the lowest fragment seen.

use dashmap::DashMap;
use gateway_core::{Frame, FrameMeta, MessageKey, Payload, QosTier, Window};
use std::collections::BTreeMap;
use tracing::debug;

/// A fully received message
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledMessage {
    /// Message key
    pub key: MessageKey,
    /// QoS tier
    pub qos: QosTier,
    /// Admission window declared by the sender
    pub window: Window,
    /// Task metadata
    pub meta: FrameMeta,
    /// Payloads in fragment order
    pub payloads: Vec<Payload>,
}

#[derive(Debug)]
struct PartialMessage {
    header_frag: u32,
    qos: QosTier,
    window: Window,
    meta: FrameMeta,
    payloads: BTreeMap<u32, Payload>,
}

/// Per-message payload buffers
#[derive(Debug, Default)]
pub struct Reassembler {
    buffers: DashMap<MessageKey, PartialMessage>,
}

impl Reassembler {
    /// Create an empty reassembler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a fragment's payload; returns false for duplicates
    ///
    /// A duplicate never overwrites the payload received first.
    pub fn push(&self, frame: &Frame) -> bool {
        let mut partial = self
            .buffers
            .entry(frame.key())
            .or_insert_with(|| PartialMessage {
                header_frag: frame.frag_seq,
                qos: frame.qos,
                window: frame.window,
                meta: frame.meta.clone(),
                payloads: BTreeMap::new(),
            });

        if partial.payloads.contains_key(&frame.frag_seq) {
            debug!(message = %frame.key(), frag_seq = frame.frag_seq, "Duplicate fragment ignored");
            return false;
        }
        if frame.frag_seq < partial.header_frag {
            partial.header_frag = frame.frag_seq;
            partial.qos = frame.qos;
            partial.window = frame.window;
            partial.meta = frame.meta.clone();
        }
        partial.payloads.insert(frame.frag_seq, frame.payload.clone());
        true
    }

    /// Remove and return a message's buffered fragments
    pub fn take(&self, key: &MessageKey) -> Option<AssembledMessage> {
        let (key, partial) = self.buffers.remove(key)?;
        Some(AssembledMessage {
            key,
            qos: partial.qos,
            window: partial.window,
            meta: partial.meta,
            payloads: partial.payloads.into_values().collect(),
        })
    }

    /// Drop a message's buffers
    pub fn forget(&self, key: &MessageKey) -> bool {
        self.buffers.remove(key).is_some()
    }

    /// Number of messages being buffered
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}
