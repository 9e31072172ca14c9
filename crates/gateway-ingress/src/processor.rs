//! Inbound frame processing.
//!
//! Drives fragment bookkeeping for every inbound frame: ACK on each
//! fragment, NACK for confirmed gaps (rate-limited by the retransmit queue),
//! and hand-off of the reassembled message once complete.

use crate::reassembly::{AssembledMessage, Reassembler};
use dashmap::DashMap;
use gateway_core::{ControlFrame, Frame, GatewayResult, MessageKey};
use gateway_flow::{AckConfig, AckTracker, RetransmitConfig, RetransmitQueue};
use std::time::Instant;
use tracing::debug;

/// Result of processing one frame
#[derive(Debug, Default)]
pub struct FrameResult {
    /// Control frames to send back to the peer
    pub controls: Vec<ControlFrame>,
    /// Message completed by this frame, if any
    pub completed: Option<AssembledMessage>,
}

/// Per-frame ACK/NACK and reassembly driver
#[derive(Debug)]
pub struct FrameProcessor {
    ack_config: AckConfig,
    acks: AckTracker,
    retransmit: RetransmitQueue,
    reassembly: Reassembler,
    /// Recently completed messages: final ack index and completion time
    finished: DashMap<MessageKey, (Option<u32>, Instant)>,
}

impl FrameProcessor {
    /// Create a processor
    #[must_use]
    pub fn new(ack_config: AckConfig, retransmit_config: RetransmitConfig) -> Self {
        Self {
            acks: AckTracker::new(ack_config.clone()),
            ack_config,
            retransmit: RetransmitQueue::new(retransmit_config),
            reassembly: Reassembler::new(),
            finished: DashMap::new(),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(AckConfig::default(), RetransmitConfig::default())
    }

    /// Process one inbound frame
    ///
    /// # Errors
    /// Returns `GatewayError::InvalidFrame` for a fragment index beyond the
    /// configured per-message limit.
    pub fn on_frame(&self, frame: &Frame) -> GatewayResult<FrameResult> {
        self.on_frame_at(frame, Instant::now())
    }

    /// Process one inbound frame at `now`
    ///
    /// # Errors
    /// Returns `GatewayError::InvalidFrame` for a fragment index beyond the
    /// configured per-message limit.
    pub fn on_frame_at(&self, frame: &Frame, now: Instant) -> GatewayResult<FrameResult> {
        let key = frame.key();
        self.acks.check_index(&key, frame.frag_seq)?;

        // Late duplicates of a delivered message are re-acknowledged only.
        if let Some(done) = self.finished.get(&key) {
            debug!(message = %key, frag_seq = frame.frag_seq, "Fragment for completed message");
            return Ok(FrameResult {
                controls: vec![ControlFrame::ack(&key, done.0)],
                completed: None,
            });
        }

        let outcome = self.acks.note_at(&key, frame.frag_seq, frame.is_last(), now)?;
        self.reassembly.push(frame);

        let mut result = FrameResult {
            controls: vec![ControlFrame::ack(&key, outcome.ack_up_to)],
            completed: None,
        };

        if !outcome.nacks.is_empty() {
            let due = self.retransmit.request_at(&key, &outcome.nacks, now);
            if !due.is_empty() {
                result.controls.push(ControlFrame::nack(&key, due));
            }
        }

        if outcome.completed {
            self.retransmit.forget(&key);
            self.finished.insert(key.clone(), (outcome.ack_up_to, now));
            result.completed = self.reassembly.take(&key);
        }
        Ok(result)
    }

    /// Drop state for idle incomplete messages and expired completion records
    ///
    /// Returns the number of incomplete messages discarded.
    pub fn purge_idle_at(&self, now: Instant) -> usize {
        let purged = self.acks.purge_idle_at(now);
        for key in &purged {
            self.reassembly.forget(key);
            self.retransmit.forget(key);
        }
        self.retransmit.purge_idle_at(now);

        let idle = self.ack_config.idle_timeout;
        self.finished
            .retain(|_, (_, at)| now.saturating_duration_since(*at) <= idle);
        purged.len()
    }

    /// Messages currently being reassembled
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.acks.len()
    }

    /// Messages with outstanding retransmit state
    #[must_use]
    pub fn pending_retransmits(&self) -> usize {
        self.retransmit.len()
    }
}

impl Default for FrameProcessor {
    fn default() -> Self {
        Self::with_defaults()
    }
}
