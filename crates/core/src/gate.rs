//! Audio Activity Gate
//!
//! Tracks how many human participants are currently speaking and enforces
//! half-duplex output: while anyone is talking, synthesized frames are dropped
//! on the floor (never queued or replayed). Interruption signals toward the
//! generator are edge-triggered: `Started` fires on 0 -> 1, `Ended` on N -> 0,
//! however many speakers overlap in between.
//!
//! Listener tasks for several inbound tracks share one gate, so the counter and
//! the signal it implies are updated under a single lock.

use crate::audit::{AuditClosed, AuditRecorder};
use crate::media::{AudioFrame, MediaTransport, TransportError};
use crate::transcript::{INTERRUPTION, TranscriptEntry};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Edge-triggered activity notifications for the dialogue generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivitySignal {
    Started,
    Ended,
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error(transparent)]
    Audit(#[from] AuditClosed),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct AudioActivityGate {
    agent_id: String,
    active_speakers: Mutex<usize>,
    signals: mpsc::UnboundedSender<ActivitySignal>,
    audit: AuditRecorder,
    dropped_frames: AtomicU64,
}

impl AudioActivityGate {
    /// Creates a gate for `agent_id`; activity signals arrive on the returned receiver.
    pub fn new(
        agent_id: impl Into<String>,
        audit: AuditRecorder,
    ) -> (Self, mpsc::UnboundedReceiver<ActivitySignal>) {
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let gate = Self {
            agent_id: agent_id.into(),
            active_speakers: Mutex::new(0),
            signals,
            audit,
            dropped_frames: AtomicU64::new(0),
        };
        (gate, signal_rx)
    }

    fn speakers(&self) -> std::sync::MutexGuard<'_, usize> {
        self.active_speakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records a start-of-speech boundary. Returns `true` when this was the
    /// first active speaker, i.e. an interruption began.
    pub async fn speech_started(&self, participant: &str) -> Result<bool, GateError> {
        let interrupted = {
            let mut count = self.speakers();
            *count += 1;
            if *count == 1 {
                let _ = self.signals.send(ActivitySignal::Started);
            }
            debug!(%participant, active_speakers = *count, "Start of speech");
            *count == 1
        };

        if interrupted {
            info!(agent_id = %self.agent_id, %participant, "Interruption: human speech detected, muting host output");
            let mut metadata = BTreeMap::new();
            metadata.insert("participant".to_string(), Value::from(participant));
            metadata.insert("last_token_index".to_string(), Value::from(0));
            self.audit
                .record(TranscriptEntry::signal(INTERRUPTION, &self.agent_id, metadata))
                .await?;
        }
        Ok(interrupted)
    }

    /// Records an end-of-speech boundary. Returns `true` when the last active
    /// speaker went quiet. Unmatched ends are ignored.
    pub fn speech_ended(&self, participant: &str) -> bool {
        let mut count = self.speakers();
        if *count == 0 {
            debug!(%participant, "End of speech without a matching start");
            return false;
        }
        *count -= 1;
        debug!(%participant, active_speakers = *count, "End of speech");
        if *count == 0 {
            let _ = self.signals.send(ActivitySignal::Ended);
            info!(agent_id = %self.agent_id, "All participants silent, host output resumes");
            true
        } else {
            false
        }
    }

    pub fn active_speakers(&self) -> usize {
        *self.speakers()
    }

    pub fn is_suppressing(&self) -> bool {
        self.active_speakers() > 0
    }

    /// Frames dropped because a human was speaking.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Publishes a synthesized frame unless a human is speaking. Returns
    /// whether the frame went out.
    pub async fn forward(
        &self,
        transport: &dyn MediaTransport,
        frame: AudioFrame,
    ) -> Result<bool, GateError> {
        if self.is_suppressing() {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        transport.publish_frame(frame).await?;
        Ok(true)
    }
}
