//! Media transport boundary.
//!
//! The transport delivers inbound audio per participant, tagged with
//! start/end-of-speech boundaries, and accepts outbound PCM frames. Hosts only
//! ever subscribe to tracks and publish single frames.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Sample rate of synthesized host audio.
pub const OUTBOUND_SAMPLE_RATE: u32 = 24_000;
pub const OUTBOUND_CHANNELS: u16 = 1;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Media transport is closed")]
    Closed,
    #[error("Media transport error: {0}")]
    Other(String),
}

/// A chunk of interleaved 16-bit PCM audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    pub fn samples_per_channel(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / usize::from(self.channels)
    }

    /// Playback length of the frame.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let micros = self.samples_per_channel() as u128 * 1_000_000 / u128::from(self.sample_rate);
        Duration::from_micros(u64::try_from(micros).unwrap_or(u64::MAX))
    }
}

/// What an inbound track reports.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackEvent {
    Frame(AudioFrame),
    SpeechStarted,
    SpeechEnded,
}

/// One participant's inbound audio.
pub struct InboundTrack {
    pub participant: String,
    pub events: BoxStream<'static, TrackEvent>,
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Yields a track every time a participant's audio becomes available.
    async fn subscribe(&self) -> Result<BoxStream<'static, InboundTrack>, TransportError>;

    async fn publish_frame(&self, frame: AudioFrame) -> Result<(), TransportError>;
}

/// An in-process transport wired with channels.
///
/// The embedding code (or a test) adds tracks through [`ChannelTransport::add_track`]
/// and reads published frames back with [`ChannelTransport::published`].
#[derive(Clone)]
pub struct ChannelTransport {
    tracks_tx: mpsc::UnboundedSender<InboundTrack>,
    tracks_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<InboundTrack>>>>,
    published: Arc<Mutex<Vec<AudioFrame>>>,
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelTransport {
    pub fn new() -> Self {
        let (tracks_tx, tracks_rx) = mpsc::unbounded_channel();
        Self {
            tracks_tx,
            tracks_rx: Arc::new(Mutex::new(Some(tracks_rx))),
            published: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Announces a new participant track and returns the sender that feeds it.
    pub fn add_track(&self, participant: &str) -> mpsc::UnboundedSender<TrackEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.tracks_tx.send(InboundTrack {
            participant: participant.to_string(),
            events: UnboundedReceiverStream::new(rx).boxed(),
        });
        tx
    }

    /// Frames published so far.
    pub fn published(&self) -> Vec<AudioFrame> {
        self.published
            .lock()
            .map(|frames| frames.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MediaTransport for ChannelTransport {
    async fn subscribe(&self) -> Result<BoxStream<'static, InboundTrack>, TransportError> {
        let rx = self
            .tracks_rx
            .lock()
            .map_err(|e| TransportError::Other(e.to_string()))?
            .take()
            .ok_or_else(|| TransportError::Other("already subscribed".to_string()))?;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn publish_frame(&self, frame: AudioFrame) -> Result<(), TransportError> {
        self.published
            .lock()
            .map_err(|_| TransportError::Closed)?
            .push(frame);
        Ok(())
    }
}
