//! Runs one host: the turn state machine and the audio activity gate side by
//! side, each reacting to its own event source.

use anyhow::{Context, Result};
use futures::StreamExt;
use futures::stream::BoxStream;
use podcaster_core::audit::AuditRecorder;
use podcaster_core::gate::{ActivitySignal, AudioActivityGate, GateError};
use podcaster_core::generator::DialogueGenerator;
use podcaster_core::media::{AudioFrame, InboundTrack, MediaTransport, TrackEvent};
use podcaster_core::store::CoordinationStore;
use podcaster_core::turn::HostAgent;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{Instrument, debug, error, info, warn};

/// Queue depth between the gate and the transcript writer.
const AUDIT_QUEUE_CAPACITY: usize = 64;

/// What a finished session leaves behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// Interruption entries written to the transcript.
    pub audit_entries: usize,
    /// Outbound frames dropped while a human was speaking.
    pub dropped_frames: u64,
    /// Participant audio received across all tracks.
    pub inbound_audio: Duration,
}

pub struct HostSession {
    agent: HostAgent,
    generator: Arc<dyn DialogueGenerator>,
    store: Arc<dyn CoordinationStore>,
    transport: Arc<dyn MediaTransport>,
    transcript_stream: String,
}

impl HostSession {
    pub fn new(
        agent: HostAgent,
        generator: Arc<dyn DialogueGenerator>,
        store: Arc<dyn CoordinationStore>,
        transport: Arc<dyn MediaTransport>,
        transcript_stream: impl Into<String>,
    ) -> Self {
        Self {
            agent,
            generator,
            store,
            transport,
            transcript_stream: transcript_stream.into(),
        }
    }

    /// Runs until `shutdown` resolves or either half fails.
    ///
    /// `outbound` carries synthesized frames on their way to the transport;
    /// they pass through the gate. On the way out every queued interruption
    /// entry is flushed to the transcript before the report is returned.
    pub async fn run(
        self,
        outbound: mpsc::Receiver<AudioFrame>,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<SessionReport> {
        let Self {
            mut agent,
            generator,
            store,
            transport,
            transcript_stream,
        } = self;

        let (audit, audit_handle) =
            AuditRecorder::spawn(store, transcript_stream, AUDIT_QUEUE_CAPACITY);
        let (gate, signals) = AudioActivityGate::new(agent.agent_id(), audit);
        let gate = Arc::new(gate);

        let tracks = transport
            .subscribe()
            .await
            .context("Failed to subscribe to inbound audio")?;

        let (stop_audio, audio_stopped) = oneshot::channel();
        let heard_micros = Arc::new(AtomicU64::new(0));
        let mut audio_task = tokio::spawn(listen_tracks(
            gate.clone(),
            tracks,
            heard_micros.clone(),
            audio_stopped,
        ));
        let signal_task = tokio::spawn(forward_signals(signals, generator));
        let outbound_task = tokio::spawn(forward_outbound(gate.clone(), transport, outbound));

        let mut audio_done = false;
        let outcome = tokio::select! {
            res = agent.run() => res.context("Turn loop stopped"),
            res = &mut audio_task => {
                audio_done = true;
                match res {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(anyhow::Error::from(e).context("Audio listener failed")),
                    Err(e) => Err(anyhow::Error::from(e).context("Audio listener panicked")),
                }
            }
            _ = shutdown => {
                info!("Shutdown requested");
                Ok(())
            }
        };

        // Tear down in dependency order: stop everything that holds the gate,
        // then let the signal forwarder and the audit writer drain.
        let _ = stop_audio.send(());
        if !audio_done {
            finish(audio_task, "audio listener").await;
        }
        outbound_task.abort();
        finish(outbound_task, "outbound forwarder").await;

        let dropped_frames = gate.dropped_frames();
        drop(gate);
        finish(signal_task, "signal forwarder").await;

        let audit_entries = audit_handle
            .await
            .context("Audit writer panicked")?
            .context("Audit writer failed")?;
        let inbound_audio = Duration::from_micros(heard_micros.load(Ordering::Relaxed));
        info!(
            audit_entries,
            dropped_frames,
            inbound_audio_ms = inbound_audio.as_millis(),
            "Host session finished"
        );

        outcome.map(|()| SessionReport {
            audit_entries,
            dropped_frames,
            inbound_audio,
        })
    }
}

/// Awaits a helper task, logging anything other than a clean or cancelled exit.
async fn finish<T>(task: JoinHandle<T>, name: &str) {
    if let Err(e) = task.await {
        if !e.is_cancelled() {
            error!(task = name, error = %e, "Task panicked");
        }
    }
}

/// Accepts inbound tracks and runs one listener per track, all feeding the
/// same gate. Returns when `stop` fires or a listener fails.
async fn listen_tracks(
    gate: Arc<AudioActivityGate>,
    mut tracks: BoxStream<'static, InboundTrack>,
    heard_micros: Arc<AtomicU64>,
    mut stop: oneshot::Receiver<()>,
) -> Result<(), GateError> {
    let mut listeners = JoinSet::new();
    let mut accepting = true;

    loop {
        tokio::select! {
            _ = &mut stop => break,
            track = tracks.next(), if accepting => match track {
                Some(track) => {
                    let span = tracing::info_span!("audio_track", participant = %track.participant);
                    listeners.spawn(
                        listen_track(gate.clone(), track, heard_micros.clone()).instrument(span),
                    );
                }
                None => {
                    debug!("Transport stopped announcing tracks");
                    accepting = false;
                }
            },
            Some(joined) = listeners.join_next() => match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    listeners.shutdown().await;
                    return Err(e);
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(error = %e, "Track listener panicked"),
            },
        }
    }

    listeners.shutdown().await;
    Ok(())
}

async fn listen_track(
    gate: Arc<AudioActivityGate>,
    mut track: InboundTrack,
    heard_micros: Arc<AtomicU64>,
) -> Result<(), GateError> {
    info!("Listening to participant audio");
    let mut frames: u64 = 0;
    let mut heard = Duration::ZERO;
    while let Some(event) = track.events.next().await {
        match event {
            TrackEvent::SpeechStarted => {
                gate.speech_started(&track.participant).await?;
            }
            TrackEvent::SpeechEnded => {
                gate.speech_ended(&track.participant);
            }
            TrackEvent::Frame(frame) => {
                frames += 1;
                let length = frame.duration();
                heard += length;
                let micros = u64::try_from(length.as_micros()).unwrap_or(u64::MAX);
                heard_micros.fetch_add(micros, Ordering::Relaxed);
            }
        }
    }
    info!(frames, heard_ms = heard.as_millis(), "Participant track ended");
    Ok(())
}

/// Hands the gate's edge-triggered signals to the generator. Ends when the
/// gate is dropped.
async fn forward_signals(
    mut signals: mpsc::UnboundedReceiver<ActivitySignal>,
    generator: Arc<dyn DialogueGenerator>,
) {
    while let Some(signal) = signals.recv().await {
        match signal {
            ActivitySignal::Started => generator.activity_started().await,
            ActivitySignal::Ended => generator.activity_ended().await,
        }
    }
}

async fn forward_outbound(
    gate: Arc<AudioActivityGate>,
    transport: Arc<dyn MediaTransport>,
    mut outbound: mpsc::Receiver<AudioFrame>,
) {
    while let Some(frame) = outbound.recv().await {
        match gate.forward(transport.as_ref(), frame).await {
            Ok(true) => {}
            Ok(false) => debug!(dropped = gate.dropped_frames(), "Frame dropped, human speaking"),
            Err(e) => {
                warn!(error = %e, "Outbound audio stopped");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use podcaster_core::generator::Generation;
    use podcaster_core::media::{ChannelTransport, OUTBOUND_CHANNELS, OUTBOUND_SAMPLE_RATE};
    use podcaster_core::persona::HostPersona;
    use podcaster_core::store::{CONVERSATION_STREAM, InMemoryStore};
    use podcaster_core::topic::{TopicGraph, TopicNode};
    use podcaster_core::transcript::{INTERRUPTION, TranscriptEntry};
    use podcaster_core::turn::TurnConfig;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingGenerator {
        started: AtomicUsize,
        ended: AtomicUsize,
    }

    #[async_trait]
    impl DialogueGenerator for RecordingGenerator {
        async fn generate(&self, persona: &HostPersona, label: &str, _: &str) -> Generation {
            Generation::Utterance(format!("{} talks about {label}", persona.name))
        }

        async fn activity_started(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        async fn activity_ended(&self) {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        transport: ChannelTransport,
        generator: Arc<RecordingGenerator>,
        outbound: mpsc::Sender<AudioFrame>,
        stop: oneshot::Sender<()>,
        session: JoinHandle<Result<SessionReport>>,
    }

    fn start(store: Arc<InMemoryStore>, transport: ChannelTransport) -> Harness {
        let persona = HostPersona::from_json(
            r#"{"id":"sascha","name":"Sascha","voice_id":"v1","system_prompt":"p"}"#,
        )
        .unwrap();
        let generator = Arc::new(RecordingGenerator::default());
        let config = TurnConfig {
            backoff_min: Duration::from_millis(100),
            backoff_max: Duration::from_millis(200),
            ..TurnConfig::default()
        };
        let agent = HostAgent::new(
            "host_sascha",
            persona,
            store.clone(),
            generator.clone(),
            config,
        );
        let session = HostSession::new(
            agent,
            generator.clone(),
            store.clone(),
            Arc::new(transport.clone()),
            CONVERSATION_STREAM,
        );

        let (outbound, outbound_rx) = mpsc::channel(16);
        let (stop, stopped) = oneshot::channel::<()>();
        let session = tokio::spawn(session.run(outbound_rx, async move {
            let _ = stopped.await;
        }));
        Harness {
            store,
            transport,
            generator,
            outbound,
            stop,
            session,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn frame() -> AudioFrame {
        AudioFrame::new(vec![0; 480], OUTBOUND_SAMPLE_RATE, OUTBOUND_CHANNELS)
    }

    async fn transcript(store: &InMemoryStore) -> Vec<TranscriptEntry> {
        store
            .read_stream(CONVERSATION_STREAM)
            .await
            .unwrap()
            .iter()
            .map(|e| TranscriptEntry::from_fields(&e.fields).unwrap())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_human_speech_mutes_output_and_is_audited() {
        let transport = ChannelTransport::new();
        let guest = transport.add_track("guest");
        let h = start(Arc::new(InMemoryStore::new()), transport);

        guest.send(TrackEvent::SpeechStarted).unwrap();
        wait_until(|| h.generator.started.load(Ordering::SeqCst) == 1).await;

        h.outbound.send(frame()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.transport.published().is_empty());

        // Two 20 ms frames of guest speech.
        guest.send(TrackEvent::Frame(frame())).unwrap();
        guest.send(TrackEvent::Frame(frame())).unwrap();
        guest.send(TrackEvent::SpeechEnded).unwrap();
        wait_until(|| h.generator.ended.load(Ordering::SeqCst) == 1).await;

        h.outbound.send(frame()).await.unwrap();
        wait_until(|| h.transport.published().len() == 1).await;

        h.stop.send(()).unwrap();
        let report = h.session.await.unwrap().unwrap();
        assert_eq!(
            report,
            SessionReport {
                audit_entries: 1,
                dropped_frames: 1,
                inbound_audio: Duration::from_millis(40),
            }
        );

        let entries = transcript(&h.store).await;
        assert_eq!(entries.len(), 1);
        match &entries[0] {
            TranscriptEntry::SystemSignal { event, agent_id, .. } => {
                assert_eq!(event, INTERRUPTION);
                assert_eq!(agent_id, "host_sascha");
            }
            other => panic!("expected an interruption, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_tracks_signal_once() {
        let transport = ChannelTransport::new();
        let alice = transport.add_track("alice");
        let bob = transport.add_track("bob");
        let h = start(Arc::new(InMemoryStore::new()), transport);

        alice.send(TrackEvent::SpeechStarted).unwrap();
        wait_until(|| h.generator.started.load(Ordering::SeqCst) == 1).await;
        bob.send(TrackEvent::SpeechStarted).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        alice.send(TrackEvent::SpeechEnded).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.generator.ended.load(Ordering::SeqCst), 0);

        bob.send(TrackEvent::SpeechEnded).unwrap();
        wait_until(|| h.generator.ended.load(Ordering::SeqCst) == 1).await;
        assert_eq!(h.generator.started.load(Ordering::SeqCst), 1);

        h.stop.send(()).unwrap();
        let report = h.session.await.unwrap().unwrap();
        assert_eq!(report.audit_entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_is_handled_while_turn_loop_backs_off() {
        let store = Arc::new(InMemoryStore::new());
        store
            .set_topic_graph(&TopicGraph {
                current_node_id: Some("intro".into()),
                ..TopicGraph::new(vec![TopicNode::new("intro", "Intro", "Say hello")], vec![])
            })
            .await
            .unwrap();
        let transport = ChannelTransport::new();
        let guest = transport.add_track("guest");
        let h = start(store.clone(), transport);

        // The host joins late, speaks once and goes into its backoff sleep.
        let mut spoken = 0;
        for _ in 0..100 {
            spoken = transcript(&store).await.len();
            if spoken > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(spoken, 1);

        guest.send(TrackEvent::SpeechStarted).unwrap();
        wait_until(|| h.generator.started.load(Ordering::SeqCst) == 1).await;
        h.outbound.send(frame()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        guest.send(TrackEvent::SpeechEnded).unwrap();
        wait_until(|| h.generator.ended.load(Ordering::SeqCst) == 1).await;

        h.stop.send(()).unwrap();
        let report = h.session.await.unwrap().unwrap();
        assert_eq!(report.audit_entries, 1);
        assert_eq!(report.dropped_frames, 1);

        let entries = transcript(&store).await;
        assert!(entries.iter().any(|e| matches!(e, TranscriptEntry::Utterance { .. })));
        assert!(entries.iter().any(
            |e| matches!(e, TranscriptEntry::SystemSignal { event, .. } if event == INTERRUPTION)
        ));
        assert!(store.talking_stick_holder().await.unwrap().is_none());
    }
}
