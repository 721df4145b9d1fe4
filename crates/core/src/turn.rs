//! Turn-Taking State Machine
//!
//! Each host process runs one [`HostAgent`]. It idles until the producer
//! announces an episode, then loops: read the graph, resolve the current node,
//! try to take the talking stick, and if granted speak once and hand the stick
//! back. The stick gives mutual exclusion across the fleet but no FIFO order;
//! a randomized backoff after every turn keeps one host from monopolising it.
//!
//! A host leaves the active state when the graph disappears or an
//! `EPISODE_END` event arrives. Store connectivity failures are returned to the
//! caller untouched.

use crate::generator::{DialogueGenerator, Generation};
use crate::persona::HostPersona;
use crate::store::{
    CONVERSATION_STREAM, CoordinationStore, EPISODE_END, EPISODE_READY, StoreError, StoreResult,
    Subscription,
};
use crate::transcript::{StreamId, TranscriptEntry};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Timing and naming knobs for the turn loop.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Expiry of the talking stick; bounds how long a crashed holder blocks others.
    pub lock_ttl: Duration,
    /// Bounds of the randomized pause after taking a turn.
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    /// Pause after a denied acquire.
    pub contention_retry: Duration,
    /// Pause while `current_node_id` does not resolve.
    pub node_wait: Duration,
    /// Upper bound on one generation call. Never allowed to outlast
    /// `lock_ttl`; see [`TurnConfig::generation_budget`].
    pub generation_timeout: Duration,
    pub transcript_stream: String,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(5),
            backoff_min: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(2000),
            contention_retry: Duration::from_millis(500),
            node_wait: Duration::from_secs(1),
            generation_timeout: Duration::from_secs(4),
            transcript_stream: CONVERSATION_STREAM.to_string(),
        }
    }
}

impl TurnConfig {
    fn backoff(&self) -> Duration {
        let min = millis(self.backoff_min);
        let max = millis(self.backoff_max).max(min);
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    /// Time a turn may spend generating: the configured timeout, capped so
    /// the stick cannot expire while the host is still generating.
    pub fn generation_budget(&self) -> Duration {
        self.generation_timeout.min(self.lock_ttl)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Idle,
    Active,
}

/// What a turn attempt that won the talking stick amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Spoke { node_id: String, stream_id: StreamId },
    Failed { node_id: String, reason: String },
}

/// The result of one pass through the active loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// No graph is published; the host should go idle.
    GraphAbsent,
    /// `current_node_id` is unset or points nowhere.
    NodeUnresolved,
    /// Someone else holds the talking stick.
    Contended,
    Took(TurnOutcome),
}

/// Why the active loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveExit {
    GraphAbsent,
    EpisodeEnded,
}

/// One host's turn-taking behaviour: persona plus the collaborators it talks to.
pub struct HostAgent {
    agent_id: String,
    persona: HostPersona,
    store: Arc<dyn CoordinationStore>,
    generator: Arc<dyn DialogueGenerator>,
    config: TurnConfig,
    state: HostState,
}

impl HostAgent {
    pub fn new(
        agent_id: impl Into<String>,
        persona: HostPersona,
        store: Arc<dyn CoordinationStore>,
        generator: Arc<dyn DialogueGenerator>,
        config: TurnConfig,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            persona,
            store,
            generator,
            config,
            state: HostState::Idle,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    /// Runs the host until the store fails or a subscription closes.
    ///
    /// Both subscriptions are opened before anything else, then the graph is
    /// checked once so a host started after the readiness event still joins
    /// the episode in progress.
    pub async fn run(&mut self) -> StoreResult<()> {
        let mut ready = self.store.subscribe_to_channel(EPISODE_READY).await?;
        let mut end = self.store.subscribe_to_channel(EPISODE_END).await?;
        info!(agent_id = %self.agent_id, "Host subscribed, idle until an episode is ready");

        if self.store.get_topic_graph().await?.is_some() {
            info!(agent_id = %self.agent_id, "Episode already published, joining late");
            self.state = HostState::Active;
        }

        loop {
            match self.state {
                HostState::Idle => {
                    self.wait_until_ready(&mut ready).await?;
                    self.state = HostState::Active;
                }
                HostState::Active => {
                    self.enter_active(&mut ready, &mut end);
                    let exit = self.run_active(&mut end).await?;
                    info!(agent_id = %self.agent_id, ?exit, "Leaving active state");
                    self.state = HostState::Idle;
                }
            }
        }
    }

    /// Discards signals queued before the host went active. A readiness
    /// message seen by a late joiner, or an end meant for an earlier episode,
    /// must not replay later.
    pub fn enter_active(&mut self, ready: &mut Subscription, end: &mut Subscription) {
        self.state = HostState::Active;
        let stale = ready.drain() + end.drain();
        if stale > 0 {
            debug!(agent_id = %self.agent_id, stale, "Discarded stale episode signals");
        }
    }

    /// Blocks until a readiness message arrives.
    pub async fn wait_until_ready(&self, ready: &mut Subscription) -> StoreResult<()> {
        let msg = ready
            .next()
            .await
            .ok_or_else(|| StoreError::SubscriptionClosed(ready.channel().to_string()))?;
        info!(
            agent_id = %self.agent_id,
            initial_node = %msg.payload["initial_node"],
            "Received EPISODE_READY, switching to active"
        );
        Ok(())
    }

    /// Loops over [`step`](Self::step) until the episode is gone or ends.
    ///
    /// Every pause listens to `end`, so an end event cuts a backoff short.
    pub async fn run_active(&self, end: &mut Subscription) -> StoreResult<ActiveExit> {
        loop {
            let pause = match self.step().await? {
                Step::GraphAbsent => return Ok(ActiveExit::GraphAbsent),
                Step::NodeUnresolved => self.config.node_wait,
                Step::Contended => self.config.contention_retry,
                Step::Took(_) => self.config.backoff(),
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                msg = end.next() => {
                    return match msg {
                        Some(msg) => {
                            info!(agent_id = %self.agent_id, payload = %msg.payload, "Received EPISODE_END");
                            Ok(ActiveExit::EpisodeEnded)
                        }
                        None => Err(StoreError::SubscriptionClosed(end.channel().to_string())),
                    };
                }
            }
        }
    }

    /// A single pass: fetch graph, resolve node, try the stick, maybe speak.
    pub async fn step(&self) -> StoreResult<Step> {
        let Some(graph) = self.store.get_topic_graph().await? else {
            info!(agent_id = %self.agent_id, "Topic graph absent");
            return Ok(Step::GraphAbsent);
        };
        let Some(node) = graph.current_node() else {
            debug!(
                agent_id = %self.agent_id,
                current_node_id = ?graph.current_node_id,
                "Current node does not resolve, waiting"
            );
            return Ok(Step::NodeUnresolved);
        };

        // Taken before the acquire, so the stick's real expiry is never
        // earlier than this deadline.
        let deadline = Instant::now() + self.config.lock_ttl;
        if !self
            .store
            .acquire_talking_stick(&self.agent_id, self.config.lock_ttl)
            .await?
        {
            debug!(agent_id = %self.agent_id, "Talking stick held elsewhere");
            return Ok(Step::Contended);
        }

        let spoken = self
            .speak(&node.id, &node.label, &node.content, deadline)
            .await;
        // Runs whatever the generation or append produced.
        let released = self.store.release_talking_stick(&self.agent_id).await;

        let outcome = spoken?;
        if !released? {
            warn!(
                agent_id = %self.agent_id,
                node_id = %node.id,
                "Talking stick expired before release; turn overran the lock TTL"
            );
        }
        Ok(Step::Took(outcome))
    }

    /// Whether the stick is still ours and will stay so until `deadline`.
    async fn still_holding(&self, deadline: Instant) -> StoreResult<bool> {
        if Instant::now() >= deadline {
            return Ok(false);
        }
        let holder = self.store.talking_stick_holder().await?;
        Ok(holder.as_deref() == Some(self.agent_id.as_str()))
    }

    async fn speak(
        &self,
        node_id: &str,
        label: &str,
        content: &str,
        deadline: Instant,
    ) -> StoreResult<TurnOutcome> {
        let generation = tokio::time::timeout(
            self.config.generation_budget(),
            self.generator.generate(&self.persona, label, content),
        )
        .await
        .unwrap_or_else(|_| Generation::Failed("generation timed out".to_string()));

        let generation = match generation {
            Generation::Utterance(_) if !self.still_holding(deadline).await? => {
                Generation::Failed("talking stick lost before the utterance was recorded".to_string())
            }
            other => other,
        };

        match generation {
            Generation::Utterance(text) => {
                let entry = TranscriptEntry::utterance(&self.agent_id, node_id, text);
                let stream_id = self
                    .store
                    .add_to_stream(&self.config.transcript_stream, &entry.to_fields())
                    .await?;
                info!(agent_id = %self.agent_id, %node_id, %stream_id, outcome = "spoke", "Turn taken");
                Ok(TurnOutcome::Spoke {
                    node_id: node_id.to_string(),
                    stream_id,
                })
            }
            Generation::Failed(reason) => {
                warn!(agent_id = %self.agent_id, %node_id, %reason, outcome = "failed", "Generation failed, no utterance emitted");
                Ok(TurnOutcome::Failed {
                    node_id: node_id.to_string(),
                    reason,
                })
            }
        }
    }
}
