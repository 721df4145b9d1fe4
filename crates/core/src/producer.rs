//! Producer Coordination
//!
//! The producer is the only process that writes the topic graph. It plans an
//! episode (through an [`EpisodePlanner`]), publishes it, advances the current
//! node while the hosts talk, and finally ends the episode.

use crate::store::{CoordinationStore, EPISODE_END, EPISODE_READY, StoreError};
use crate::topic::{GraphError, TopicEdge, TopicGraph, TopicNode};
use crate::transcript::{self, StreamId, TranscriptEntry};
use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Agent id the producer writes transcript entries under.
pub const PRODUCER_ID: &str = "producer";

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("Invalid topic graph: {0}")]
    Validation(#[from] GraphError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("No episode is currently published")]
    NoEpisode,
    #[error("The current node is the last one in the script")]
    EndOfScript,
    #[error("Episode planning failed: {0:#}")]
    Planning(anyhow::Error),
}

/// Defines the contract for anything that turns a topic into an episode plan.
#[async_trait]
pub trait EpisodePlanner: Send + Sync {
    /// Builds the topic graph for an episode about `topic`.
    async fn plan(&self, topic: &str) -> Result<TopicGraph>;
}

const PLANNER_INSTRUCTIONS: &str = r#"You are the executive producer of a podcast.
Plan an episode about the topic the user gives you as a topic graph.

Rules:
- At least 5 nodes, in the order the hosts should cover them.
- The content of each node is detailed guidance and key facts for the hosts.
- Connect the nodes with edges. Edges may carry a condition such as "sentiment == skeptical" to allow a non-linear flow.

Reply with JSON only, following this schema:
{
  "nodes": [{"id": "...", "label": "...", "content": "..."}],
  "edges": [{"source_id": "...", "target_id": "...", "condition": null}]
}"#;

/// An `EpisodePlanner` backed by an OpenAI-compatible chat completion API.
pub struct LLMEpisodePlanner {
    client: Client<OpenAIConfig>,
    model: String,
}

impl LLMEpisodePlanner {
    /// Creates a new planner.
    ///
    /// # Arguments
    ///
    /// * `config` - API key and base URL of the service.
    /// * `model` - Model identifier used for chat completions (e.g., "gpt-4o").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }
}

#[async_trait]
impl EpisodePlanner for LLMEpisodePlanner {
    async fn plan(&self, topic: &str) -> Result<TopicGraph> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(vec![
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(PLANNER_INSTRUCTIONS)
                    .build()?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(format!("Topic: {topic}"))
                    .build()?
                    .into(),
            ])
            .build()?;

        let response = self.client.chat().create(request).await?;

        let answer = response
            .choices
            .first()
            .context("No response choice from LLM")?
            .message
            .content
            .as_ref()
            .context("No content in LLM response")?;

        parse_planned_graph(answer)
    }
}

/// Extracts a topic graph from a model reply, tolerating code fences or
/// prose around the JSON object.
fn parse_planned_graph(answer: &str) -> Result<TopicGraph> {
    let start = answer.find('{').context("No JSON object in planner reply")?;
    let end = answer.rfind('}').context("No JSON object in planner reply")?;
    anyhow::ensure!(end > start, "No JSON object in planner reply");
    let graph: TopicGraph = serde_json::from_str(&answer[start..=end])
        .context("Planner reply is not a valid topic graph")?;
    Ok(graph)
}

/// A mock `EpisodePlanner` for development and integration testing.
///
/// Always returns the same five-segment linear plan.
pub struct MockEpisodePlanner;

#[async_trait]
impl EpisodePlanner for MockEpisodePlanner {
    async fn plan(&self, topic: &str) -> Result<TopicGraph> {
        let segments = [
            ("intro", "Introduction", format!("Welcome the audience and introduce {topic}.")),
            ("background", "Background", format!("Explain where {topic} comes from.")),
            ("core", "Core Ideas", format!("Walk through the central ideas of {topic}.")),
            ("debate", "Debate", format!("Discuss where experts disagree about {topic}.")),
            ("outro", "Wrap-up", "Summarize the episode and thank the listeners.".to_string()),
        ];
        let nodes: Vec<TopicNode> = segments
            .into_iter()
            .map(|(id, label, content)| TopicNode::new(id, label, content))
            .collect();
        let edges = nodes
            .windows(2)
            .map(|pair| TopicEdge {
                source_id: pair[0].id.clone(),
                target_id: pair[1].id.clone(),
                condition: None,
            })
            .collect();
        Ok(TopicGraph::new(nodes, edges))
    }
}

/// Publishes and steers episodes through the coordination store.
pub struct ProducerCoordinator {
    store: Arc<dyn CoordinationStore>,
    transcript_stream: String,
}

impl ProducerCoordinator {
    pub fn new(store: Arc<dyn CoordinationStore>, transcript_stream: impl Into<String>) -> Self {
        Self {
            store,
            transcript_stream: transcript_stream.into(),
        }
    }

    /// Plans an episode about `topic` and publishes it.
    pub async fn plan_and_publish(
        &self,
        planner: &dyn EpisodePlanner,
        topic: &str,
    ) -> Result<TopicGraph, ProducerError> {
        let graph = planner.plan(topic).await.map_err(ProducerError::Planning)?;
        self.publish_episode(graph).await
    }

    /// Validates `graph`, persists it, then announces it on `EPISODE_READY`.
    ///
    /// An unset `current_node_id` starts at the first node. Nothing is
    /// written or published unless validation passes. Returns the graph as
    /// stored.
    pub async fn publish_episode(&self, mut graph: TopicGraph) -> Result<TopicGraph, ProducerError> {
        graph.validate()?;
        if graph.current_node_id.is_none() {
            graph.current_node_id = graph.first_node().map(|n| n.id.clone());
        }
        for edge in graph.dangling_edges() {
            warn!(source_id = %edge.source_id, target_id = %edge.target_id, "Edge references a missing node");
        }

        self.store.set_topic_graph(&graph).await?;
        let initial_node = graph.current_node_id.clone().unwrap_or_default();
        self.store
            .publish_event(EPISODE_READY, &json!({ "initial_node": initial_node }))
            .await?;
        info!(%initial_node, nodes = graph.nodes.len(), "Episode published");
        Ok(graph)
    }

    /// Moves the episode to `node_id`, or to the suggested next node when
    /// `None`. Returns the new current node id.
    pub async fn advance(&self, node_id: Option<&str>) -> Result<String, ProducerError> {
        let graph = self
            .store
            .get_topic_graph()
            .await?
            .ok_or(ProducerError::NoEpisode)?;
        let target = match node_id {
            Some(id) => graph
                .node(id)
                .map(|n| n.id.clone())
                .ok_or_else(|| GraphError::UnknownNode(id.to_string()))?,
            None => graph
                .next_node_id()
                .map(str::to_string)
                .ok_or(ProducerError::EndOfScript)?,
        };
        self.store.update_current_node(&target).await?;
        info!(from = ?graph.current_node_id, to = %target, "Advanced current node");
        Ok(target)
    }

    /// Ends the episode: records the end in the transcript, removes the graph
    /// and tells the hosts to go idle.
    pub async fn end_episode(&self, reason: &str) -> Result<StreamId, ProducerError> {
        let mut metadata = BTreeMap::new();
        metadata.insert("reason".to_string(), Value::from(reason));
        let entry = TranscriptEntry::signal(transcript::EPISODE_END, PRODUCER_ID, metadata);
        let stream_id = self
            .store
            .add_to_stream(&self.transcript_stream, &entry.to_fields())
            .await?;

        self.store.clear_topic_graph().await?;
        self.store
            .publish_event(EPISODE_END, &json!({ "reason": reason }))
            .await?;
        info!(%reason, %stream_id, "Episode ended");
        Ok(stream_id)
    }

    /// The full transcript in append order. Entries that do not parse are
    /// skipped with a warning.
    pub async fn transcript(&self) -> Result<Vec<(StreamId, TranscriptEntry)>, ProducerError> {
        let entries = self.store.read_stream(&self.transcript_stream).await?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            match TranscriptEntry::from_fields(&entry.fields) {
                Ok(parsed) => out.push((entry.id, parsed)),
                Err(e) => warn!(stream_id = %entry.id, error = %e, "Skipping malformed transcript entry"),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CONVERSATION_STREAM, InMemoryStore};

    fn coordinator() -> (ProducerCoordinator, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (
            ProducerCoordinator::new(store.clone(), CONVERSATION_STREAM),
            store,
        )
    }

    #[tokio::test]
    async fn test_publish_persists_then_announces_first_node() {
        let (producer, store) = coordinator();
        let mut ready = store.subscribe_to_channel(EPISODE_READY).await.unwrap();

        let graph = MockEpisodePlanner.plan("bees").await.unwrap();
        let published = producer.publish_episode(graph).await.unwrap();
        assert_eq!(published.current_node_id.as_deref(), Some("intro"));

        let msg = ready.next().await.unwrap();
        assert_eq!(msg.payload, json!({ "initial_node": "intro" }));
        // The graph is in place by the time the signal is observable.
        assert_eq!(store.get_topic_graph().await.unwrap(), Some(published));
    }

    #[tokio::test]
    async fn test_invalid_graph_is_neither_stored_nor_announced() {
        let (producer, store) = coordinator();
        let mut ready = store.subscribe_to_channel(EPISODE_READY).await.unwrap();

        let duplicate = TopicGraph::new(
            vec![TopicNode::new("a", "A", "x"), TopicNode::new("a", "A2", "y")],
            vec![],
        );
        let err = producer.publish_episode(duplicate).await.unwrap_err();
        assert!(matches!(err, ProducerError::Validation(GraphError::DuplicateNodeId(_))));

        let mut unresolvable = TopicGraph::new(vec![TopicNode::new("a", "A", "x")], vec![]);
        unresolvable.current_node_id = Some("zzz".into());
        let err = producer.publish_episode(unresolvable).await.unwrap_err();
        assert!(matches!(err, ProducerError::Validation(GraphError::UnknownCurrentNode(_))));

        let err = producer.publish_episode(TopicGraph::new(vec![], vec![])).await.unwrap_err();
        assert!(matches!(err, ProducerError::Validation(GraphError::Empty)));

        assert!(store.get_topic_graph().await.unwrap().is_none());
        assert_eq!(ready.drain(), 0);
    }

    #[tokio::test]
    async fn test_explicit_current_node_is_kept() {
        let (producer, _store) = coordinator();
        let mut graph = MockEpisodePlanner.plan("bees").await.unwrap();
        graph.current_node_id = Some("core".into());
        let published = producer.publish_episode(graph).await.unwrap();
        assert_eq!(published.current_node_id.as_deref(), Some("core"));
    }

    #[tokio::test]
    async fn test_advance_walks_the_script() {
        let (producer, store) = coordinator();
        producer
            .publish_episode(MockEpisodePlanner.plan("bees").await.unwrap())
            .await
            .unwrap();

        assert_eq!(producer.advance(None).await.unwrap(), "background");
        assert_eq!(producer.advance(Some("outro")).await.unwrap(), "outro");
        assert!(matches!(producer.advance(None).await, Err(ProducerError::EndOfScript)));
        assert!(matches!(
            producer.advance(Some("nowhere")).await,
            Err(ProducerError::Validation(GraphError::UnknownNode(_)))
        ));

        let graph = store.get_topic_graph().await.unwrap().unwrap();
        assert_eq!(graph.current_node_id.as_deref(), Some("outro"));
    }

    #[tokio::test]
    async fn test_advance_without_episode() {
        let (producer, _store) = coordinator();
        assert!(matches!(producer.advance(None).await, Err(ProducerError::NoEpisode)));
    }

    #[tokio::test]
    async fn test_end_episode_records_clears_and_announces() {
        let (producer, store) = coordinator();
        producer
            .publish_episode(MockEpisodePlanner.plan("bees").await.unwrap())
            .await
            .unwrap();
        let mut end = store.subscribe_to_channel(EPISODE_END).await.unwrap();

        producer.end_episode("time is up").await.unwrap();

        assert!(store.get_topic_graph().await.unwrap().is_none());
        assert_eq!(end.next().await.unwrap().payload, json!({ "reason": "time is up" }));

        let entries = producer.transcript().await.unwrap();
        assert_eq!(entries.len(), 1);
        match &entries[0].1 {
            TranscriptEntry::SystemSignal { event, agent_id, metadata, .. } => {
                assert_eq!(event, transcript::EPISODE_END);
                assert_eq!(agent_id, PRODUCER_ID);
                assert_eq!(metadata["reason"], "time is up");
            }
            other => panic!("expected a system signal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_planning_failure_publishes_nothing() {
        struct Broken;

        #[async_trait]
        impl EpisodePlanner for Broken {
            async fn plan(&self, _topic: &str) -> Result<TopicGraph> {
                anyhow::bail!("research backend down")
            }
        }

        let (producer, store) = coordinator();
        let err = producer.plan_and_publish(&Broken, "bees").await.unwrap_err();
        assert!(matches!(err, ProducerError::Planning(_)));
        assert!(store.get_topic_graph().await.unwrap().is_none());
    }

    #[test]
    fn test_parse_planned_graph_tolerates_code_fences() {
        let reply = "Here you go:\n```json\n{\"nodes\":[{\"id\":\"a\",\"label\":\"A\",\"content\":\"c\"}],\"edges\":[]}\n```";
        let graph = parse_planned_graph(reply).unwrap();
        assert_eq!(graph.nodes.len(), 1);
        assert!(parse_planned_graph("no json here").is_err());
    }

    #[tokio::test]
    async fn test_mock_plan_is_valid_and_linear() {
        let mut graph = MockEpisodePlanner.plan("bees").await.unwrap();
        graph.validate().unwrap();
        assert_eq!(graph.nodes.len(), 5);
        assert!(graph.dangling_edges().is_empty());
        graph.current_node_id = Some("intro".into());
        assert_eq!(graph.next_node_id(), Some("background"));
    }
}
