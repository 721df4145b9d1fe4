//! Coordination Store
//!
//! The single shared mutable resource between host and producer processes.
//! It exposes four primitives with distinct consistency guarantees:
//!
//! - a topic-graph snapshot at a well-known key (last writer wins),
//! - the talking stick: an expiring lock with atomic create-if-absent and
//!   owner-checked delete,
//! - fire-and-forget pub/sub channels (at-most-once, non-durable),
//! - durable append-only streams with store-assigned, strictly increasing ids.
//!
//! [`InMemoryStore`] serves single-process runs and tests; [`RedisStore`]
//! (feature `redis`) is the production adapter.

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

use crate::topic::TopicGraph;
use crate::transcript::{Fields, StreamEntry, StreamId};
use async_trait::async_trait;
use futures::{FutureExt, StreamExt, stream::BoxStream};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const TOPIC_GRAPH_KEY: &str = "topic_graph";
pub const TALKING_STICK_KEY: &str = "talking_stick";
pub const EPISODE_READY: &str = "EPISODE_READY";
pub const EPISODE_END: &str = "EPISODE_END";
pub const CONVERSATION_STREAM: &str = "conversation_stream";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be reached. Fatal to the operation in progress.
    #[error("Coordination store unreachable: {0}")]
    Connectivity(String),
    #[error("Coordination store error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Malformed stream entry: {0}")]
    MalformedEntry(String),
    #[error("Subscription to channel '{0}' closed")]
    SubscriptionClosed(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A message received on a pub/sub channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: Value,
}

/// A live subscription to one channel.
///
/// Only messages published after the subscription was established are
/// delivered, and a slow reader may miss some; callers that need the current
/// state must read it from the store.
pub struct Subscription {
    channel: String,
    messages: BoxStream<'static, ChannelMessage>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, messages: BoxStream<'static, ChannelMessage>) -> Self {
        Self {
            channel: channel.into(),
            messages,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits for the next message. `None` means the subscription is gone.
    pub async fn next(&mut self) -> Option<ChannelMessage> {
        self.messages.next().await
    }

    /// Discards every message that is already buffered, without waiting.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while let Some(Some(_)) = self.messages.next().now_or_never() {
            drained += 1;
        }
        drained
    }
}

/// The capability every coordination backend provides.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Replaces the stored snapshot.
    async fn set_topic_graph(&self, graph: &TopicGraph) -> StoreResult<()>;

    /// The latest snapshot, or `None` when no episode is published.
    async fn get_topic_graph(&self) -> StoreResult<Option<TopicGraph>>;

    /// Removes the snapshot so readers observe "absent".
    async fn clear_topic_graph(&self) -> StoreResult<()>;

    /// Points the stored graph at `node_id`.
    ///
    /// This is a read-modify-write over two round trips and is not atomic: a
    /// concurrent writer can interleave and one of the updates is lost. Only
    /// the producer advances nodes. A missing graph makes this a no-op.
    async fn update_current_node(&self, node_id: &str) -> StoreResult<()> {
        if let Some(mut graph) = self.get_topic_graph().await? {
            graph.current_node_id = Some(node_id.to_string());
            self.set_topic_graph(&graph).await?;
        }
        Ok(())
    }

    /// Atomically creates the talking-stick lock for `agent_id` if nobody
    /// holds it. The lock expires on its own after `ttl`.
    async fn acquire_talking_stick(&self, agent_id: &str, ttl: Duration) -> StoreResult<bool>;

    /// Deletes the lock only if `agent_id` still holds it. Returns whether a
    /// lock was deleted.
    async fn release_talking_stick(&self, agent_id: &str) -> StoreResult<bool>;

    /// Current holder of the talking stick, if any.
    async fn talking_stick_holder(&self) -> StoreResult<Option<String>>;

    async fn publish_event(&self, channel: &str, message: &Value) -> StoreResult<()>;

    async fn subscribe_to_channel(&self, channel: &str) -> StoreResult<Subscription>;

    /// Appends an entry and returns the id the store assigned to it.
    async fn add_to_stream(&self, key: &str, fields: &Fields) -> StoreResult<StreamId>;

    /// Every entry of the stream in append order.
    async fn read_stream(&self, key: &str) -> StoreResult<Vec<StreamEntry>>;
}

/// Opens the store named by `url`: `memory://` for the in-process store,
/// `redis://` / `rediss://` for Redis.
pub async fn connect(url: &str) -> anyhow::Result<Arc<dyn CoordinationStore>> {
    if url.starts_with("memory://") {
        return Ok(Arc::new(InMemoryStore::new()));
    }
    #[cfg(feature = "redis")]
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        return Ok(Arc::new(RedisStore::connect(url).await?));
    }
    anyhow::bail!("Unsupported coordination store url: {url}")
}
