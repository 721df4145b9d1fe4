use super::{ChannelMessage, CoordinationStore, StoreResult, Subscription};
use crate::topic::TopicGraph;
use crate::transcript::{Fields, StreamEntry, StreamId};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

const CHANNEL_CAPACITY: usize = 64;

struct Lock {
    holder: String,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    // Kept serialized so reads go through the same JSON contract as Redis.
    graph: Option<String>,
    stick: Option<Lock>,
    streams: HashMap<String, Vec<StreamEntry>>,
    channels: HashMap<String, broadcast::Sender<ChannelMessage>>,
}

impl State {
    fn live_stick(&mut self) -> Option<&Lock> {
        if self
            .stick
            .as_ref()
            .is_some_and(|lock| lock.expires_at <= Instant::now())
        {
            self.stick = None;
        }
        self.stick.as_ref()
    }
}

/// A coordination store living inside one process.
///
/// Every operation takes a single mutex, which gives the lock and the streams
/// the same atomicity Redis provides. Lock expiry follows the tokio clock, so
/// paused-time tests can advance past a TTL.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the guard leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn set_topic_graph(&self, graph: &TopicGraph) -> StoreResult<()> {
        let json = serde_json::to_string(graph)?;
        self.state().graph = Some(json);
        Ok(())
    }

    async fn get_topic_graph(&self) -> StoreResult<Option<TopicGraph>> {
        let json = self.state().graph.clone();
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn clear_topic_graph(&self) -> StoreResult<()> {
        self.state().graph = None;
        Ok(())
    }

    async fn acquire_talking_stick(&self, agent_id: &str, ttl: Duration) -> StoreResult<bool> {
        let mut state = self.state();
        if state.live_stick().is_some() {
            return Ok(false);
        }
        state.stick = Some(Lock {
            holder: agent_id.to_string(),
            expires_at: Instant::now() + ttl,
        });
        Ok(true)
    }

    async fn release_talking_stick(&self, agent_id: &str) -> StoreResult<bool> {
        let mut state = self.state();
        let owned = state
            .live_stick()
            .is_some_and(|lock| lock.holder == agent_id);
        if owned {
            state.stick = None;
        }
        Ok(owned)
    }

    async fn talking_stick_holder(&self) -> StoreResult<Option<String>> {
        Ok(self.state().live_stick().map(|lock| lock.holder.clone()))
    }

    async fn publish_event(&self, channel: &str, message: &Value) -> StoreResult<()> {
        let state = self.state();
        if let Some(tx) = state.channels.get(channel) {
            // No receivers means nobody is listening; the message is gone.
            let _ = tx.send(ChannelMessage {
                channel: channel.to_string(),
                payload: message.clone(),
            });
        }
        Ok(())
    }

    async fn subscribe_to_channel(&self, channel: &str) -> StoreResult<Subscription> {
        let rx = self
            .state()
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        // Lagged receivers skip what they missed, mirroring at-most-once delivery.
        let messages = BroadcastStream::new(rx)
            .filter_map(|msg| async move { msg.ok() })
            .boxed();
        Ok(Subscription::new(channel, messages))
    }

    async fn add_to_stream(&self, key: &str, fields: &Fields) -> StoreResult<StreamId> {
        let now_millis = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
        let mut state = self.state();
        let stream = state.streams.entry(key.to_string()).or_default();
        let id = StreamId::next_after(stream.last().map(|e| e.id), now_millis);
        stream.push(StreamEntry {
            id,
            fields: fields.clone(),
        });
        Ok(id)
    }

    async fn read_stream(&self, key: &str) -> StoreResult<Vec<StreamEntry>> {
        Ok(self.state().streams.get(key).cloned().unwrap_or_default())
    }
}
