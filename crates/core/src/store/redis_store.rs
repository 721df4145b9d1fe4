use super::{
    ChannelMessage, CoordinationStore, StoreError, StoreResult, Subscription, TALKING_STICK_KEY,
    TOPIC_GRAPH_KEY,
};
use crate::topic::TopicGraph;
use crate::transcript::{Fields, StreamEntry, StreamId};
use async_trait::async_trait;
use futures::StreamExt;
use redis::{AsyncCommands, Client, Script, aio::ConnectionManager};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

/// Deletes the key only when it still holds the caller's id.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            StoreError::Connectivity(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

/// Coordination store backed by Redis.
///
/// The graph is a JSON string at `topic_graph`, the talking stick is
/// `SET NX PX` plus an owner-checked Lua delete, channels are Redis pub/sub and
/// transcripts are Redis streams.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    release: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        info!(url = %url, "Connected to Redis coordination store");
        Ok(Self {
            client,
            conn,
            release: Script::new(RELEASE_SCRIPT),
        })
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn set_topic_graph(&self, graph: &TopicGraph) -> StoreResult<()> {
        let json = serde_json::to_string(graph)?;
        let mut conn = self.conn.clone();
        let _: () = conn.set(TOPIC_GRAPH_KEY, json).await?;
        Ok(())
    }

    async fn get_topic_graph(&self) -> StoreResult<Option<TopicGraph>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(TOPIC_GRAPH_KEY).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn clear_topic_graph(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(TOPIC_GRAPH_KEY).await?;
        Ok(())
    }

    async fn acquire_talking_stick(&self, agent_id: &str, ttl: Duration) -> StoreResult<bool> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(TALKING_STICK_KEY)
            .arg(agent_id)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release_talking_stick(&self, agent_id: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(TALKING_STICK_KEY)
            .arg(agent_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn talking_stick_holder(&self) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(TALKING_STICK_KEY).await?)
    }

    async fn publish_event(&self, channel: &str, message: &Value) -> StoreResult<()> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe_to_channel(&self, channel: &str) -> StoreResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let messages = pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                let channel = msg.get_channel_name().to_string();
                let raw: String = match msg.get_payload() {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!(%channel, error = %e, "Dropping undecodable pub/sub payload");
                        return None;
                    }
                };
                let payload = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
                Some(ChannelMessage { channel, payload })
            })
            .boxed();
        Ok(Subscription::new(channel, messages))
    }

    async fn add_to_stream(&self, key: &str, fields: &Fields) -> StoreResult<StreamId> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(key).arg("*");
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        let mut conn = self.conn.clone();
        let id: String = cmd.query_async(&mut conn).await?;
        id.parse()
    }

    async fn read_stream(&self, key: &str) -> StoreResult<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let reply: redis::streams::StreamRangeReply = redis::cmd("XRANGE")
            .arg(key)
            .arg("-")
            .arg("+")
            .query_async(&mut conn)
            .await?;

        reply
            .ids
            .into_iter()
            .map(|entry| -> StoreResult<StreamEntry> {
                let fields = entry
                    .map
                    .iter()
                    .map(|(field, value)| -> StoreResult<(String, String)> {
                        let value: String = redis::from_redis_value(value)?;
                        Ok((field.clone(), value))
                    })
                    .collect::<StoreResult<Fields>>()?;
                Ok(StreamEntry {
                    id: entry.id.parse()?,
                    fields,
                })
            })
            .collect()
    }
}
