//! Transcript entries and stream ids.
//!
//! The transcript is a durable append-only log. Entries are flat string field
//! maps on the wire; [`TranscriptEntry`] is the typed view over them.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::store::StoreError;

/// An open field map, as stored in one stream entry.
pub type Fields = BTreeMap<String, String>;

pub const SYSTEM_SIGNAL: &str = "SYSTEM_SIGNAL";
pub const INTERRUPTION: &str = "INTERRUPTION";
pub const EPISODE_END: &str = "EPISODE_END";

/// Store-assigned id of a stream entry: `<millis>-<sequence>`.
///
/// Ids are strictly increasing per stream key; ordering compares the
/// millisecond part first, then the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub millis: u64,
    pub seq: u64,
}

impl StreamId {
    /// The smallest id strictly greater than `last` for a clock reading of `now_millis`.
    pub fn next_after(last: Option<StreamId>, now_millis: u64) -> StreamId {
        match last {
            Some(last) if now_millis <= last.millis => StreamId {
                millis: last.millis,
                seq: last.seq + 1,
            },
            _ => StreamId {
                millis: now_millis,
                seq: 0,
            },
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || StoreError::MalformedEntry(format!("invalid stream id '{s}'"));
        let (millis, seq) = s.split_once('-').ok_or_else(malformed)?;
        Ok(StreamId {
            millis: millis.parse().map_err(|_| malformed())?,
            seq: seq.parse().map_err(|_| malformed())?,
        })
    }
}

/// One entry read back from a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: StreamId,
    pub fields: Fields,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEntry {
    /// Something a host said while holding the talking stick.
    Utterance {
        agent_id: String,
        text: String,
        timestamp: DateTime<Utc>,
        node_id: String,
    },
    /// An out-of-band event recorded for audit (interruptions, episode end).
    SystemSignal {
        event: String,
        agent_id: String,
        timestamp: DateTime<Utc>,
        metadata: BTreeMap<String, Value>,
    },
}

impl TranscriptEntry {
    pub fn utterance(agent_id: &str, node_id: &str, text: impl Into<String>) -> Self {
        TranscriptEntry::Utterance {
            agent_id: agent_id.to_string(),
            text: text.into(),
            timestamp: now(),
            node_id: node_id.to_string(),
        }
    }

    pub fn signal(event: &str, agent_id: &str, metadata: BTreeMap<String, Value>) -> Self {
        TranscriptEntry::SystemSignal {
            event: event.to_string(),
            agent_id: agent_id.to_string(),
            timestamp: now(),
            metadata,
        }
    }

    pub fn agent_id(&self) -> &str {
        match self {
            TranscriptEntry::Utterance { agent_id, .. }
            | TranscriptEntry::SystemSignal { agent_id, .. } => agent_id,
        }
    }

    /// Flattens the entry into the wire field map. Signal metadata is nested
    /// JSON encoded into a single field.
    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        match self {
            TranscriptEntry::Utterance {
                agent_id,
                text,
                timestamp,
                node_id,
            } => {
                fields.insert("agent_id".into(), agent_id.clone());
                fields.insert("text".into(), text.clone());
                fields.insert("timestamp".into(), format_timestamp(timestamp));
                fields.insert("node_id".into(), node_id.clone());
            }
            TranscriptEntry::SystemSignal {
                event,
                agent_id,
                timestamp,
                metadata,
            } => {
                fields.insert("type".into(), SYSTEM_SIGNAL.into());
                fields.insert("event".into(), event.clone());
                fields.insert("agent_id".into(), agent_id.clone());
                fields.insert("timestamp".into(), format_timestamp(timestamp));
                fields.insert(
                    "metadata".into(),
                    serde_json::to_string(metadata).unwrap_or_else(|_| "{}".to_string()),
                );
            }
        }
        fields
    }

    pub fn from_fields(fields: &Fields) -> Result<Self, StoreError> {
        let get = |name: &str| {
            fields
                .get(name)
                .cloned()
                .ok_or_else(|| StoreError::MalformedEntry(format!("missing field '{name}'")))
        };
        let timestamp = DateTime::parse_from_rfc3339(&get("timestamp")?)
            .map_err(|e| StoreError::MalformedEntry(format!("bad timestamp: {e}")))?
            .with_timezone(&Utc);

        if fields.get("type").map(String::as_str) == Some(SYSTEM_SIGNAL) {
            let metadata = match fields.get("metadata") {
                Some(raw) => serde_json::from_str(raw)?,
                None => BTreeMap::new(),
            };
            Ok(TranscriptEntry::SystemSignal {
                event: get("event")?,
                agent_id: get("agent_id")?,
                timestamp,
                metadata,
            })
        } else {
            Ok(TranscriptEntry::Utterance {
                agent_id: get("agent_id")?,
                text: get("text")?,
                timestamp,
                node_id: get("node_id")?,
            })
        }
    }
}

// Truncated to the precision the wire format keeps.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
