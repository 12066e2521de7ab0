use serde::{Deserialize, Serialize};

use crate::models::{Avatar, Message, Participant, ParticipantState, Relation, StreamFields};
use crate::types::{Ordinal, RangeEnd, StreamKey, UserId};

// ---------------------------------------------------------------------------
// Push channel
// ---------------------------------------------------------------------------

/// Notifications delivered over a real-time push channel.
///
/// Stream changes, closings and relation updates arrive as `post` events
/// whose message type says what happened (see [`crate::models::MessageKind`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum PushEvent {
    Post(Message),
    Join(Participant),
    Leave(Participant),
    /// The stream was removed on the server; drop it from the caches.
    Remove(StreamKey),
}

impl PushEvent {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn stream_key(&self) -> StreamKey {
        match self {
            PushEvent::Post(m) => m.key(),
            PushEvent::Join(p) | PushEvent::Leave(p) => p.key(),
            PushEvent::Remove(k) => k.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Queries (also used as cache keys)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    pub key: StreamKey,
    /// Also return up to this many participants.
    #[serde(default)]
    pub participants: Option<u32>,
    /// Also return up to this many of the latest messages.
    #[serde(default)]
    pub messages: Option<u32>,
}

impl StreamQuery {
    pub fn plain(key: StreamKey) -> Self {
        Self {
            key,
            participants: None,
            messages: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRange {
    #[serde(default)]
    pub min: Option<Ordinal>,
    pub max: RangeEnd,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default, rename = "type")]
    pub message_type: Option<String>,
    #[serde(default)]
    pub ascending: Option<bool>,
}

impl MessageRange {
    pub fn between(min: Ordinal, max: RangeEnd) -> Self {
        Self {
            min: Some(min),
            max,
            limit: None,
            message_type: None,
            ascending: None,
        }
    }

    /// Ranges ending at "latest" go stale whenever a new message arrives.
    pub fn is_open_ended(&self) -> bool {
        self.max == RangeEnd::Latest
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantCriteria {
    #[serde(default)]
    pub limit: Option<u32>,
    /// Negative offsets sort by descending insertion time.
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub state: Option<ParticipantState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedQuery {
    pub key: StreamKey,
    #[serde(default)]
    pub relation_type: Option<String>,
    /// `true` when `key` is the category and the related streams point to it.
    #[serde(default)]
    pub is_category: bool,
}

// ---------------------------------------------------------------------------
// Batch RPC
// ---------------------------------------------------------------------------

/// One lookup inside a batch request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BatchItem {
    Stream(StreamQuery),
    Message { key: StreamKey, ordinal: Ordinal },
    Messages { key: StreamKey, range: MessageRange },
    Participant { key: StreamKey, user_id: UserId },
    Participants { key: StreamKey, criteria: ParticipantCriteria },
    Avatar { user_id: UserId },
}

impl BatchItem {
    /// The stream this lookup concerns, if any (avatars are per user).
    pub fn stream_key(&self) -> Option<&StreamKey> {
        match self {
            BatchItem::Stream(q) => Some(&q.key),
            BatchItem::Message { key, .. }
            | BatchItem::Messages { key, .. }
            | BatchItem::Participant { key, .. }
            | BatchItem::Participants { key, .. } => Some(key),
            BatchItem::Avatar { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamBundle {
    pub stream: StreamFields,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub participants: Vec<Participant>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum BatchPayload {
    Stream(StreamBundle),
    Message(Message),
    Messages(Vec<Message>),
    Participant(Participant),
    Participants(Vec<Participant>),
    Avatar(Avatar),
}

/// Per-item outcome. One bad key never fails its siblings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum BatchSlot {
    Ok(BatchPayload),
    NotFound(String),
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchRequest {
    pub batch: Vec<BatchItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchResponse {
    pub batch: Vec<BatchSlot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelatedResult {
    pub stream: StreamFields,
    #[serde(default)]
    pub relations: Vec<Relation>,
    #[serde(default)]
    pub related_streams: Vec<StreamFields>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_event_wire_shape() {
        let text = r#"{"event":"post","data":{
            "publisherId":"u1","streamName":"chat/1","ordinal":3,
            "type":"Streams/chat/message","streamType":"Streams/chat"
        }}"#;
        let event = PushEvent::from_json(text).unwrap();
        match &event {
            PushEvent::Post(m) => {
                assert_eq!(m.ordinal, 3);
                assert_eq!(m.instructions, "{}");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(event.stream_key(), StreamKey::new("u1", "chat/1").unwrap());
    }

    #[test]
    fn test_batch_item_tagging() {
        let item = BatchItem::Message {
            key: StreamKey::new("u1", "chat/1").unwrap(),
            ordinal: 4,
        };
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["kind"], "message");
        assert_eq!(value["key"]["streamName"], "chat/1");
    }

    #[test]
    fn test_open_ended_range() {
        assert!(MessageRange::between(3, RangeEnd::Latest).is_open_ended());
        assert!(!MessageRange::between(3, RangeEnd::Ordinal(9)).is_open_ended());
    }
}
