//! Entity records as exchanged with the Streams service.
//!
//! These are plain data: caching, identity sharing and change tracking live
//! in `rivulet-client`. JSON side payloads (attributes, instructions,
//! extras) stay strings on the wire and are parsed on demand.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::levels::{Access, AdminLevel, ReadLevel, WriteLevel};
use crate::types::{Ordinal, PublisherId, StreamKey, StreamName, UserId};

fn empty_json_object() -> String {
    "{}".to_string()
}

/// Parse a JSON object string, treating anything malformed as empty.
pub fn parse_json_object(raw: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamFields {
    pub publisher_id: PublisherId,
    pub name: StreamName,
    #[serde(rename = "type")]
    pub stream_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    /// JSON object, serialized.
    #[serde(default = "empty_json_object")]
    pub attributes: String,
    #[serde(default)]
    pub icon: String,
    /// JSON array of permission names, serialized.
    #[serde(default)]
    pub permissions: Option<String>,
    #[serde(default)]
    pub message_count: Ordinal,
    #[serde(default)]
    pub invited_count: u64,
    #[serde(default)]
    pub participating_count: u64,
    #[serde(default)]
    pub left_count: u64,
    #[serde(default)]
    pub inserted_time: Option<String>,
    #[serde(default)]
    pub updated_time: Option<String>,
    #[serde(default)]
    pub closed_time: Option<String>,
    pub read_level: ReadLevel,
    pub write_level: WriteLevel,
    pub admin_level: AdminLevel,
    #[serde(default)]
    pub inherit_access: Option<String>,
    /// Levels granted to the current user. Sent alongside the row, not part of it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<Access>,
    /// The current user's participation, when the server includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_required: Option<bool>,
}

impl StreamFields {
    pub fn key(&self) -> StreamKey {
        StreamKey::from_parts(self.publisher_id.clone(), self.name.clone())
    }

    /// Row fields as a JSON map, used to diff one version against another.
    /// The per-user extras (`access`, `participant`, `isRequired`) are left out.
    pub fn field_map(&self) -> Map<String, Value> {
        let mut map = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        map.remove("access");
        map.remove("participant");
        map.remove("isRequired");
        map
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub publisher_id: PublisherId,
    pub stream_name: StreamName,
    pub ordinal: Ordinal,
    #[serde(rename = "type")]
    pub message_type: String,
    /// Type of the stream the message was posted to, included by push events.
    #[serde(default)]
    pub stream_type: Option<String>,
    #[serde(default)]
    pub content: String,
    /// JSON object, serialized.
    #[serde(default = "empty_json_object")]
    pub instructions: String,
    #[serde(default)]
    pub by_user_id: Option<UserId>,
    #[serde(default)]
    pub inserted_time: Option<String>,
}

impl Message {
    pub fn key(&self) -> StreamKey {
        StreamKey::from_parts(self.publisher_id.clone(), self.stream_name.clone())
    }

    pub fn instructions(&self) -> Map<String, Value> {
        parse_json_object(&self.instructions)
    }

    pub fn instruction(&self, name: &str) -> Option<Value> {
        self.instructions().remove(name)
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::from_type(&self.message_type)
    }
}

/// Message types the coordinator reacts to. Anything else is delivered to
/// listeners without side effects on the caches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Join,
    Leave,
    Joined,
    Left,
    Changed,
    Progress,
    Closed,
    Relation(RelationChange),
    Other(String),
}

impl MessageKind {
    pub fn from_type(message_type: &str) -> Self {
        match message_type {
            "Streams/join" => MessageKind::Join,
            "Streams/leave" => MessageKind::Leave,
            "Streams/joined" => MessageKind::Joined,
            "Streams/left" => MessageKind::Left,
            "Streams/changed" => MessageKind::Changed,
            "Streams/progress" => MessageKind::Progress,
            "Streams/closed" => MessageKind::Closed,
            "Streams/relatedFrom" => MessageKind::Relation(RelationChange::RelatedFrom),
            "Streams/relatedTo" => MessageKind::Relation(RelationChange::RelatedTo),
            "Streams/unrelatedFrom" => MessageKind::Relation(RelationChange::UnrelatedFrom),
            "Streams/unrelatedTo" => MessageKind::Relation(RelationChange::UnrelatedTo),
            "Streams/updatedRelateFrom" => {
                MessageKind::Relation(RelationChange::UpdatedRelateFrom)
            }
            "Streams/updatedRelateTo" => MessageKind::Relation(RelationChange::UpdatedRelateTo),
            other => MessageKind::Other(other.to_string()),
        }
    }
}

/// Relation notifications, seen from the stream the message was posted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationChange {
    RelatedFrom,
    RelatedTo,
    UnrelatedFrom,
    UnrelatedTo,
    UpdatedRelateFrom,
    UpdatedRelateTo,
}

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantState {
    Invited,
    Participating,
    Left,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub publisher_id: PublisherId,
    pub stream_name: StreamName,
    pub user_id: UserId,
    pub state: ParticipantState,
    #[serde(default)]
    pub stream_type: Option<String>,
    /// JSON object, serialized.
    #[serde(default = "empty_json_object")]
    pub extra: String,
    #[serde(default)]
    pub inserted_time: Option<String>,
}

impl Participant {
    pub fn key(&self) -> StreamKey {
        StreamKey::from_parts(self.publisher_id.clone(), self.stream_name.clone())
    }

    pub fn extras(&self) -> Map<String, Value> {
        parse_json_object(&self.extra)
    }

    pub fn extra(&self, name: &str) -> Option<Value> {
        self.extras().remove(name)
    }
}

// ---------------------------------------------------------------------------
// Avatar
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Avatar {
    #[serde(alias = "publisherId")]
    pub user_id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub icon: String,
}

impl Avatar {
    /// "First Last", falling back to the username, then to `fallback`.
    pub fn display_name(&self, fallback: &str) -> String {
        let full = [self.first_name.trim(), self.last_name.trim()]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
        if !full.is_empty() {
            full
        } else if !self.username.is_empty() {
            self.username.clone()
        } else {
            fallback.to_string()
        }
    }

    /// Update the avatar part that a `Streams/user/*` stream mirrors.
    /// Returns `false` when the stream name is not one of those.
    pub fn apply_user_stream(&mut self, stream_name: &str, content: &str) -> bool {
        let slot = match stream_name {
            "Streams/user/firstName" => &mut self.first_name,
            "Streams/user/lastName" => &mut self.last_name,
            "Streams/user/username" => &mut self.username,
            "Streams/user/icon" => &mut self.icon,
            _ => return false,
        };
        *slot = content.to_string();
        true
    }
}

// ---------------------------------------------------------------------------
// Relation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    pub to_publisher_id: PublisherId,
    pub to_stream_name: StreamName,
    #[serde(rename = "type")]
    pub relation_type: String,
    pub from_publisher_id: PublisherId,
    pub from_stream_name: StreamName,
    #[serde(default)]
    pub weight: Option<f64>,
}

impl Relation {
    pub fn to_key(&self) -> StreamKey {
        StreamKey::from_parts(self.to_publisher_id.clone(), self.to_stream_name.clone())
    }

    pub fn from_key(&self) -> StreamKey {
        StreamKey::from_parts(self.from_publisher_id.clone(), self.from_stream_name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_fields_from_wire() {
        let json = r#"{
            "publisherId": "u1",
            "name": "Streams/chat/1",
            "type": "Streams/chat",
            "attributes": "{\"color\":\"red\"}",
            "messageCount": 7,
            "readLevel": 40,
            "writeLevel": 20,
            "adminLevel": 0,
            "access": {"readLevel": 40, "writeLevel": 10, "adminLevel": 0}
        }"#;
        let fields: StreamFields = serde_json::from_str(json).unwrap();
        assert_eq!(fields.message_count, 7);
        assert_eq!(fields.write_level, WriteLevel::Post);
        assert_eq!(fields.key(), StreamKey::new("u1", "Streams/chat/1").unwrap());

        let map = fields.field_map();
        assert!(map.contains_key("messageCount"));
        assert!(!map.contains_key("access"));
    }

    #[test]
    fn test_message_kind_parsing() {
        assert_eq!(MessageKind::from_type("Streams/changed"), MessageKind::Changed);
        assert_eq!(
            MessageKind::from_type("Streams/unrelatedTo"),
            MessageKind::Relation(RelationChange::UnrelatedTo)
        );
        assert_eq!(
            MessageKind::from_type("Streams/chat/message"),
            MessageKind::Other("Streams/chat/message".to_string())
        );
    }

    #[test]
    fn test_malformed_instructions_are_empty() {
        let msg = Message {
            publisher_id: PublisherId::new("u1").unwrap(),
            stream_name: StreamName::new("s").unwrap(),
            ordinal: 1,
            message_type: "t".into(),
            stream_type: None,
            content: String::new(),
            instructions: "not json".into(),
            by_user_id: None,
            inserted_time: None,
        };
        assert!(msg.instructions().is_empty());
        assert_eq!(msg.instruction("x"), None);
    }

    #[test]
    fn test_avatar_display_name() {
        let mut avatar = Avatar {
            user_id: UserId::new("u1").unwrap(),
            username: "zed".into(),
            first_name: String::new(),
            last_name: String::new(),
            icon: String::new(),
        };
        assert_eq!(avatar.display_name("Someone"), "zed");
        assert!(avatar.apply_user_stream("Streams/user/firstName", "Ada"));
        assert_eq!(avatar.display_name("Someone"), "Ada");
        assert!(!avatar.apply_user_stream("Streams/chat/1", "x"));
    }
}
