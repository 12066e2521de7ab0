use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

// Identity newtypes. They deserialize without checks (the server is trusted
// to send well-formed ids); construction from caller input goes through the
// validating `new` functions.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PublisherId(String);

impl PublisherId {
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ValidationError::EmptyPublisherId);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PublisherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct StreamName(String);

impl StreamName {
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ValidationError::EmptyStreamName);
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Category streams conventionally end with a slash ("Streams/chats/").
    pub fn is_category(&self) -> bool {
        self.0.ends_with('/')
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ValidationError::EmptyUserId);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The same identity viewed as a stream publisher.
    pub fn as_publisher(&self) -> PublisherId {
        PublisherId(self.0.clone())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a stream: `(publisherId, streamName)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct StreamKey {
    pub publisher_id: PublisherId,
    pub stream_name: StreamName,
}

impl StreamKey {
    /// Validate raw identity parameters. Fails fast on empty parts so that
    /// malformed keys never reach the network.
    pub fn new(
        publisher_id: impl Into<String>,
        stream_name: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            publisher_id: PublisherId::new(publisher_id)?,
            stream_name: StreamName::new(stream_name)?,
        })
    }

    pub fn from_parts(publisher_id: PublisherId, stream_name: StreamName) -> Self {
        Self {
            publisher_id,
            stream_name,
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}", self.publisher_id, self.stream_name)
    }
}

/// Per-stream message sequence number, assigned by the server.
pub type Ordinal = u64;

/// What a message waiter is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WaitTarget {
    /// A specific ordinal.
    Ordinal(Ordinal),
    /// Whatever is newest on the server. Never satisfied by listening.
    Latest,
}

/// Upper bound of a message range query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RangeEnd {
    Ordinal(Ordinal),
    Latest,
}

impl From<WaitTarget> for RangeEnd {
    fn from(target: WaitTarget) -> Self {
        match target {
            WaitTarget::Ordinal(n) => RangeEnd::Ordinal(n),
            WaitTarget::Latest => RangeEnd::Latest,
        }
    }
}

/// Network availability as last reported by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionMode {
    Online,
    Offline,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_key_rejects_empty_parts() {
        assert_eq!(
            StreamKey::new("", "Streams/chat"),
            Err(ValidationError::EmptyPublisherId)
        );
        assert_eq!(
            StreamKey::new("u1", ""),
            Err(ValidationError::EmptyStreamName)
        );
        assert!(StreamKey::new("u1", "Streams/chat").is_ok());
    }

    #[test]
    fn test_stream_key_display_uses_tab() {
        let key = StreamKey::new("u1", "chat/1").unwrap();
        assert_eq!(key.to_string(), "u1\tchat/1");
    }

    #[test]
    fn test_category_name() {
        assert!(StreamName::new("Streams/chats/").unwrap().is_category());
        assert!(!StreamName::new("Streams/chats/1").unwrap().is_category());
    }
}
