//! Partition routing.
//!
//! Each publisher's streams live on exactly one backend. With no shards
//! configured everything goes to the base URL; otherwise the publisher id
//! is hashed with BLAKE3 to pick a shard, so the choice is stable across
//! processes.

use std::fmt;

use rivulet_shared::protocol::BatchItem;
use rivulet_shared::types::{PublisherId, UserId};

/// A backend partition, identified by its base URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition(String);

impl Partition {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self(base_url.into().trim_end_matches('/').to_string())
    }

    pub fn base_url(&self) -> &str {
        &self.0
    }

    /// `{base}/{path}`
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.0, path.trim_start_matches('/'))
    }

    /// WebSocket endpoint of the partition's push channel.
    pub fn socket_url(&self) -> String {
        let base = if let Some(rest) = self.0.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.0.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.0.clone()
        };
        format!("{base}/socket")
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Router {
    base: Partition,
    shards: Vec<Partition>,
}

impl Router {
    pub fn new(base_url: &str, shards: &[String]) -> Self {
        Self {
            base: Partition::new(base_url),
            shards: shards.iter().map(|s| Partition::new(s.as_str())).collect(),
        }
    }

    /// Every partition a push channel may be opened to.
    pub fn partitions(&self) -> Vec<Partition> {
        if self.shards.is_empty() {
            vec![self.base.clone()]
        } else {
            self.shards.clone()
        }
    }

    pub fn for_publisher(&self, publisher: &PublisherId) -> Partition {
        self.pick(publisher.as_str())
    }

    /// Avatars are served by the partition owning the user's own streams.
    pub fn for_user(&self, user: &UserId) -> Partition {
        self.pick(user.as_str())
    }

    pub fn for_item(&self, item: &BatchItem) -> Partition {
        match item {
            BatchItem::Avatar { user_id } => self.for_user(user_id),
            other => match other.stream_key() {
                Some(key) => self.for_publisher(&key.publisher_id),
                None => self.base.clone(),
            },
        }
    }

    fn pick(&self, id: &str) -> Partition {
        if self.shards.is_empty() {
            return self.base.clone();
        }
        let hash = blake3::hash(id.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash.as_bytes()[..8]);
        let index = (u64::from_le_bytes(prefix) % self.shards.len() as u64) as usize;
        self.shards[index].clone()
    }
}
