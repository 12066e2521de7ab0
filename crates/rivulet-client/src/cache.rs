//! Bounded result caches.
//!
//! Every table is a small LRU keyed by the full query, so two lookups with
//! different options never share an entry. Streams are cached as shared
//! instances; the other tables hold the payload the service returned.

use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;

use rivulet_net::ParticipatingQuery;
use rivulet_shared::models::{Participant, Relation};
use rivulet_shared::protocol::{BatchItem, BatchPayload, RelatedQuery, StreamQuery};
use rivulet_shared::types::StreamKey;

use crate::config::CacheCapacities;
use crate::stream::SharedStream;

// ---------------------------------------------------------------------------
// LRU helpers
// ---------------------------------------------------------------------------

fn bounded<K: Hash + Eq, V>(capacity: usize) -> LruCache<K, V> {
    LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN))
}

/// Keep only the entries for which `keep` returns true. Returns how many
/// were dropped.
pub fn retain<K: Hash + Eq + Clone, V>(
    cache: &mut LruCache<K, V>,
    mut keep: impl FnMut(&K, &V) -> bool,
) -> usize {
    let doomed: Vec<K> = cache
        .iter()
        .filter(|(k, v)| !keep(*k, *v))
        .map(|(k, _)| k.clone())
        .collect();
    for key in &doomed {
        cache.pop(key);
    }
    doomed.len()
}

// ---------------------------------------------------------------------------
// Coordinator tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum CachedStream {
    Found(SharedStream),
    /// Negative entry, kept only when the caller asked for it.
    Missing,
}

/// Result of a `related` query.
#[derive(Debug, Clone)]
pub struct Related {
    pub stream: SharedStream,
    pub relations: Vec<Relation>,
    pub streams: Vec<SharedStream>,
}

pub struct Caches {
    pub streams: LruCache<StreamQuery, CachedStream>,
    pub messages: LruCache<BatchItem, BatchPayload>,
    pub participants: LruCache<BatchItem, BatchPayload>,
    pub avatars: LruCache<BatchItem, BatchPayload>,
    pub related: LruCache<RelatedQuery, Related>,
    pub participating: LruCache<ParticipatingQuery, Vec<Participant>>,
}

impl Caches {
    pub fn new(capacities: &CacheCapacities) -> Self {
        Self {
            streams: bounded(capacities.streams),
            messages: bounded(capacities.messages),
            participants: bounded(capacities.participants),
            avatars: bounded(capacities.avatars),
            related: bounded(capacities.related),
            participating: bounded(capacities.participating),
        }
    }

    /// The payload table serving a non-stream lookup.
    pub fn table(&mut self, item: &BatchItem) -> Option<&mut LruCache<BatchItem, BatchPayload>> {
        match item {
            BatchItem::Message { .. } | BatchItem::Messages { .. } => Some(&mut self.messages),
            BatchItem::Participant { .. } | BatchItem::Participants { .. } => {
                Some(&mut self.participants)
            }
            BatchItem::Avatar { .. } => Some(&mut self.avatars),
            BatchItem::Stream(_) => None,
        }
    }

    pub fn clear(&mut self) {
        self.streams.clear();
        self.messages.clear();
        self.participants.clear();
        self.avatars.clear();
        self.related.clear();
        self.participating.clear();
    }

    /// Any cached instance for the stream, whatever query produced it.
    pub fn stream_instance(&self, key: &StreamKey) -> Option<SharedStream> {
        if let Some(CachedStream::Found(s)) = self.streams.peek(&StreamQuery::plain(key.clone())) {
            return Some(s.clone());
        }
        self.streams.iter().find_map(|(_, entry)| match entry {
            CachedStream::Found(s) if crate::stream::read(s).key() == key => Some(s.clone()),
            _ => None,
        })
    }

    /// Drop every stream query for `key`.
    pub fn forget_stream(&mut self, key: &StreamKey) -> usize {
        retain(&mut self.streams, |q, _| &q.key != key)
    }

    /// Drop everything known about `key`.
    pub fn forget_all_for(&mut self, key: &StreamKey) {
        self.forget_stream(key);
        let other_stream = |item: &BatchItem, _: &BatchPayload| item.stream_key() != Some(key);
        retain(&mut self.messages, other_stream);
        retain(&mut self.participants, other_stream);
        retain(&mut self.related, |q, _| &q.key != key);
    }

    /// A new message makes "latest" queries stale.
    pub fn invalidate_for_post(&mut self, key: &StreamKey) {
        retain(&mut self.streams, |q, _| {
            !(&q.key == key && q.messages.is_some())
        });
        retain(&mut self.messages, |item, _| match item {
            BatchItem::Messages { key: k, range } => !(k == key && range.is_open_ended()),
            _ => true,
        });
    }

    /// Participant lists and stream queries that embed them go stale on
    /// join and leave.
    pub fn invalidate_participants(&mut self, key: &StreamKey) {
        retain(&mut self.participants, |item, _| match item {
            BatchItem::Participants { key: k, .. } => k != key,
            _ => true,
        });
        retain(&mut self.streams, |q, _| {
            !(&q.key == key && q.participants.is_some())
        });
    }

    pub fn invalidate_related(&mut self, key: &StreamKey) {
        retain(&mut self.related, |q, _| &q.key != key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivulet_shared::protocol::MessageRange;
    use rivulet_shared::types::RangeEnd;

    #[test]
    fn test_zero_capacity_still_holds_one() {
        let mut cache = bounded(0);
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.peek(&"b"), Some(&2));
    }

    #[test]
    fn test_retain_drops_and_counts() {
        let mut cache = bounded(10);
        for i in 0..6 {
            cache.put(i, i * 10);
        }
        let removed = retain(&mut cache, |k, _| k % 2 == 0);
        assert_eq!(removed, 3);
        assert_eq!(cache.len(), 3);
        assert!(cache.contains(&4));
        assert!(!cache.contains(&5));
    }

    #[test]
    fn test_forget_stream_drops_every_query_for_key() {
        let mut caches = Caches::new(&CacheCapacities::default());
        let key = StreamKey::new("u1", "chat/1").unwrap();
        let other = StreamKey::new("u1", "chat/2").unwrap();
        caches
            .streams
            .put(StreamQuery::plain(key.clone()), CachedStream::Missing);
        caches
            .streams
            .put(StreamQuery::plain(other.clone()), CachedStream::Missing);

        assert_eq!(caches.forget_stream(&key), 1);
        assert!(!caches.streams.contains(&StreamQuery::plain(key)));
        assert!(caches.streams.contains(&StreamQuery::plain(other)));
    }

    #[test]
    fn test_invalidate_for_post_keeps_closed_ranges() {
        let mut caches = Caches::new(&CacheCapacities::default());
        let key = StreamKey::new("u1", "chat/1").unwrap();
        let open = BatchItem::Messages {
            key: key.clone(),
            range: MessageRange::between(1, RangeEnd::Latest),
        };
        let closed = BatchItem::Messages {
            key: key.clone(),
            range: MessageRange::between(1, RangeEnd::Ordinal(5)),
        };
        caches.messages.put(open.clone(), BatchPayload::Messages(vec![]));
        caches.messages.put(closed.clone(), BatchPayload::Messages(vec![]));

        caches.invalidate_for_post(&key);
        assert!(!caches.messages.contains(&open));
        assert!(caches.messages.contains(&closed));
    }
}
