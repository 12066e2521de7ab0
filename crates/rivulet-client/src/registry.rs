//! Retention registry: which streams must be kept fresh, and by whom.
//!
//! A symmetric double index of retain key ↔ stream. A stream takes part in
//! global refreshes while at least one key retains it.

use std::collections::{HashMap, HashSet};
use std::fmt;

use rivulet_shared::types::StreamKey;

use crate::stream::SharedStream;

/// Caller token a stream is retained under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RetainKey(String);

impl RetainKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// A key nobody else can collide with, for one-off retention.
    pub fn unique() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RetainKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for RetainKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl fmt::Display for RetainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Default)]
pub struct Registry {
    by_key: HashMap<RetainKey, HashSet<StreamKey>>,
    by_stream: HashMap<StreamKey, HashSet<RetainKey>>,
    /// Last known instance of every retained stream; `None` after a failed fetch.
    retained: HashMap<StreamKey, Option<SharedStream>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retain(&mut self, stream: StreamKey, key: RetainKey, instance: Option<SharedStream>) {
        self.by_key
            .entry(key.clone())
            .or_default()
            .insert(stream.clone());
        self.by_stream.entry(stream.clone()).or_default().insert(key);
        let slot = self.retained.entry(stream).or_insert(None);
        if instance.is_some() {
            *slot = instance;
        }
    }

    /// Remember that a stream someone wanted retained could not be fetched.
    pub fn remember_missing(&mut self, stream: StreamKey) {
        self.retained.insert(stream, None);
    }

    pub fn release_stream(&mut self, stream: &StreamKey) {
        self.retained.remove(stream);
        let Some(keys) = self.by_stream.remove(stream) else {
            return;
        };
        for key in keys {
            if let Some(streams) = self.by_key.get_mut(&key) {
                streams.remove(stream);
                if streams.is_empty() {
                    self.by_key.remove(&key);
                }
            }
        }
    }

    pub fn release(&mut self, key: &RetainKey) {
        let Some(streams) = self.by_key.remove(key) else {
            return;
        };
        for stream in streams {
            if let Some(keys) = self.by_stream.get_mut(&stream) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_stream.remove(&stream);
                    self.retained.remove(&stream);
                }
            }
        }
    }

    pub fn release_all(&mut self) {
        self.by_key.clear();
        self.by_stream.clear();
        self.retained.clear();
    }

    pub fn is_retained(&self, stream: &StreamKey) -> bool {
        self.by_stream.contains_key(stream)
    }

    /// Snapshot of every retained stream, in key order.
    pub fn retained_streams(&self) -> Vec<StreamKey> {
        let mut streams: Vec<StreamKey> = self.by_stream.keys().cloned().collect();
        streams.sort();
        streams
    }

    pub fn retained_by(&self, stream: &StreamKey) -> Vec<RetainKey> {
        let mut keys: Vec<RetainKey> = self
            .by_stream
            .get(stream)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn instance(&self, stream: &StreamKey) -> Option<SharedStream> {
        self.retained.get(stream).cloned().flatten()
    }

    pub fn clear(&mut self) {
        self.release_all();
    }
}
