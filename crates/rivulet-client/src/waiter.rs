//! Ordinal-ordered message waiting.
//!
//! Deciding how to wait is pure ([`plan`]); the bookkeeping of who listens
//! for which ordinal lives in [`WaitTable`]. The core drives both.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::RangeInclusive;
use std::time::Duration;

use rivulet_shared::types::{Ordinal, RangeEnd, StreamKey, WaitTarget};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitOptions {
    /// Largest gap worth listening for. Defaults to the configured value.
    pub max: Option<u64>,
    /// How long to listen before fetching instead.
    pub timeout: Option<Duration>,
    /// Do nothing when a live participant channel will deliver anyway.
    pub unless_socket: bool,
    /// Wait even when nothing is known about the stream.
    pub even_if_not_retained: bool,
}

/// How a wait request resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitPlan {
    NotCached,
    AlreadySatisfied,
    Skipped,
    Fallback { min: Ordinal, max: RangeEnd },
    Listen { from: Ordinal, to: Ordinal },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The stream is not cached; nothing to order against.
    NotCached,
    AlreadySatisfied,
    Skipped,
    /// Everything through this ordinal has been delivered.
    Delivered(Ordinal),
}

pub fn plan(
    latest: Ordinal,
    target: WaitTarget,
    socket_live: bool,
    participant_will_deliver: bool,
    max: u64,
    options: &WaitOptions,
) -> WaitPlan {
    if latest == 0 && !options.even_if_not_retained {
        return WaitPlan::NotCached;
    }
    match target {
        WaitTarget::Ordinal(n) if n <= latest => return WaitPlan::AlreadySatisfied,
        WaitTarget::Ordinal(n) if socket_live && n.saturating_sub(max) <= latest => {
            return WaitPlan::Listen {
                from: latest + 1,
                to: n,
            };
        }
        _ => {}
    }
    if options.unless_socket && socket_live && participant_will_deliver {
        return WaitPlan::Skipped;
    }
    WaitPlan::Fallback {
        min: latest + 1,
        max: target.into(),
    }
}

// ---------------------------------------------------------------------------
// Listener table
// ---------------------------------------------------------------------------

pub type WaitId = u64;

#[derive(Debug)]
struct Wait<C> {
    key: StreamKey,
    target: WaitTarget,
    pending: BTreeSet<Ordinal>,
    completion: Option<C>,
}

/// Outstanding waits and the ordinals each still needs.
#[derive(Debug)]
pub struct WaitTable<C> {
    next_id: WaitId,
    waits: HashMap<WaitId, Wait<C>>,
    listeners: HashMap<StreamKey, BTreeMap<Ordinal, Vec<WaitId>>>,
}

impl<C> Default for WaitTable<C> {
    fn default() -> Self {
        Self {
            next_id: 0,
            waits: HashMap::new(),
            listeners: HashMap::new(),
        }
    }
}

impl<C> WaitTable<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wait listening on `ordinals` (possibly empty, for waits
    /// that go straight to a fetch).
    pub fn insert(
        &mut self,
        key: StreamKey,
        target: WaitTarget,
        ordinals: RangeInclusive<Ordinal>,
        completion: C,
    ) -> WaitId {
        self.next_id += 1;
        let id = self.next_id;
        let pending: BTreeSet<Ordinal> = ordinals.collect();
        if !pending.is_empty() {
            let by_ordinal = self.listeners.entry(key.clone()).or_default();
            for ordinal in &pending {
                by_ordinal.entry(*ordinal).or_default().push(id);
            }
        }
        self.waits.insert(
            id,
            Wait {
                key,
                target,
                pending,
                completion: Some(completion),
            },
        );
        id
    }

    /// Start listening on more ordinals for an existing wait.
    pub fn listen(&mut self, id: WaitId, ordinals: RangeInclusive<Ordinal>) -> bool {
        let Some(wait) = self.waits.get_mut(&id) else {
            return false;
        };
        if ordinals.is_empty() {
            return true;
        }
        let by_ordinal = self.listeners.entry(wait.key.clone()).or_default();
        for ordinal in ordinals {
            if wait.pending.insert(ordinal) {
                by_ordinal.entry(ordinal).or_default().push(id);
            }
        }
        true
    }

    /// An ordinal was delivered. Returns the waits it completed, in
    /// registration order.
    pub fn fill(&mut self, key: &StreamKey, ordinal: Ordinal) -> Vec<WaitId> {
        let Some(by_ordinal) = self.listeners.get_mut(key) else {
            return Vec::new();
        };
        let ids = by_ordinal.remove(&ordinal).unwrap_or_default();
        if by_ordinal.is_empty() {
            self.listeners.remove(key);
        }

        let mut completed = Vec::new();
        for id in ids {
            if let Some(wait) = self.waits.get_mut(&id) {
                wait.pending.remove(&ordinal);
                if wait.pending.is_empty() {
                    completed.push(id);
                }
            }
        }
        completed.sort_unstable();
        completed
    }

    /// Finish a wait and deregister its remaining listeners. Yields the
    /// completion at most once.
    pub fn complete(&mut self, id: WaitId) -> Option<C> {
        let wait = self.waits.remove(&id)?;
        if let Some(by_ordinal) = self.listeners.get_mut(&wait.key) {
            for ordinal in &wait.pending {
                if let Some(ids) = by_ordinal.get_mut(ordinal) {
                    ids.retain(|w| *w != id);
                    if ids.is_empty() {
                        by_ordinal.remove(ordinal);
                    }
                }
            }
            if by_ordinal.is_empty() {
                self.listeners.remove(&wait.key);
            }
        }
        wait.completion
    }

    /// Take the completion but keep listening.
    pub fn take_completion(&mut self, id: WaitId) -> Option<C> {
        self.waits.get_mut(&id)?.completion.take()
    }

    pub fn completion(&self, id: WaitId) -> Option<&C> {
        self.waits.get(&id)?.completion.as_ref()
    }

    pub fn target(&self, id: WaitId) -> Option<(StreamKey, WaitTarget)> {
        self.waits.get(&id).map(|w| (w.key.clone(), w.target))
    }

    /// Whether the wait still has ordinals to hear about.
    pub fn is_listening(&self, id: WaitId) -> bool {
        self.waits.get(&id).is_some_and(|w| !w.pending.is_empty())
    }

    pub fn contains(&self, id: WaitId) -> bool {
        self.waits.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.waits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waits.is_empty()
    }

    /// Drop every wait, returning the completions that never ran.
    pub fn drain(&mut self) -> Vec<C> {
        self.listeners.clear();
        let mut waits: Vec<(WaitId, Wait<C>)> = self.waits.drain().collect();
        waits.sort_by_key(|(id, _)| *id);
        waits.into_iter().filter_map(|(_, w)| w.completion).collect()
    }
}
