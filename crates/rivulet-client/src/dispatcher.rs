//! Multi-axis event dispatch.
//!
//! Handlers register under a tuple of optional axis values, `None` meaning
//! "any value". Firing a concrete key invokes every handler set whose key
//! subsumes it, most specific first, each set at most once.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

pub type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub(crate) u64);

/// A dispatch key made of wildcardable axes.
pub trait Axes: Clone + Eq + Hash {
    /// Every key that matches `self`, most specific first: fewest wildcards,
    /// then keeping earlier axes concrete longest. Duplicates are removed.
    fn subsuming(&self) -> Vec<Self>;
}

impl Axes for () {
    fn subsuming(&self) -> Vec<Self> {
        vec![()]
    }
}

macro_rules! impl_axes {
    ($arity:expr; $($T:ident . $idx:tt),+) => {
        impl<$($T: Clone + Eq + Hash),+> Axes for ($(Option<$T>,)+) {
            fn subsuming(&self) -> Vec<Self> {
                // Bit (arity - 1 - i) set means axis i is wildcarded.
                let mut masks: Vec<u32> = (0..(1u32 << $arity)).collect();
                masks.sort_by_key(|m| (m.count_ones(), *m));

                let mut keys: Vec<Self> = Vec::with_capacity(masks.len());
                for mask in masks {
                    let key = ($(
                        if mask & (1u32 << ($arity - 1 - $idx)) != 0 {
                            None
                        } else {
                            self.$idx.clone()
                        },
                    )+);
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
                keys
            }
        }
    };
}

impl_axes!(1; A.0);
impl_axes!(2; A.0, B.1);
impl_axes!(3; A.0, B.1, C.2);

pub struct Dispatcher<K: Axes, E> {
    handlers: HashMap<K, Vec<(HandlerId, Handler<E>)>>,
    index: HashMap<HandlerId, K>,
}

impl<K: Axes, E> Default for Dispatcher<K, E> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
            index: HashMap::new(),
        }
    }
}

impl<K: Axes, E> Dispatcher<K, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: HandlerId, key: K, handler: Handler<E>) {
        self.handlers
            .entry(key.clone())
            .or_default()
            .push((id, handler));
        self.index.insert(id, key);
    }

    /// Returns `false` if `id` was not registered here.
    pub fn remove(&mut self, id: HandlerId) -> bool {
        let Some(key) = self.index.remove(&id) else {
            return false;
        };
        if let Some(list) = self.handlers.get_mut(&key) {
            list.retain(|(h, _)| *h != id);
            if list.is_empty() {
                self.handlers.remove(&key);
            }
        }
        true
    }

    /// Invoke every matching handler and return how many ran. Handler panics
    /// propagate to the caller.
    pub fn dispatch(&self, key: &K, event: &E) -> usize {
        // Snapshot first so the handler list can't shift under us.
        let matched: Vec<Handler<E>> = key
            .subsuming()
            .iter()
            .filter_map(|k| self.handlers.get(k))
            .flat_map(|list| list.iter().map(|(_, h)| h.clone()))
            .collect();
        for handler in &matched {
            handler(event);
        }
        matched.len()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(
        log: &Arc<Mutex<Vec<&'static str>>>,
        label: &'static str,
    ) -> Handler<u32> {
        let log = log.clone();
        Arc::new(move |_: &u32| log.lock().unwrap().push(label))
    }

    #[test]
    fn test_two_axis_expansion_order() {
        let key = (Some("A"), Some("B"));
        assert_eq!(
            key.subsuming(),
            vec![
                (Some("A"), Some("B")),
                (Some("A"), None),
                (None, Some("B")),
                (None, None),
            ]
        );
    }

    #[test]
    fn test_expansion_dedups_concrete_wildcards() {
        let key: (Option<&str>, Option<&str>) = (Some("A"), None);
        assert_eq!(key.subsuming(), vec![(Some("A"), None), (None, None)]);
    }

    #[test]
    fn test_three_axis_expansion_is_complete() {
        let keys = (Some(1), Some(2), Some(3)).subsuming();
        assert_eq!(keys.len(), 8);
        assert_eq!(keys[0], (Some(1), Some(2), Some(3)));
        assert_eq!(keys[1], (Some(1), Some(2), None));
        assert_eq!(keys[7], (None, None, None));
    }

    #[test]
    fn test_dispatch_completeness() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut d: Dispatcher<(Option<&str>, Option<&str>), u32> = Dispatcher::new();
        d.add(HandlerId(1), (Some("A"), Some("B")), recorder(&log, "AB"));
        d.add(HandlerId(2), (Some("A"), None), recorder(&log, "A*"));
        d.add(HandlerId(3), (None, Some("B")), recorder(&log, "*B"));
        d.add(HandlerId(4), (None, None), recorder(&log, "**"));
        d.add(HandlerId(5), (Some("C"), Some("D")), recorder(&log, "CD"));

        let fired = d.dispatch(&(Some("A"), Some("B")), &0);
        assert_eq!(fired, 4);
        assert_eq!(*log.lock().unwrap(), vec!["AB", "A*", "*B", "**"]);
    }

    #[test]
    fn test_remove_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut d: Dispatcher<(Option<&str>,), u32> = Dispatcher::new();
        d.add(HandlerId(1), (Some("x"),), recorder(&log, "x"));
        d.add(HandlerId(2), (None,), recorder(&log, "any"));

        assert!(d.remove(HandlerId(1)));
        assert!(!d.remove(HandlerId(1)));
        assert_eq!(d.dispatch(&(Some("x"),), &0), 1);
        assert_eq!(*log.lock().unwrap(), vec!["any"]);
        assert_eq!(d.len(), 1);
    }
}
