//! Keeping retained streams fresh.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use rivulet_shared::error::StreamsError;
use rivulet_shared::protocol::StreamQuery;
use rivulet_shared::types::{StreamKey, WaitTarget};

use super::{Completion, Core, FetchOptions, Internal, Reply, StreamThen};
use crate::waiter::{WaitOptions, WaitPlan};

/// Options for [`crate::StreamsHandle::refresh`] and
/// [`crate::StreamsHandle::refresh_stream`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshOptions {
    /// Bring in the latest messages before refetching the stream.
    pub messages: bool,
    pub max: Option<u64>,
    pub timeout: Option<Duration>,
    /// Skip streams a live push channel keeps current.
    pub unless_socket: bool,
    /// Refresh even when nothing retains the stream.
    pub even_if_not_retained: bool,
    /// Fields that report a change even when equal.
    pub changed: Vec<String>,
}

impl RefreshOptions {
    fn wait_options(&self) -> WaitOptions {
        WaitOptions {
            max: self.max,
            timeout: self.timeout,
            unless_socket: self.unless_socket,
            even_if_not_retained: self.even_if_not_retained,
        }
    }
}

/// Who hears about a finished stream refresh.
pub(crate) enum RefreshDone {
    Caller(Reply<bool>),
    /// One stream of a global refresh.
    Member(u64),
    /// Internal refresh nobody waits on.
    Silent,
}

/// A global refresh waiting for its streams.
pub(crate) struct RefreshJoin {
    pub(crate) remaining: usize,
    pub(crate) first_error: Option<StreamsError>,
    pub(crate) reply: Option<Reply<bool>>,
}

/// The tick loop fell behind by more than the stall threshold, as it does
/// after the host sleeps.
pub(crate) fn is_stalled(last: Instant, now: Instant, interval: Duration, stall: Duration) -> bool {
    now.saturating_duration_since(last) > interval + stall
}

impl Core {
    /// Refresh every retained stream. Answers `false` when throttled or
    /// offline.
    pub(super) fn refresh_all(&mut self, options: RefreshOptions, reply: Option<Reply<bool>>) {
        let answer = |reply: Option<Reply<bool>>, result| {
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        };

        if !self.online {
            debug!("Offline, skipping refresh");
            answer(reply, Ok(false));
            return;
        }
        let now = Instant::now();
        if let Some(last) = self.last_refresh {
            if now.saturating_duration_since(last) < self.config.refresh_min_interval {
                debug!("Refreshed recently, skipping");
                answer(reply, Ok(false));
                return;
            }
        }
        self.last_refresh = Some(now);

        let streams = self.registry.retained_streams();
        if streams.is_empty() {
            answer(reply, Ok(true));
            return;
        }

        info!(count = streams.len(), "Refreshing retained streams");
        self.next_join += 1;
        let id = self.next_join;
        self.joins.insert(
            id,
            RefreshJoin {
                remaining: streams.len(),
                first_error: None,
                reply,
            },
        );
        for key in streams {
            self.refresh_stream(key, options.clone(), RefreshDone::Member(id));
        }
    }

    pub(super) fn refresh_stream(
        &mut self,
        key: StreamKey,
        options: RefreshOptions,
        done: RefreshDone,
    ) {
        if !self.online {
            self.finish_refresh(done, Ok(false));
            return;
        }
        if !options.even_if_not_retained && !self.registry.is_retained(&key) {
            debug!(stream = %key, "Not retained, dropping from cache instead of refreshing");
            self.caches.forget_stream(&key);
            self.finish_refresh(done, Ok(false));
            return;
        }

        if options.messages {
            let wait_options = options.wait_options();
            if let WaitPlan::Fallback { .. } =
                self.plan_wait(&key, WaitTarget::Latest, &wait_options)
            {
                let completion = Completion::Refresh {
                    key: key.clone(),
                    done,
                };
                let id = self.waits.insert(key, WaitTarget::Latest, 1..=0, completion);
                self.start_fallback(id);
                return;
            }
        }

        if options.unless_socket && self.socket_live(&key) {
            debug!(stream = %key, "Push channel live, skipping refresh");
            self.finish_refresh(done, Ok(false));
            return;
        }

        let fetch = FetchOptions {
            force: true,
            ..FetchOptions::default()
        };
        self.get_stream(
            StreamQuery::plain(key),
            fetch,
            None,
            options.changed,
            StreamThen::Refresh(done),
        );
    }

    pub(super) fn finish_refresh(&mut self, done: RefreshDone, result: Result<bool, StreamsError>) {
        match done {
            RefreshDone::Caller(reply) => {
                let _ = reply.send(result);
            }
            RefreshDone::Member(id) => {
                let Some(join) = self.joins.get_mut(&id) else {
                    return;
                };
                join.remaining = join.remaining.saturating_sub(1);
                if let Err(e) = result {
                    warn!(error = %e, "Stream refresh failed");
                    join.first_error.get_or_insert(e);
                }
                if join.remaining > 0 {
                    return;
                }
                if let Some(join) = self.joins.remove(&id) {
                    let outcome = match join.first_error {
                        Some(e) => Err(e),
                        None => Ok(true),
                    };
                    if let Some(reply) = join.reply {
                        let _ = reply.send(outcome);
                    }
                }
            }
            RefreshDone::Silent => {
                if let Err(e) = result {
                    warn!(error = %e, "Background stream refresh failed");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Automatic refresh
    // -----------------------------------------------------------------------

    pub(super) fn on_tick(&mut self, now: Instant) {
        let stalled = is_stalled(
            self.last_tick,
            now,
            self.config.tick_interval,
            self.config.stall_threshold,
        );
        self.last_tick = now;

        if stalled && !self.config.prevent_automatic_refresh {
            info!("Tick loop stalled, refreshing retained streams");
            self.refresh_all(RefreshOptions::default(), None);
        } else if self.config.refresh_every_tick {
            self.refresh_all(RefreshOptions::default(), None);
        }
    }

    /// Refresh `key` once messages of a watched type stop arriving for a
    /// moment.
    pub(super) fn debounce_refresh(&mut self, key: StreamKey) {
        self.debounce_generation += 1;
        let generation = self.debounce_generation;
        self.debounce.insert(key.clone(), generation);
        self.after(
            self.config.refresh_debounce,
            Internal::Debounced {
                epoch: self.epoch,
                key,
                generation,
            },
        );
    }

    pub(super) fn on_debounced(&mut self, key: StreamKey, generation: u64) {
        if self.debounce.get(&key) != Some(&generation) {
            return;
        }
        self.debounce.remove(&key);
        debug!(stream = %key, "Debounced refresh");
        let options = RefreshOptions {
            even_if_not_retained: true,
            ..RefreshOptions::default()
        };
        self.refresh_stream(key, options, RefreshDone::Silent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_stalled() {
        let last = Instant::now();
        let interval = Duration::from_secs(1);
        let stall = Duration::from_secs(5);

        assert!(!is_stalled(last, last + Duration::from_secs(1), interval, stall));
        assert!(!is_stalled(last, last + Duration::from_secs(6), interval, stall));
        assert!(is_stalled(last, last + Duration::from_secs(7), interval, stall));
        // A clock that went backwards is not a stall.
        assert!(!is_stalled(last + Duration::from_secs(3), last, interval, stall));
    }

    #[test]
    fn test_wait_options_carry_over() {
        let options = RefreshOptions {
            messages: true,
            max: Some(3),
            unless_socket: true,
            ..RefreshOptions::default()
        };
        let wait = options.wait_options();
        assert_eq!(wait.max, Some(3));
        assert!(wait.unless_socket);
        assert!(!wait.even_if_not_retained);
    }
}
