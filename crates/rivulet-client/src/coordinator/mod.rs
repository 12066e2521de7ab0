//! The coordinator task.
//!
//! One [`Core`] owns every cache, index and listener table and runs on a
//! single tokio task. [`crate::handle::StreamsHandle`] talks to it through
//! [`Command`]s; network calls and timers run on spawned tasks and report
//! back as [`Internal`] events tagged with the session epoch.
//!
//! Follow-up work found while handling one input goes onto a FIFO work
//! queue that is drained before the next input is taken.

mod delivery;
mod fetch;
mod mutation;
mod refresh;

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use rivulet_net::{
    CreatedStream, NewMessage, NewStream, Partition, ParticipatingQuery, RelationRequest,
    RemoteApi, RemoteResult, Router,
};
use rivulet_shared::error::StreamsError;
use rivulet_shared::models::{Message, Participant, ParticipantState, StreamFields};
use rivulet_shared::protocol::{
    BatchItem, BatchPayload, BatchSlot, PushEvent, RelatedQuery, RelatedResult, StreamQuery,
};
use rivulet_shared::types::{ConnectionMode, Ordinal, StreamKey, UserId, WaitTarget};
use rivulet_store::Database;

use crate::batcher::Batcher;
use crate::cache::{CachedStream, Caches, Related};
use crate::config::{ParticipantSkip, StreamsConfig};
use crate::dispatcher::HandlerId;
use crate::hub::{Hub, Subscription};
use crate::registry::{Registry, RetainKey};
use crate::stream::{self, SharedStream, Stream};
use crate::waiter::{WaitId, WaitOptions, WaitOutcome, WaitTable};

pub use fetch::FetchOptions;
pub use mutation::Created;
pub use refresh::RefreshOptions;

pub(crate) use fetch::{StreamThen, Waiter};
pub(crate) use refresh::{RefreshDone, RefreshJoin};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, StreamsError>>;

// ---------------------------------------------------------------------------
// Command / event types
// ---------------------------------------------------------------------------

/// Requests sent *into* the coordinator task.
pub(crate) enum Command {
    GetStream {
        query: StreamQuery,
        options: FetchOptions,
        retain: Option<RetainKey>,
        reply: Reply<SharedStream>,
    },
    /// Non-stream lookups (messages, participants, avatars).
    Fetch {
        item: BatchItem,
        force: bool,
        reply: Reply<BatchPayload>,
    },
    Related {
        query: RelatedQuery,
        force: bool,
        retain: Option<RetainKey>,
        reply: Reply<Related>,
    },
    Participating {
        query: ParticipatingQuery,
        force: bool,
        reply: Reply<Vec<Participant>>,
    },
    CachedStream {
        key: StreamKey,
        reply: oneshot::Sender<Option<SharedStream>>,
    },
    Stats(oneshot::Sender<CacheStats>),

    Post {
        key: StreamKey,
        message: NewMessage,
        reply: Reply<Message>,
    },
    Participate {
        key: StreamKey,
        join: bool,
        reply: Reply<Participant>,
    },
    Save {
        key: StreamKey,
        reply: Reply<SharedStream>,
    },
    Close {
        key: StreamKey,
        reply: Reply<SharedStream>,
    },
    Reopen {
        key: StreamKey,
        reply: Reply<SharedStream>,
    },
    Create {
        stream: NewStream,
        retain: Option<RetainKey>,
        reply: Reply<Created>,
    },
    Relate {
        request: RelationRequest,
        add: bool,
        reply: Reply<()>,
    },
    UpdateRelation {
        request: RelationRequest,
        adjust_weights: bool,
        reply: Reply<()>,
    },

    Retain {
        key: StreamKey,
        retain: RetainKey,
    },
    ReleaseStream(StreamKey),
    Release(RetainKey),
    ReleaseAll,
    RetainedStreams(oneshot::Sender<Vec<StreamKey>>),

    Refresh {
        options: RefreshOptions,
        reply: Reply<bool>,
    },
    RefreshStream {
        key: StreamKey,
        options: RefreshOptions,
        reply: Reply<bool>,
    },
    ShouldRefresh {
        message_type: String,
        enabled: bool,
    },
    WaitForMessage {
        key: StreamKey,
        target: WaitTarget,
        options: WaitOptions,
        reply: Reply<WaitOutcome>,
    },

    Subscribe {
        subscription: Subscription,
        reply: oneshot::Sender<HandlerId>,
    },
    Unsubscribe {
        id: HandlerId,
        reply: oneshot::Sender<bool>,
    },

    Login {
        user: UserId,
        reply: oneshot::Sender<()>,
    },
    Logout(oneshot::Sender<()>),
    Reset(oneshot::Sender<()>),
    SetConnection(ConnectionMode),
    SocketConnected(Partition),
    SocketDisconnected(Partition),
    Push {
        partition: Partition,
        event: PushEvent,
    },
    Shutdown,
}

/// Completions reported back by tasks the core spawned.
pub(crate) enum Internal {
    FlushDue {
        partition: Partition,
        generation: u64,
    },
    BatchDone {
        epoch: u64,
        items: Vec<BatchItem>,
        result: RemoteResult<Vec<BatchSlot>>,
    },
    RelatedDone {
        epoch: u64,
        query: RelatedQuery,
        result: RemoteResult<RelatedResult>,
    },
    ParticipatingDone {
        epoch: u64,
        query: ParticipatingQuery,
        result: RemoteResult<Vec<Participant>>,
        reply: Reply<Vec<Participant>>,
    },
    Posted {
        epoch: u64,
        result: RemoteResult<Message>,
        reply: Reply<Message>,
    },
    Participated {
        epoch: u64,
        result: RemoteResult<Participant>,
        reply: Reply<Participant>,
    },
    StreamSaved {
        epoch: u64,
        key: StreamKey,
        saved: bool,
        result: RemoteResult<StreamFields>,
        reply: Reply<SharedStream>,
    },
    StreamCreated {
        epoch: u64,
        request: NewStream,
        retain: Option<RetainKey>,
        result: RemoteResult<CreatedStream>,
        reply: Reply<Created>,
    },
    RelationDone {
        epoch: u64,
        request: RelationRequest,
        result: RemoteResult<()>,
        reply: Reply<()>,
    },
    RelationUpdated {
        epoch: u64,
        request: RelationRequest,
        result: RemoteResult<Option<Message>>,
        reply: Reply<()>,
    },
    WaitTimeout {
        epoch: u64,
        wait: WaitId,
    },
    Debounced {
        epoch: u64,
        key: StreamKey,
        generation: u64,
    },
}

/// Follow-up work, processed in order before the next input.
pub(crate) enum Work {
    Post(Message),
    FinishFallback(WaitId),
    Complete {
        completion: Completion,
        outcome: Result<WaitOutcome, StreamsError>,
    },
}

/// What happens when a wait resolves.
pub(crate) enum Completion {
    Reply(Reply<WaitOutcome>),
    /// Deliver this message once its predecessors are in.
    DeliverPost(Message),
    /// A refresh that fetched the latest messages first.
    Refresh { key: StreamKey, done: RefreshDone },
}

/// Sizes of the coordinator tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub streams: usize,
    pub messages: usize,
    pub participants: usize,
    pub avatars: usize,
    pub related: usize,
    pub participating: usize,
    pub retained: usize,
    pub waits: usize,
}

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

pub(crate) struct Core {
    config: StreamsConfig,
    router: Router,
    remote: Arc<dyn RemoteApi>,
    store: Option<Database>,
    internal_tx: mpsc::UnboundedSender<Internal>,

    /// Bumped by every reset; stale completions never touch the caches.
    epoch: u64,
    user: Option<UserId>,
    online: bool,
    live: HashSet<Partition>,

    caches: Caches,
    registry: Registry,
    hub: Hub,
    batcher: Batcher<Waiter>,
    waits: WaitTable<Completion>,

    /// Highest ordinal delivered per stream.
    delivered: HashMap<StreamKey, Ordinal>,
    /// Messages held back until their stream has been fetched.
    pending_dispatch: HashMap<StreamKey, Vec<Message>>,
    related_inflight: HashMap<(u64, RelatedQuery), Vec<(Reply<Related>, Option<RetainKey>)>>,

    joins: HashMap<u64, RefreshJoin>,
    next_join: u64,
    refresh_types: HashSet<String>,
    debounce: HashMap<StreamKey, u64>,
    debounce_generation: u64,
    last_refresh: Option<Instant>,
    last_tick: Instant,

    work: VecDeque<Work>,
}

impl Core {
    pub(crate) fn new(
        config: StreamsConfig,
        remote: Arc<dyn RemoteApi>,
        store: Option<Database>,
        internal_tx: mpsc::UnboundedSender<Internal>,
    ) -> Self {
        let mut core = Self {
            router: config.router(),
            caches: Caches::new(&config.capacities),
            batcher: Batcher::new(config.batch_max),
            config,
            remote,
            store,
            internal_tx,
            epoch: 0,
            user: None,
            online: true,
            live: HashSet::new(),
            registry: Registry::new(),
            hub: Hub::new(),
            waits: WaitTable::new(),
            delivered: HashMap::new(),
            pending_dispatch: HashMap::new(),
            related_inflight: HashMap::new(),
            joins: HashMap::new(),
            next_join: 0,
            refresh_types: HashSet::new(),
            debounce: HashMap::new(),
            debounce_generation: 0,
            last_refresh: None,
            last_tick: Instant::now(),
            work: VecDeque::new(),
        };
        core.warm_from_store();
        core
    }

    fn warm_from_store(&mut self) {
        let Some(store) = &self.store else {
            return;
        };
        match store.recent_streams(self.config.capacities.streams) {
            Ok(stored) => {
                let count = stored.len();
                for entry in stored {
                    let query = StreamQuery::plain(entry.fields.key());
                    self.caches
                        .streams
                        .put(query, CachedStream::Found(Stream::shared(entry.fields)));
                }
                info!(count, "Warmed stream cache from disk");
            }
            Err(e) => warn!(error = %e, "Failed to read stream cache from disk"),
        }
    }

    /// Run until every handle is dropped or `Shutdown` arrives.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(base_url = %self.config.base_url, "Streams coordinator started");

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::Shutdown) => {
                            info!("Streams coordinator shutting down");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            info!("All handles dropped, streams coordinator exiting");
                            break;
                        }
                    }
                }
                Some(event) = internal.recv() => self.handle_internal(event),
                now = ticker.tick() => self.on_tick(now),
            }
            self.drain_work();
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::GetStream {
                query,
                options,
                retain,
                reply,
            } => self.get_stream(query, options, retain, Vec::new(), StreamThen::Reply(reply)),
            Command::Fetch { item, force, reply } => self.fetch_payload(item, force, reply),
            Command::Related {
                query,
                force,
                retain,
                reply,
            } => self.related(query, force, retain, reply),
            Command::Participating {
                query,
                force,
                reply,
            } => self.participating(query, force, reply),
            Command::CachedStream { key, reply } => {
                let _ = reply.send(self.instance(&key));
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }

            Command::Post {
                key,
                message,
                reply,
            } => self.post_message(key, message, reply),
            Command::Participate { key, join, reply } => self.participate(key, join, reply),
            Command::Save { key, reply } => self.save(key, reply),
            Command::Close { key, reply } => self.close(key, reply),
            Command::Reopen { key, reply } => self.reopen(key, reply),
            Command::Create {
                stream,
                retain,
                reply,
            } => self.create(stream, retain, reply),
            Command::Relate {
                request,
                add,
                reply,
            } => self.relate(request, add, reply),
            Command::UpdateRelation {
                request,
                adjust_weights,
                reply,
            } => self.update_relation(request, adjust_weights, reply),

            Command::Retain { key, retain } => {
                let instance = self.instance(&key);
                debug!(stream = %key, retain = %retain, "Retaining stream");
                self.registry.retain(key, retain, instance);
            }
            Command::ReleaseStream(key) => self.registry.release_stream(&key),
            Command::Release(key) => self.registry.release(&key),
            Command::ReleaseAll => self.registry.release_all(),
            Command::RetainedStreams(reply) => {
                let _ = reply.send(self.registry.retained_streams());
            }

            Command::Refresh { options, reply } => self.refresh_all(options, Some(reply)),
            Command::RefreshStream {
                key,
                options,
                reply,
            } => self.refresh_stream(key, options, RefreshDone::Caller(reply)),
            Command::ShouldRefresh {
                message_type,
                enabled,
            } => {
                if enabled {
                    self.refresh_types.insert(message_type);
                } else {
                    self.refresh_types.remove(&message_type);
                }
            }
            Command::WaitForMessage {
                key,
                target,
                options,
                reply,
            } => self.start_wait(key, target, options, Completion::Reply(reply)),

            Command::Subscribe {
                subscription,
                reply,
            } => {
                let _ = reply.send(self.hub.subscribe(subscription));
            }
            Command::Unsubscribe { id, reply } => {
                let _ = reply.send(self.hub.unsubscribe(id));
            }

            Command::Login { user, reply } => {
                if self.user.as_ref() != Some(&user) {
                    info!(user = %user, "User changed, clearing streams state");
                    self.reset();
                }
                self.user = Some(user);
                let _ = reply.send(());
            }
            Command::Logout(reply) => {
                info!("Logged out, clearing streams state");
                self.reset();
                self.user = None;
                self.live.clear();
                let _ = reply.send(());
            }
            Command::Reset(reply) => {
                self.reset();
                let _ = reply.send(());
            }
            Command::SetConnection(mode) => self.set_connection(mode),
            Command::SocketConnected(partition) => {
                debug!(partition = %partition, "Push channel live");
                self.live.insert(partition);
            }
            Command::SocketDisconnected(partition) => {
                debug!(partition = %partition, "Push channel down");
                self.live.remove(&partition);
            }
            Command::Push { partition, event } => self.handle_push(partition, event),
            Command::Shutdown => {}
        }
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::FlushDue {
                partition,
                generation,
            } => {
                if let Some(items) = self.batcher.flush_due(&partition, generation) {
                    self.send_batch(partition, items);
                }
            }
            Internal::BatchDone {
                epoch,
                items,
                result,
            } => self.on_batch_done(epoch, items, result),
            Internal::RelatedDone {
                epoch,
                query,
                result,
            } => self.on_related_done(epoch, query, result),
            Internal::ParticipatingDone {
                epoch,
                query,
                result,
                reply,
            } => {
                if epoch == self.epoch {
                    if let Ok(list) = &result {
                        self.caches.participating.put(query, list.clone());
                    }
                }
                let _ = reply.send(result);
            }
            Internal::Posted {
                epoch,
                result,
                reply,
            } => self.on_posted(epoch, result, reply),
            Internal::Participated {
                epoch,
                result,
                reply,
            } => {
                if epoch == self.epoch {
                    if let Ok(participant) = &result {
                        self.apply_participant(participant);
                    }
                }
                let _ = reply.send(result);
            }
            Internal::StreamSaved {
                epoch,
                key,
                saved,
                result,
                reply,
            } => self.on_stream_saved(epoch, key, saved, result, reply),
            Internal::StreamCreated {
                epoch,
                request,
                retain,
                result,
                reply,
            } => self.on_stream_created(epoch, request, retain, result, reply),
            Internal::RelationUpdated {
                epoch,
                request,
                result,
                reply,
            } => self.on_relation_updated(epoch, request, result, reply),
            Internal::RelationDone {
                epoch,
                request,
                result,
                reply,
            } => {
                if epoch == self.epoch && result.is_ok() {
                    self.caches.invalidate_related(&request.to);
                    self.caches.invalidate_related(&request.from);
                }
                let _ = reply.send(result);
            }
            Internal::WaitTimeout { epoch, wait } => {
                if epoch == self.epoch {
                    self.on_wait_timeout(wait);
                }
            }
            Internal::Debounced {
                epoch,
                key,
                generation,
            } => {
                if epoch == self.epoch {
                    self.on_debounced(key, generation);
                }
            }
        }
    }

    fn drain_work(&mut self) {
        while let Some(work) = self.work.pop_front() {
            match work {
                Work::Post(message) => self.on_post(message),
                Work::FinishFallback(id) => self.finish_fallback(id),
                Work::Complete {
                    completion,
                    outcome,
                } => self.run_completion(completion, outcome),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Session
    // -----------------------------------------------------------------------

    /// Forget everything cached or retained. Outstanding callers still get
    /// an answer; results of requests sent before the reset are not cached,
    /// and later lookups never join them.
    fn reset(&mut self) {
        for (partition, items) in self.batcher.drain() {
            self.send_batch(partition, items);
        }
        self.epoch += 1;
        debug!(epoch = self.epoch, "Streams state reset");

        self.caches.clear();
        self.registry.clear();
        self.delivered.clear();
        self.pending_dispatch.clear();
        self.debounce.clear();
        self.last_refresh = None;

        for (_, join) in self.joins.drain() {
            if let Some(reply) = join.reply {
                let _ = reply.send(Ok(false));
            }
        }
        for completion in self.waits.drain() {
            match completion {
                Completion::Reply(reply) => {
                    let _ = reply.send(Ok(WaitOutcome::NotCached));
                }
                Completion::DeliverPost(_) => {}
                Completion::Refresh { done, .. } => self.finish_refresh(done, Ok(false)),
            }
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.clear() {
                warn!(error = %e, "Failed to clear on-disk stream cache");
            }
        }
    }

    fn set_connection(&mut self, mode: ConnectionMode) {
        let was_online = self.online;
        self.online = mode == ConnectionMode::Online;
        info!(?mode, "Connection mode changed");
        if self.online && !was_online {
            self.refresh_all(RefreshOptions::default(), None);
        }
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            streams: self.caches.streams.len(),
            messages: self.caches.messages.len(),
            participants: self.caches.participants.len(),
            avatars: self.caches.avatars.len(),
            related: self.caches.related.len(),
            participating: self.caches.participating.len(),
            retained: self.registry.retained_streams().len(),
            waits: self.waits.len(),
        }
    }

    // -----------------------------------------------------------------------
    // Shared helpers
    // -----------------------------------------------------------------------

    /// The live instance for a stream, from the caches or the registry.
    fn instance(&self, key: &StreamKey) -> Option<SharedStream> {
        self.caches
            .stream_instance(key)
            .or_else(|| self.registry.instance(key))
    }

    /// Highest ordinal known for a stream: its message count or what has
    /// been delivered, whichever is newer.
    fn latest(&self, key: &StreamKey) -> Ordinal {
        let count = self
            .instance(key)
            .as_ref()
            .map(|s| stream::read(s).message_count())
            .unwrap_or(0);
        count.max(self.delivered.get(key).copied().unwrap_or(0))
    }

    fn socket_live(&self, key: &StreamKey) -> bool {
        self.live
            .contains(&self.router.for_publisher(&key.publisher_id))
    }

    fn participant_will_deliver(&self, key: &StreamKey) -> bool {
        match self.config.participant_skip {
            ParticipantSkip::Never => false,
            ParticipantSkip::WhenParticipating => {
                self.instance(key).as_ref().is_some_and(|s| {
                    stream::read(s)
                        .participant()
                        .is_some_and(|p| p.state == ParticipantState::Participating)
                })
            }
        }
    }

    fn persist_stream(&self, fields: &StreamFields) {
        if let Some(store) = &self.store {
            if let Err(e) = store.upsert_stream(fields) {
                warn!(stream = %fields.key(), error = %e, "Failed to persist stream");
            }
        }
    }

    fn persist_message(&self, message: &Message) {
        if let Some(store) = &self.store {
            if let Err(e) = store.insert_message(message) {
                warn!(
                    stream = %message.key(),
                    ordinal = message.ordinal,
                    error = %e,
                    "Failed to persist message"
                );
            }
        }
    }

    /// Run a network call on its own task and feed the result back in.
    fn spawn_call<F>(&self, call: F)
    where
        F: Future<Output = Internal> + Send + 'static,
    {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(call.await);
        });
    }

    fn after(&self, delay: Duration, event: Internal) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
    }
}
