//! Cached, coalesced and batched lookups.

use tracing::{debug, warn};

use rivulet_net::{ParticipatingQuery, Partition, RemoteResult};
use rivulet_shared::error::StreamsError;
use rivulet_shared::models::{Message, Participant, StreamFields};
use rivulet_shared::protocol::{
    BatchItem, BatchPayload, BatchSlot, RelatedQuery, RelatedResult, StreamBundle, StreamQuery,
};
use rivulet_shared::types::StreamKey;

use super::{Core, Internal, RefreshDone, Reply};
use crate::batcher::Enqueued;
use crate::cache::{CachedStream, Related};
use crate::registry::RetainKey;
use crate::stream::{self, SharedStream, Stream, StreamDiff};
use crate::waiter::WaitId;

/// Options for a stream lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Skip the cache and replace whatever it holds.
    pub force: bool,
    /// Remember a not-found answer so the next lookup doesn't go out.
    pub cache_if_missing: bool,
    /// Refetch when any of these fields is null in the cached copy.
    pub refetch_if_missing: Vec<String>,
}

/// Someone waiting on a batched lookup.
pub(crate) enum Waiter {
    Stream {
        then: StreamThen,
        retain: Option<RetainKey>,
        cache_if_missing: bool,
        /// Fields that report a change even when equal.
        changed: Vec<String>,
    },
    Payload(Reply<BatchPayload>),
    /// A message wait fetching what it could not listen for.
    Fallback(WaitId),
}

pub(crate) enum StreamThen {
    Reply(Reply<SharedStream>),
    Refresh(RefreshDone),
    /// Dispatch the messages held back for this stream.
    DispatchPosts(StreamKey),
}

fn needs_refetch(stream: &SharedStream, fields: &[String]) -> bool {
    if fields.is_empty() {
        return false;
    }
    let map = stream::read(stream).fields().field_map();
    fields
        .iter()
        .any(|name| map.get(name).map_or(true, |v| v.is_null()))
}

fn slot_result(slot: BatchSlot) -> Result<BatchPayload, StreamsError> {
    match slot {
        BatchSlot::Ok(payload) => Ok(payload),
        BatchSlot::NotFound(what) => Err(StreamsError::NotFound(what)),
        BatchSlot::Error(message) => Err(StreamsError::Remote(message)),
    }
}

impl Core {
    // -----------------------------------------------------------------------
    // Streams
    // -----------------------------------------------------------------------

    pub(super) fn get_stream(
        &mut self,
        query: StreamQuery,
        options: FetchOptions,
        retain: Option<RetainKey>,
        changed: Vec<String>,
        then: StreamThen,
    ) {
        if !options.force {
            match self.caches.streams.get(&query).cloned() {
                Some(CachedStream::Found(stream))
                    if !needs_refetch(&stream, &options.refetch_if_missing) =>
                {
                    debug!(stream = %query.key, "Stream cache hit");
                    if let Some(retain) = retain {
                        self.registry
                            .retain(query.key.clone(), retain, Some(stream.clone()));
                    }
                    self.finish_stream(then, Ok(stream));
                    return;
                }
                Some(CachedStream::Missing) => {
                    debug!(stream = %query.key, "Stream cached as missing");
                    if retain.is_some() {
                        self.registry.remember_missing(query.key.clone());
                    }
                    let error = StreamsError::NotFound(query.key.to_string());
                    self.finish_stream(then, Err(error));
                    return;
                }
                _ => {}
            }
        }

        let waiter = Waiter::Stream {
            then,
            retain,
            cache_if_missing: options.cache_if_missing,
            changed,
        };
        self.enqueue(BatchItem::Stream(query), waiter);
    }

    pub(super) fn finish_stream(
        &mut self,
        then: StreamThen,
        result: Result<SharedStream, StreamsError>,
    ) {
        match then {
            StreamThen::Reply(reply) => {
                let _ = reply.send(result);
            }
            StreamThen::Refresh(done) => self.finish_refresh(done, result.map(|_| true)),
            StreamThen::DispatchPosts(key) => match result {
                Ok(stream) => self.dispatch_pending(&key, &stream),
                Err(e) => {
                    let dropped = self.pending_dispatch.remove(&key).map_or(0, |q| q.len());
                    warn!(
                        stream = %key,
                        dropped,
                        error = %e,
                        "Could not fetch stream for pending messages"
                    );
                    self.hub.fire_error(&e, format!("fetching {key} for delivery"));
                }
            },
        }
    }

    /// Construct or update the instance for a fetched stream and cache
    /// everything that came with it. Listeners run after the caches are
    /// updated.
    pub(super) fn adopt_stream(
        &mut self,
        query: &StreamQuery,
        bundle: StreamBundle,
        changed: &[String],
    ) -> SharedStream {
        let StreamBundle {
            stream: fields,
            messages,
            participants,
        } = bundle;
        self.persist_stream(&fields);

        let (stream, diff, created) = match self.instance(&query.key) {
            Some(existing) => {
                let diff = stream::write(&existing).update(fields, changed);
                (existing, diff, false)
            }
            None => (Stream::shared(fields), StreamDiff::default(), true),
        };

        self.caches
            .streams
            .put(query.clone(), CachedStream::Found(stream.clone()));
        for message in messages {
            self.cache_message(message);
        }
        for participant in participants {
            self.cache_participant(participant);
        }

        if created {
            self.hub.fire_construct(&stream);
        } else {
            self.hub.fire_diff(&stream, &diff);
        }
        self.hub.fire_refresh(&stream);
        stream
    }

    fn adopt_or_detach(&mut self, fields: StreamFields, current: bool) -> SharedStream {
        if !current {
            return Stream::shared(fields);
        }
        let query = StreamQuery::plain(fields.key());
        let bundle = StreamBundle {
            stream: fields,
            messages: Vec::new(),
            participants: Vec::new(),
        };
        self.adopt_stream(&query, bundle, &[])
    }

    pub(super) fn cache_message(&mut self, message: Message) {
        self.persist_message(&message);
        let item = BatchItem::Message {
            key: message.key(),
            ordinal: message.ordinal,
        };
        self.caches.messages.put(item, BatchPayload::Message(message));
    }

    fn cache_participant(&mut self, participant: Participant) {
        let item = BatchItem::Participant {
            key: participant.key(),
            user_id: participant.user_id.clone(),
        };
        self.caches
            .participants
            .put(item, BatchPayload::Participant(participant));
    }

    fn resolve_stream(
        &mut self,
        query: StreamQuery,
        result: Result<BatchPayload, StreamsError>,
        waiters: Vec<Waiter>,
        current: bool,
    ) {
        let result = match result {
            Ok(BatchPayload::Stream(bundle)) => Ok(bundle),
            Ok(_) => Err(StreamsError::Decode(format!(
                "expected a stream for {}",
                query.key
            ))),
            Err(e) => Err(e),
        };

        match result {
            Ok(bundle) => {
                let changed: Vec<String> = waiters
                    .iter()
                    .flat_map(|w| match w {
                        Waiter::Stream { changed, .. } => changed.clone(),
                        _ => Vec::new(),
                    })
                    .collect();
                let stream = if current {
                    self.adopt_stream(&query, bundle, &changed)
                } else {
                    Stream::shared(bundle.stream)
                };

                for waiter in waiters {
                    match waiter {
                        Waiter::Stream { then, retain, .. } => {
                            if let (true, Some(retain)) = (current, retain) {
                                self.registry
                                    .retain(query.key.clone(), retain, Some(stream.clone()));
                            }
                            self.finish_stream(then, Ok(stream.clone()));
                        }
                        Waiter::Payload(reply) => {
                            let error =
                                StreamsError::Decode("stream lookups return streams".into());
                            let _ = reply.send(Err(error));
                        }
                        Waiter::Fallback(_) => {}
                    }
                }
            }
            Err(e) => {
                debug!(stream = %query.key, error = %e, "Stream lookup failed");
                if current {
                    let keep_missing = e.is_not_found()
                        && waiters.iter().any(|w| {
                            matches!(
                                w,
                                Waiter::Stream {
                                    cache_if_missing: true,
                                    ..
                                }
                            )
                        });
                    if keep_missing {
                        self.caches
                            .streams
                            .put(query.clone(), CachedStream::Missing);
                    } else {
                        self.caches.streams.pop(&query);
                    }
                }

                for waiter in waiters {
                    match waiter {
                        Waiter::Stream { then, retain, .. } => {
                            if current && retain.is_some() {
                                self.registry.remember_missing(query.key.clone());
                            }
                            self.finish_stream(then, Err(e.clone()));
                        }
                        Waiter::Payload(reply) => {
                            let _ = reply.send(Err(e.clone()));
                        }
                        Waiter::Fallback(_) => {}
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Messages, participants, avatars
    // -----------------------------------------------------------------------

    pub(super) fn fetch_payload(
        &mut self,
        item: BatchItem,
        force: bool,
        reply: Reply<BatchPayload>,
    ) {
        if !force {
            let hit = self
                .caches
                .table(&item)
                .and_then(|table| table.get(&item).cloned());
            if let Some(payload) = hit {
                debug!(?item, "Cache hit");
                let _ = reply.send(Ok(payload));
                return;
            }
        }
        self.enqueue(item, Waiter::Payload(reply));
    }

    fn resolve_payload(
        &mut self,
        item: BatchItem,
        result: Result<BatchPayload, StreamsError>,
        waiters: Vec<Waiter>,
        current: bool,
    ) {
        if current {
            match &result {
                Ok(payload) => {
                    match payload {
                        BatchPayload::Message(m) => self.persist_message(m),
                        BatchPayload::Messages(list) => {
                            for m in list {
                                self.persist_message(m);
                            }
                        }
                        _ => {}
                    }
                    if let Some(table) = self.caches.table(&item) {
                        table.put(item.clone(), payload.clone());
                    }
                }
                Err(_) => {
                    if let Some(table) = self.caches.table(&item) {
                        table.pop(&item);
                    }
                }
            }
        }

        for waiter in waiters {
            match waiter {
                Waiter::Payload(reply) => {
                    let _ = reply.send(result.clone());
                }
                Waiter::Fallback(id) => self.on_fallback_result(id, result.clone()),
                Waiter::Stream { then, .. } => {
                    let error = StreamsError::Decode(format!("{item:?} is not a stream lookup"));
                    self.finish_stream(then, Err(error));
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Batching
    // -----------------------------------------------------------------------

    pub(super) fn enqueue(&mut self, item: BatchItem, waiter: Waiter) {
        let partition = self.router.for_item(&item);
        match self.batcher.enqueue(self.epoch, partition.clone(), item, waiter) {
            Enqueued::Attached => debug!(partition = %partition, "Joined in-flight lookup"),
            Enqueued::Queued => {}
            Enqueued::Scheduled { generation } => self.after(
                self.config.batch_window,
                Internal::FlushDue {
                    partition,
                    generation,
                },
            ),
            Enqueued::Flush(items) => self.send_batch(partition, items),
        }
    }

    pub(super) fn send_batch(&mut self, partition: Partition, items: Vec<BatchItem>) {
        self.send_batch_in(self.epoch, partition, items);
    }

    /// Send a batch whose waiters belong to `epoch`.
    pub(super) fn send_batch_in(
        &mut self,
        epoch: u64,
        partition: Partition,
        items: Vec<BatchItem>,
    ) {
        debug!(partition = %partition, items = items.len(), epoch, "Sending batch");
        let remote = self.remote.clone();
        self.spawn_call(async move {
            let result = remote.batch(&partition, items.clone()).await;
            Internal::BatchDone {
                epoch,
                items,
                result,
            }
        });
    }

    pub(super) fn on_batch_done(
        &mut self,
        epoch: u64,
        items: Vec<BatchItem>,
        result: RemoteResult<Vec<BatchSlot>>,
    ) {
        let result = match result {
            Ok(slots) if slots.len() != items.len() => Err(StreamsError::Decode(format!(
                "batch of {} answered with {} slots",
                items.len(),
                slots.len()
            ))),
            other => other,
        };

        match result {
            Ok(slots) => {
                for (item, slot) in items.into_iter().zip(slots) {
                    self.complete_item(epoch, item, slot_result(slot));
                }
            }
            Err(e) => {
                warn!(items = items.len(), error = %e, "Batch request failed");
                self.hub.fire_error(&e, "batch request");
                for item in items {
                    self.complete_item(epoch, item, Err(e.clone()));
                }
            }
        }
    }

    fn complete_item(
        &mut self,
        epoch: u64,
        item: BatchItem,
        result: Result<BatchPayload, StreamsError>,
    ) {
        let waiters = self.batcher.complete(epoch, item.clone());
        let current = epoch == self.epoch;
        match item {
            BatchItem::Stream(query) => self.resolve_stream(query, result, waiters, current),
            other => self.resolve_payload(other, result, waiters, current),
        }
    }

    // -----------------------------------------------------------------------
    // Related streams and participating
    // -----------------------------------------------------------------------

    pub(super) fn related(
        &mut self,
        query: RelatedQuery,
        force: bool,
        retain: Option<RetainKey>,
        reply: Reply<Related>,
    ) {
        if !force {
            if let Some(hit) = self.caches.related.get(&query).cloned() {
                debug!(stream = %query.key, "Related cache hit");
                if let Some(retain) = retain {
                    self.retain_related(&hit, retain);
                }
                let _ = reply.send(Ok(hit));
                return;
            }
        }

        let epoch = self.epoch;
        let waiters = self
            .related_inflight
            .entry((epoch, query.clone()))
            .or_default();
        waiters.push((reply, retain));
        if waiters.len() > 1 {
            return;
        }

        let partition = self.router.for_publisher(&query.key.publisher_id);
        let remote = self.remote.clone();
        self.spawn_call(async move {
            let result = remote.related(&partition, &query).await;
            Internal::RelatedDone {
                epoch,
                query,
                result,
            }
        });
    }

    pub(super) fn on_related_done(
        &mut self,
        epoch: u64,
        query: RelatedQuery,
        result: RemoteResult<RelatedResult>,
    ) {
        let waiters = self
            .related_inflight
            .remove(&(epoch, query.clone()))
            .unwrap_or_default();
        let current = epoch == self.epoch;

        let result = result.map(|r| {
            let stream = self.adopt_or_detach(r.stream, current);
            let streams = r
                .related_streams
                .into_iter()
                .map(|fields| self.adopt_or_detach(fields, current))
                .collect();
            Related {
                stream,
                relations: r.relations,
                streams,
            }
        });

        match &result {
            Ok(related) if current => {
                self.caches.related.put(query.clone(), related.clone());
            }
            Ok(_) => {}
            Err(e) => {
                warn!(stream = %query.key, error = %e, "Related lookup failed");
                if current {
                    self.caches.related.pop(&query);
                }
            }
        }

        for (reply, retain) in waiters {
            if let (true, Some(retain), Ok(related)) = (current, retain, &result) {
                self.retain_related(related, retain);
            }
            let _ = reply.send(result.clone());
        }
    }

    fn retain_related(&mut self, related: &Related, retain: RetainKey) {
        for stream in std::iter::once(&related.stream).chain(related.streams.iter()) {
            let key = stream::read(stream).key().clone();
            self.registry.retain(key, retain.clone(), Some(stream.clone()));
        }
    }

    pub(super) fn participating(
        &mut self,
        query: ParticipatingQuery,
        force: bool,
        reply: Reply<Vec<Participant>>,
    ) {
        let Some(user) = self.user.clone() else {
            let _ = reply.send(Err(StreamsError::NotLoggedIn));
            return;
        };
        if !force {
            if let Some(hit) = self.caches.participating.get(&query).cloned() {
                let _ = reply.send(Ok(hit));
                return;
            }
        }

        let partition = self.router.for_user(&user);
        let remote = self.remote.clone();
        let epoch = self.epoch;
        self.spawn_call(async move {
            let result = remote.participating(&partition, &user, &query).await;
            Internal::ParticipatingDone {
                epoch,
                query,
                result,
                reply,
            }
        });
    }
}
