//! Ordered delivery of posted messages and their effects on the caches.

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use rivulet_net::Partition;
use rivulet_shared::error::StreamsError;
use rivulet_shared::models::{Message, MessageKind, Participant, ParticipantState};
use rivulet_shared::protocol::{BatchItem, BatchPayload, MessageRange, PushEvent, StreamQuery};
use rivulet_shared::types::{StreamKey, UserId, WaitTarget};

use super::{
    Completion, Core, FetchOptions, Internal, RefreshDone, RefreshOptions, StreamThen, Waiter, Work,
};
use crate::hub::{MessageEvent, RelationEvent};
use crate::stream::{self, SharedStream, StreamDiff};
use crate::waiter::{self, WaitId, WaitOptions, WaitOutcome, WaitPlan};

/// The stream on the other side of a relation message.
fn other_end(message: &Message) -> Option<StreamKey> {
    let instructions = message.instructions();
    let pick = |publisher: &str, name: &str| -> Option<StreamKey> {
        let publisher = instructions.get(publisher)?.as_str()?;
        let name = instructions.get(name)?.as_str()?;
        StreamKey::new(publisher, name).ok()
    };
    pick("fromPublisherId", "fromStreamName").or_else(|| pick("toPublisherId", "toStreamName"))
}

impl Core {
    // -----------------------------------------------------------------------
    // Push channel
    // -----------------------------------------------------------------------

    pub(super) fn handle_push(&mut self, partition: Partition, event: PushEvent) {
        match event {
            PushEvent::Post(message) => {
                debug!(
                    partition = %partition,
                    stream = %message.key(),
                    ordinal = message.ordinal,
                    "Push: post"
                );
                self.work.push_back(Work::Post(message));
            }
            PushEvent::Join(participant) | PushEvent::Leave(participant) => {
                self.apply_participant(&participant);
            }
            PushEvent::Remove(key) => {
                info!(stream = %key, "Stream removed on the server");
                self.caches.forget_all_for(&key);
                self.delivered.remove(&key);
                self.pending_dispatch.remove(&key);
                if let Some(store) = &self.store {
                    if let Err(e) = store.delete_stream(&key) {
                        warn!(stream = %key, error = %e, "Failed to delete stream from disk");
                    }
                }
            }
        }
    }

    /// Record a participant as the server reported it.
    pub(super) fn apply_participant(&mut self, participant: &Participant) {
        let key = participant.key();
        let item = BatchItem::Participant {
            key: key.clone(),
            user_id: participant.user_id.clone(),
        };
        self.caches
            .participants
            .put(item, BatchPayload::Participant(participant.clone()));
        self.caches.invalidate_participants(&key);

        if self.user.as_ref() == Some(&participant.user_id) {
            if let Some(instance) = self.instance(&key) {
                stream::write(&instance).set_participant(participant.clone());
            }
            self.caches.participating.clear();
        }
    }

    // -----------------------------------------------------------------------
    // Posts
    // -----------------------------------------------------------------------

    /// Entry point for every posted message, pushed or fetched. Delivery
    /// waits until the previous ordinal is in.
    pub(super) fn on_post(&mut self, message: Message) {
        let key = message.key();
        let ordinal = message.ordinal;
        let latest = self.latest(&key);
        if ordinal <= latest {
            debug!(stream = %key, ordinal, latest, "Ignoring already processed message");
            return;
        }
        let target = WaitTarget::Ordinal(ordinal - 1);
        self.start_wait(key, target, WaitOptions::default(), Completion::DeliverPost(message));
    }

    pub(super) fn deliver(&mut self, message: Message) {
        let key = message.key();
        let ordinal = message.ordinal;
        if self.delivered.get(&key).is_some_and(|d| *d >= ordinal) {
            debug!(stream = %key, ordinal, "Message already delivered");
            return;
        }

        self.cache_message(message.clone());
        self.delivered.insert(key.clone(), ordinal);

        if let Some(queue) = self.pending_dispatch.get_mut(&key) {
            queue.push(message);
            return;
        }
        match self.instance(&key) {
            Some(stream) => self.dispatch_post(&stream, &message),
            None => {
                debug!(stream = %key, ordinal, "Fetching stream before dispatching message");
                self.pending_dispatch.insert(key.clone(), vec![message]);
                self.get_stream(
                    StreamQuery::plain(key.clone()),
                    FetchOptions::default(),
                    None,
                    Vec::new(),
                    StreamThen::DispatchPosts(key),
                );
            }
        }
    }

    pub(super) fn dispatch_pending(&mut self, key: &StreamKey, stream: &SharedStream) {
        let Some(queue) = self.pending_dispatch.remove(key) else {
            return;
        };
        for message in queue {
            self.dispatch_post(stream, &message);
        }
    }

    /// Apply a delivered message to the caches, then tell the listeners.
    fn dispatch_post(&mut self, stream: &SharedStream, message: &Message) {
        let key = message.key();
        let ordinal = message.ordinal;
        let stream_type = {
            let mut s = stream::write(stream);
            s.set_message_count(ordinal);
            s.stream_type().to_string()
        };
        self.caches.invalidate_for_post(&key);

        let mut diff: Option<StreamDiff> = None;
        let mut closed = false;
        let mut relation = None;

        let kind = message.kind();
        match &kind {
            MessageKind::Join | MessageKind::Leave => {
                let joined = kind == MessageKind::Join;
                let prev_state = message
                    .instruction("prevState")
                    .and_then(|v| v.as_str().map(String::from));
                stream::write(stream).adjust_counts(joined, prev_state.as_deref());
                if let Some(user) = &message.by_user_id {
                    self.note_participation(&key, stream, user, joined);
                }
                self.caches.invalidate_participants(&key);
            }
            MessageKind::Changed | MessageKind::Progress => {
                if let Some(Value::Object(changes)) = message.instruction("changes") {
                    diff = self.apply_stream_changes(stream, &changes);
                }
            }
            MessageKind::Closed => {
                let closed_at = message
                    .inserted_time
                    .clone()
                    .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());
                let mut changes = Map::new();
                changes.insert("closedTime".to_string(), Value::String(closed_at));
                diff = self.apply_stream_changes(stream, &changes);
                closed = true;
            }
            MessageKind::Relation(change) => {
                let other = other_end(message);
                self.caches.invalidate_related(&key);
                if let Some(other) = &other {
                    self.caches.invalidate_related(other);
                }
                relation = Some((*change, other));
            }
            MessageKind::Joined | MessageKind::Left => self.caches.participating.clear(),
            MessageKind::Other(_) => {}
        }

        if diff.is_some() {
            self.mirror_user_stream(&key, stream);
        }
        let fields = stream::read(stream).fields().clone();
        self.persist_stream(&fields);

        // Caches are settled; now the listeners.
        let event = MessageEvent {
            stream: stream.clone(),
            message: message.clone(),
        };
        self.hub.fire_message(&stream_type, &event);
        if let Some(diff) = &diff {
            self.hub.fire_diff(stream, diff);
        }
        if closed {
            self.hub.fire_closed(stream);
        }
        if let Some((change, other)) = relation {
            let event = RelationEvent {
                stream: stream.clone(),
                change,
                message: message.clone(),
                other: other.clone(),
            };
            let axes = (
                Some(key.publisher_id.clone()),
                Some(key.stream_name.clone()),
                Some(change),
            );
            self.hub.relation.dispatch(&axes, &event);
            if let Some(other) = other {
                let options = RefreshOptions {
                    messages: true,
                    ..RefreshOptions::default()
                };
                self.refresh_stream(other, options, RefreshDone::Silent);
            }
        }

        let completed = self.waits.fill(&key, ordinal);
        for id in completed.into_iter().rev() {
            if let Some(completion) = self.waits.complete(id) {
                self.work.push_front(Work::Complete {
                    completion,
                    outcome: Ok(WaitOutcome::Delivered(ordinal)),
                });
            }
        }

        if self.refresh_types.contains(&message.message_type) {
            self.debounce_refresh(key);
        }
    }

    fn apply_stream_changes(
        &mut self,
        stream: &SharedStream,
        changes: &Map<String, Value>,
    ) -> Option<StreamDiff> {
        let applied = stream::write(stream).apply_changes(changes);
        match applied {
            Ok(diff) => Some(diff),
            Err(e) => {
                let key = stream::read(stream).key().clone();
                warn!(stream = %key, error = %e, "Ignoring malformed stream changes");
                None
            }
        }
    }

    fn note_participation(
        &mut self,
        key: &StreamKey,
        stream: &SharedStream,
        user: &UserId,
        joined: bool,
    ) {
        let state = if joined {
            ParticipantState::Participating
        } else {
            ParticipantState::Left
        };

        let item = BatchItem::Participant {
            key: key.clone(),
            user_id: user.clone(),
        };
        if let Some(BatchPayload::Participant(mut participant)) =
            self.caches.participants.peek(&item).cloned()
        {
            participant.state = state;
            self.caches
                .participants
                .put(item, BatchPayload::Participant(participant));
        }

        if self.user.as_ref() == Some(user) {
            let current = stream::read(stream).participant().cloned();
            if let Some(mut participant) = current {
                participant.state = state;
                stream::write(stream).set_participant(participant);
            }
            self.caches.participating.clear();
        }
    }

    /// `Streams/user/*` streams mirror avatar fields.
    fn mirror_user_stream(&mut self, key: &StreamKey, stream: &SharedStream) {
        let name = key.stream_name.as_str();
        if !name.starts_with("Streams/user/") {
            return;
        }
        let Ok(user_id) = UserId::new(key.publisher_id.as_str()) else {
            return;
        };
        let item = BatchItem::Avatar { user_id };
        let content = stream::read(stream).fields().content.clone();
        if let Some(BatchPayload::Avatar(mut avatar)) = self.caches.avatars.peek(&item).cloned() {
            if avatar.apply_user_stream(name, &content) {
                self.caches.avatars.put(item, BatchPayload::Avatar(avatar));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Waits
    // -----------------------------------------------------------------------

    pub(super) fn plan_wait(
        &self,
        key: &StreamKey,
        target: WaitTarget,
        options: &WaitOptions,
    ) -> WaitPlan {
        let latest = self.latest(key);
        let max = options.max.unwrap_or(self.config.wait_max);
        let plan = waiter::plan(
            latest,
            target,
            self.socket_live(key),
            self.participant_will_deliver(key),
            max,
            options,
        );
        debug!(stream = %key, latest, ?target, ?plan, "Wait planned");
        plan
    }

    pub(super) fn start_wait(
        &mut self,
        key: StreamKey,
        target: WaitTarget,
        options: WaitOptions,
        completion: Completion,
    ) {
        match self.plan_wait(&key, target, &options) {
            WaitPlan::NotCached => self.run_completion(completion, Ok(WaitOutcome::NotCached)),
            WaitPlan::AlreadySatisfied => {
                self.run_completion(completion, Ok(WaitOutcome::AlreadySatisfied))
            }
            WaitPlan::Skipped => self.run_completion(completion, Ok(WaitOutcome::Skipped)),
            WaitPlan::Fallback { .. } => {
                let id = self.waits.insert(key, target, 1..=0, completion);
                self.start_fallback(id);
            }
            WaitPlan::Listen { from, to } => {
                let id = self.waits.insert(key, target, from..=to, completion);
                let timeout = options.timeout.unwrap_or(self.config.wait_timeout);
                self.after(
                    timeout,
                    Internal::WaitTimeout {
                        epoch: self.epoch,
                        wait: id,
                    },
                );
            }
        }
    }

    pub(super) fn run_completion(
        &mut self,
        completion: Completion,
        outcome: Result<WaitOutcome, StreamsError>,
    ) {
        match completion {
            Completion::Reply(reply) => {
                let _ = reply.send(outcome);
            }
            Completion::DeliverPost(message) => {
                if outcome.is_ok() {
                    self.deliver(message);
                }
            }
            Completion::Refresh { key, done } => match outcome {
                Ok(_) => self.get_stream(
                    StreamQuery::plain(key),
                    FetchOptions {
                        force: true,
                        ..FetchOptions::default()
                    },
                    None,
                    Vec::new(),
                    StreamThen::Refresh(done),
                ),
                Err(e) => self.finish_refresh(done, Err(e)),
            },
        }
    }

    pub(super) fn on_wait_timeout(&mut self, id: WaitId) {
        if self.waits.completion(id).is_none() {
            return;
        }
        debug!(wait = id, "Listening timed out, fetching instead");
        self.start_fallback(id);
    }

    /// Fetch the messages a wait still needs.
    pub(super) fn start_fallback(&mut self, id: WaitId) {
        let Some((key, target)) = self.waits.target(id) else {
            return;
        };
        let latest = self.latest(&key);
        match target {
            WaitTarget::Ordinal(n) if n <= latest => {
                self.finish_fallback(id);
                return;
            }
            WaitTarget::Latest => self.caches.invalidate_for_post(&key),
            WaitTarget::Ordinal(_) => {}
        }
        let item = BatchItem::Messages {
            key,
            range: MessageRange::between(latest + 1, target.into()),
        };
        self.enqueue(item, Waiter::Fallback(id));
    }

    pub(super) fn on_fallback_result(
        &mut self,
        id: WaitId,
        result: Result<BatchPayload, StreamsError>,
    ) {
        let result = match result {
            Ok(BatchPayload::Messages(messages)) => Ok(messages),
            Ok(_) => Err(StreamsError::Decode("expected a message range".into())),
            Err(e) => Err(e),
        };
        match result {
            Ok(mut messages) => {
                messages.sort_by_key(|m| m.ordinal);
                for message in messages {
                    self.work.push_back(Work::Post(message));
                }
                self.work.push_back(Work::FinishFallback(id));
            }
            Err(e) => {
                let Some((key, target)) = self.waits.target(id) else {
                    return;
                };
                warn!(stream = %key, error = %e, "Fallback message fetch failed");
                self.hub.fire_error(&e, format!("fetching messages for {key}"));

                // A held-back post goes out once its predecessors arrive,
                // by push or by a later fetch.
                if matches!(self.waits.completion(id), Some(Completion::DeliverPost(_))) {
                    self.relisten(id, &key, target);
                    return;
                }
                if let Some(completion) = self.waits.take_completion(id) {
                    self.run_completion(completion, Err(e));
                }
                if !self.waits.is_listening(id) {
                    self.waits.complete(id);
                }
            }
        }
    }

    /// Listen for whatever a wait still lacks and retry the fetch after
    /// the usual timeout.
    fn relisten(&mut self, id: WaitId, key: &StreamKey, target: WaitTarget) {
        let WaitTarget::Ordinal(n) = target else {
            return;
        };
        let latest = self.latest(key);
        if n <= latest {
            self.work.push_back(Work::FinishFallback(id));
            return;
        }
        self.waits.listen(id, latest + 1..=n);
        debug!(
            stream = %key,
            wait = id,
            from = latest + 1,
            to = n,
            "Listening after failed fetch"
        );
        self.after(
            self.config.wait_timeout,
            Internal::WaitTimeout {
                epoch: self.epoch,
                wait: id,
            },
        );
    }

    pub(super) fn finish_fallback(&mut self, id: WaitId) {
        let Some((key, _)) = self.waits.target(id) else {
            return;
        };
        if let Some(completion) = self.waits.complete(id) {
            let through = self.latest(&key);
            self.run_completion(completion, Ok(WaitOutcome::Delivered(through)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relation_message(instructions: &str) -> Message {
        Message {
            publisher_id: rivulet_shared::types::PublisherId::new("u1").unwrap(),
            stream_name: rivulet_shared::types::StreamName::new("Streams/category").unwrap(),
            ordinal: 4,
            message_type: "Streams/relatedTo".into(),
            stream_type: None,
            content: String::new(),
            instructions: instructions.into(),
            by_user_id: None,
            inserted_time: None,
        }
    }

    #[test]
    fn test_other_end_reads_either_side() {
        let from = relation_message(r#"{"fromPublisherId":"u2","fromStreamName":"article/9"}"#);
        assert_eq!(other_end(&from), StreamKey::new("u2", "article/9").ok());

        let to = relation_message(r#"{"toPublisherId":"u3","toStreamName":"cat"}"#);
        assert_eq!(other_end(&to), StreamKey::new("u3", "cat").ok());

        assert_eq!(other_end(&relation_message("{}")), None);
    }
}
