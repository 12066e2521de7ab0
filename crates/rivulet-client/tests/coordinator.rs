//! End-to-end behaviour of the coordinator against an in-memory remote.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use rivulet_client::{
    spawn_streams, ErrorEvent, FieldChangedEvent, MessageEvent, RefreshOptions, RelationEvent,
    StreamEvent, StreamsConfig, StreamsHandle, Subscription, WaitOptions, WaitOutcome,
};
use rivulet_net::{
    CreatedStream, NewMessage, NewStream, ParticipatingQuery, Partition, PushSink,
    RelateOnCreate, RelationRequest, RemoteApi, RemoteResult,
};
use rivulet_shared::error::StreamsError;
use rivulet_shared::models::{
    Avatar, Message, Participant, ParticipantState, Relation, RelationChange, StreamFields,
};
use rivulet_shared::protocol::{
    BatchItem, BatchPayload, BatchSlot, ParticipantCriteria, PushEvent, RelatedQuery,
    RelatedResult, StreamBundle,
};
use rivulet_shared::types::{RangeEnd, StreamKey, UserId, WaitTarget};

// ---------------------------------------------------------------------------
// In-memory remote
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockRemote {
    streams: Mutex<HashMap<StreamKey, StreamFields>>,
    messages: Mutex<HashMap<StreamKey, Vec<Message>>>,
    participants: Mutex<HashMap<StreamKey, Vec<Participant>>>,
    /// Category to the streams related to it.
    relations: Mutex<HashMap<StreamKey, Vec<StreamKey>>>,
    batch_calls: AtomicUsize,
    related_calls: AtomicUsize,
    batches: Mutex<Vec<Vec<BatchItem>>>,
    /// How long every batch call takes.
    batch_delay: Mutex<Option<Duration>>,
    /// Message range lookups answer with a per-item error.
    fail_ranges: AtomicBool,
}

impl MockRemote {
    fn with_stream(key: &StreamKey, message_count: u64) -> Arc<Self> {
        let remote = Self::default();
        remote.add_stream(key, message_count);
        Arc::new(remote)
    }

    fn add_stream(&self, key: &StreamKey, message_count: u64) {
        self.streams
            .lock()
            .unwrap()
            .insert(key.clone(), fields(key, message_count));
        let history = (1..=message_count).map(|n| message(key, n)).collect();
        self.messages.lock().unwrap().insert(key.clone(), history);
    }

    /// Server-side message that has not been pushed yet.
    fn add_message(&self, message: Message) {
        let key = message.key();
        if let Some(fields) = self.streams.lock().unwrap().get_mut(&key) {
            fields.message_count = fields.message_count.max(message.ordinal);
        }
        self.messages
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .push(message);
    }

    fn relate(&self, category: &StreamKey, member: &StreamKey) {
        self.relations
            .lock()
            .unwrap()
            .entry(category.clone())
            .or_default()
            .push(member.clone());
    }

    /// Post a relation notice to `category` naming `member` as the other end.
    fn relation_notice(&self, category: &StreamKey, member: &StreamKey, kind: &str) -> Message {
        let ordinal = self.streams.lock().unwrap()[category].message_count + 1;
        let mut notice = message(category, ordinal);
        notice.message_type = kind.into();
        notice.stream_type = Some("Streams/category".into());
        notice.instructions = json!({
            "fromPublisherId": member.publisher_id.as_str(),
            "fromStreamName": member.stream_name.as_str(),
        })
        .to_string();
        self.add_message(notice.clone());
        notice
    }

    fn calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    fn related_calls(&self) -> usize {
        self.related_calls.load(Ordering::SeqCst)
    }

    /// Number of batches that asked about `key`.
    fn batches_for(&self, key: &StreamKey) -> usize {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .filter(|batch| batch.iter().any(|item| item.stream_key() == Some(key)))
            .count()
    }

    fn last_batch(&self) -> Vec<BatchItem> {
        self.batches.lock().unwrap().last().cloned().unwrap_or_default()
    }

    fn resolve(&self, item: &BatchItem) -> BatchSlot {
        let streams = self.streams.lock().unwrap();
        let messages = self.messages.lock().unwrap();
        let history = |key: &StreamKey| messages.get(key).cloned().unwrap_or_default();

        match item {
            BatchItem::Stream(query) => match streams.get(&query.key) {
                Some(fields) => {
                    let mut latest = history(&query.key);
                    let keep = query.messages.unwrap_or(0) as usize;
                    latest.drain(..latest.len().saturating_sub(keep));
                    BatchSlot::Ok(BatchPayload::Stream(StreamBundle {
                        stream: fields.clone(),
                        messages: latest,
                        participants: Vec::new(),
                    }))
                }
                None => BatchSlot::NotFound(query.key.to_string()),
            },
            BatchItem::Message { key, ordinal } => {
                match history(key).into_iter().find(|m| m.ordinal == *ordinal) {
                    Some(m) => BatchSlot::Ok(BatchPayload::Message(m)),
                    None => BatchSlot::NotFound(format!("{key} #{ordinal}")),
                }
            }
            BatchItem::Messages { .. } if self.fail_ranges.load(Ordering::SeqCst) => {
                BatchSlot::Error("range lookup failed".into())
            }
            BatchItem::Messages { key, range } => {
                let min = range.min.unwrap_or(1);
                let found = history(key)
                    .into_iter()
                    .filter(|m| m.ordinal >= min)
                    .filter(|m| match range.max {
                        RangeEnd::Ordinal(max) => m.ordinal <= max,
                        RangeEnd::Latest => true,
                    })
                    .collect();
                BatchSlot::Ok(BatchPayload::Messages(found))
            }
            BatchItem::Participant { key, user_id } => {
                let participants = self.participants.lock().unwrap();
                let found = participants
                    .get(key)
                    .and_then(|list| list.iter().find(|p| &p.user_id == user_id).cloned());
                match found {
                    Some(p) => BatchSlot::Ok(BatchPayload::Participant(p)),
                    None => BatchSlot::NotFound(user_id.to_string()),
                }
            }
            BatchItem::Participants { key, criteria } => {
                let participants = self.participants.lock().unwrap();
                let mut list = participants.get(key).cloned().unwrap_or_default();
                if let Some(limit) = criteria.limit {
                    list.truncate(limit as usize);
                }
                BatchSlot::Ok(BatchPayload::Participants(list))
            }
            BatchItem::Avatar { user_id } => BatchSlot::Ok(BatchPayload::Avatar(Avatar {
                user_id: user_id.clone(),
                username: user_id.as_str().to_string(),
                first_name: String::new(),
                last_name: String::new(),
                icon: String::new(),
            })),
        }
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    async fn batch(
        &self,
        _partition: &Partition,
        items: Vec<BatchItem>,
    ) -> RemoteResult<Vec<BatchSlot>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().unwrap().push(items.clone());
        let delay = *self.batch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(items.iter().map(|item| self.resolve(item)).collect())
    }

    async fn related(
        &self,
        _partition: &Partition,
        query: &RelatedQuery,
    ) -> RemoteResult<RelatedResult> {
        self.related_calls.fetch_add(1, Ordering::SeqCst);
        let streams = self.streams.lock().unwrap();
        let stream = streams
            .get(&query.key)
            .cloned()
            .ok_or_else(|| StreamsError::NotFound(query.key.to_string()))?;
        let members = self
            .relations
            .lock()
            .unwrap()
            .get(&query.key)
            .cloned()
            .unwrap_or_default();
        let relations = members
            .iter()
            .map(|member| Relation {
                to_publisher_id: query.key.publisher_id.clone(),
                to_stream_name: query.key.stream_name.clone(),
                relation_type: "Streams/chat".into(),
                from_publisher_id: member.publisher_id.clone(),
                from_stream_name: member.stream_name.clone(),
                weight: None,
            })
            .collect();
        let related_streams = members
            .iter()
            .filter_map(|member| streams.get(member).cloned())
            .collect();
        Ok(RelatedResult {
            stream,
            relations,
            related_streams,
        })
    }

    async fn participating(
        &self,
        _partition: &Partition,
        _user: &UserId,
        _query: &ParticipatingQuery,
    ) -> RemoteResult<Vec<Participant>> {
        Ok(Vec::new())
    }

    async fn post_message(
        &self,
        _partition: &Partition,
        key: &StreamKey,
        posted: &NewMessage,
    ) -> RemoteResult<Message> {
        let ordinal = {
            let streams = self.streams.lock().unwrap();
            let fields = streams
                .get(key)
                .ok_or_else(|| StreamsError::NotFound(key.to_string()))?;
            fields.message_count + 1
        };
        let mut message = message(key, ordinal);
        message.message_type = posted.message_type.clone();
        message.content = posted.content.clone();
        self.add_message(message.clone());
        Ok(message)
    }

    async fn join(&self, _partition: &Partition, key: &StreamKey) -> RemoteResult<Participant> {
        Ok(participant(key, "u9", ParticipantState::Participating))
    }

    async fn leave(&self, _partition: &Partition, key: &StreamKey) -> RemoteResult<Participant> {
        Ok(participant(key, "u9", ParticipantState::Left))
    }

    async fn save_stream(
        &self,
        _partition: &Partition,
        key: &StreamKey,
        changes: &Map<String, Value>,
    ) -> RemoteResult<StreamFields> {
        let mut streams = self.streams.lock().unwrap();
        let fields = streams
            .get_mut(key)
            .ok_or_else(|| StreamsError::NotFound(key.to_string()))?;
        if let Some(Value::String(attributes)) = changes.get("attributes") {
            fields.attributes = attributes.clone();
        }
        if let Some(Value::String(title)) = changes.get("title") {
            fields.title = title.clone();
        }
        match changes.get("closedTime") {
            Some(Value::Null) => fields.closed_time = None,
            Some(Value::String(at)) => fields.closed_time = Some(at.clone()),
            _ => {}
        }
        Ok(fields.clone())
    }

    async fn close_stream(
        &self,
        _partition: &Partition,
        key: &StreamKey,
    ) -> RemoteResult<StreamFields> {
        let mut streams = self.streams.lock().unwrap();
        let fields = streams
            .get_mut(key)
            .ok_or_else(|| StreamsError::NotFound(key.to_string()))?;
        fields.closed_time = Some("2026-01-01T00:00:00Z".into());
        Ok(fields.clone())
    }

    async fn relate(&self, _partition: &Partition, _request: &RelationRequest) -> RemoteResult<()> {
        Ok(())
    }

    async fn unrelate(
        &self,
        _partition: &Partition,
        _request: &RelationRequest,
    ) -> RemoteResult<()> {
        Ok(())
    }

    async fn create_stream(
        &self,
        _partition: &Partition,
        stream: &NewStream,
    ) -> RemoteResult<CreatedStream> {
        let key = StreamKey::from_parts(
            stream.publisher_id.clone(),
            rivulet_shared::types::StreamName::new("chat/new").unwrap(),
        );
        self.add_stream(&key, 0);
        if let Some(Value::String(title)) = stream.fields.get("title") {
            self.streams.lock().unwrap().get_mut(&key).unwrap().title = title.clone();
        }
        let message_to = stream.related.as_ref().map(|related| {
            self.relate(&related.to, &key);
            self.relation_notice(&related.to, &key, "Streams/relatedTo")
        });
        let fields = self.streams.lock().unwrap()[&key].clone();
        Ok(CreatedStream {
            stream: fields,
            message_to,
        })
    }

    async fn update_relation(
        &self,
        _partition: &Partition,
        request: &RelationRequest,
        _adjust_weights: bool,
    ) -> RemoteResult<Option<Message>> {
        Ok(Some(self.relation_notice(
            &request.to,
            &request.from,
            "Streams/updatedRelateTo",
        )))
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn chat() -> StreamKey {
    StreamKey::new("u1", "chat/1").unwrap()
}

fn fields(key: &StreamKey, message_count: u64) -> StreamFields {
    serde_json::from_value(json!({
        "publisherId": key.publisher_id.as_str(),
        "name": key.stream_name.as_str(),
        "type": "Streams/chat",
        "title": "Chat",
        "attributes": "{}",
        "messageCount": message_count,
        "readLevel": 40,
        "writeLevel": 20,
        "adminLevel": 0,
    }))
    .unwrap()
}

fn message(key: &StreamKey, ordinal: u64) -> Message {
    Message {
        publisher_id: key.publisher_id.clone(),
        stream_name: key.stream_name.clone(),
        ordinal,
        message_type: "Streams/chat/message".into(),
        stream_type: Some("Streams/chat".into()),
        content: format!("message {ordinal}"),
        instructions: "{}".into(),
        by_user_id: None,
        inserted_time: None,
    }
}

fn participant(key: &StreamKey, user: &str, state: ParticipantState) -> Participant {
    Participant {
        publisher_id: key.publisher_id.clone(),
        stream_name: key.stream_name.clone(),
        user_id: UserId::new(user).unwrap(),
        state,
        stream_type: Some("Streams/chat".into()),
        extra: "{}".into(),
        inserted_time: None,
    }
}

fn config() -> StreamsConfig {
    StreamsConfig::default()
}

fn start(remote: Arc<MockRemote>) -> StreamsHandle {
    start_with(config(), remote)
}

fn start_with(config: StreamsConfig, remote: Arc<MockRemote>) -> StreamsHandle {
    let (handle, _task) = spawn_streams(config, remote).unwrap();
    handle
}

fn category() -> StreamKey {
    StreamKey::new("u1", "Streams/chats/").unwrap()
}

fn second_chat() -> StreamKey {
    StreamKey::new("u1", "chat/2").unwrap()
}

fn category_query() -> RelatedQuery {
    RelatedQuery {
        key: category(),
        relation_type: None,
        is_category: true,
    }
}

/// A category holding `chat()` and `second_chat()`.
fn with_category() -> Arc<MockRemote> {
    let remote = MockRemote::with_stream(&chat(), 7);
    remote.add_stream(&second_chat(), 3);
    remote.add_stream(&category(), 0);
    remote.relate(&category(), &chat());
    remote.relate(&category(), &second_chat());
    remote
}

fn partition(key: &StreamKey) -> Partition {
    config().router().for_publisher(&key.publisher_id)
}

/// Record the ordinals delivered to message listeners on `key`.
async fn record_ordinals(handle: &StreamsHandle, key: &StreamKey) -> Arc<Mutex<Vec<u64>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    handle
        .subscribe(Subscription::stream_message(
            Some(key.publisher_id.clone()),
            Some(key.stream_name.clone()),
            None,
            move |event: &MessageEvent| sink.lock().unwrap().push(event.message.ordinal),
        ))
        .await
        .unwrap();
    seen
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_listening_wait_delivers_in_order() {
    tokio::time::pause();
    let remote = MockRemote::with_stream(&chat(), 7);
    let handle = start(remote.clone());

    handle.get_stream(chat()).await.unwrap();
    handle.socket_connected(partition(&chat())).await.unwrap();
    let seen = record_ordinals(&handle, &chat()).await;

    let waiting = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .wait_for_message(chat(), WaitTarget::Ordinal(10), WaitOptions::default())
                .await
        })
    };
    while handle.stats().await.unwrap().waits == 0 {
        tokio::task::yield_now().await;
    }

    for ordinal in [9, 8, 10] {
        handle
            .push(partition(&chat()), PushEvent::Post(message(&chat(), ordinal)))
            .await
            .unwrap();
    }

    let outcome = waiting.await.unwrap().unwrap();
    assert_eq!(outcome, WaitOutcome::Delivered(10));
    assert_eq!(*seen.lock().unwrap(), vec![8, 9, 10]);
    // Everything arrived over the push channel.
    assert_eq!(remote.calls(), 1);
}

#[tokio::test]
async fn test_out_of_order_posts_fall_back_to_fetch() {
    tokio::time::pause();
    let remote = MockRemote::with_stream(&chat(), 7);
    for ordinal in 8..=10 {
        remote.add_message(message(&chat(), ordinal));
    }
    let handle = start(remote.clone());
    handle.get_stream(chat()).await.unwrap();
    let seen = record_ordinals(&handle, &chat()).await;

    // No live channel: gaps are fetched instead of listened for.
    for ordinal in [10, 9, 8] {
        handle
            .push(partition(&chat()), PushEvent::Post(message(&chat(), ordinal)))
            .await
            .unwrap();
    }

    wait_until(|| seen.lock().unwrap().len() >= 3).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(*seen.lock().unwrap(), vec![8, 9, 10]);
}

#[tokio::test]
async fn test_wait_outcomes_without_fetching() {
    tokio::time::pause();
    let remote = MockRemote::with_stream(&chat(), 7);
    let handle = start(remote.clone());

    let unknown = StreamKey::new("u2", "chat/9").unwrap();
    let outcome = handle
        .wait_for_message(unknown, WaitTarget::Ordinal(3), WaitOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome, WaitOutcome::NotCached);

    handle.get_stream(chat()).await.unwrap();
    let outcome = handle
        .wait_for_message(chat(), WaitTarget::Ordinal(5), WaitOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome, WaitOutcome::AlreadySatisfied);
    assert_eq!(remote.calls(), 1);
}

#[tokio::test]
async fn test_posted_message_and_its_echo_dispatch_once() {
    tokio::time::pause();
    let remote = MockRemote::with_stream(&chat(), 7);
    let handle = start(remote.clone());
    handle.get_stream(chat()).await.unwrap();
    let seen = record_ordinals(&handle, &chat()).await;

    let posted = handle
        .post_message(
            chat(),
            NewMessage {
                message_type: "Streams/chat/message".into(),
                content: "hello".into(),
                instructions: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(posted.ordinal, 8);

    handle
        .push(partition(&chat()), PushEvent::Post(posted.clone()))
        .await
        .unwrap();
    handle.stats().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![8]);
    let stream = handle.cached_stream(chat()).await.unwrap().unwrap();
    assert_eq!(rivulet_client::stream::read(&stream).message_count(), 8);
}

// ---------------------------------------------------------------------------
// Fetching
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrent_lookups_share_one_request() {
    tokio::time::pause();
    let remote = MockRemote::with_stream(&chat(), 7);
    let handle = start(remote.clone());

    let (a, b, c) = tokio::join!(
        handle.get_message(chat(), 3),
        handle.get_message(chat(), 3),
        handle.get_message(chat(), 3),
    );
    assert_eq!(a.unwrap().ordinal, 3);
    assert_eq!(b.unwrap().ordinal, 3);
    assert_eq!(c.unwrap().ordinal, 3);
    assert_eq!(remote.calls(), 1);
    assert_eq!(remote.last_batch().len(), 1);
}

#[tokio::test]
async fn test_distinct_lookups_merge_into_one_batch() {
    tokio::time::pause();
    let remote = MockRemote::with_stream(&chat(), 7);
    let handle = start(remote.clone());

    let (stream, message, avatar) = tokio::join!(
        handle.get_stream(chat()),
        handle.get_message(chat(), 2),
        handle.get_avatar(UserId::new("u1").unwrap()),
    );
    assert!(stream.is_ok());
    assert_eq!(message.unwrap().ordinal, 2);
    assert_eq!(avatar.unwrap().username, "u1");
    assert_eq!(remote.calls(), 1);
    assert_eq!(remote.last_batch().len(), 3);
}

#[tokio::test]
async fn test_participants_are_memoized() {
    tokio::time::pause();
    let remote = MockRemote::with_stream(&chat(), 7);
    remote.participants.lock().unwrap().insert(
        chat(),
        vec![
            participant(&chat(), "u1", ParticipantState::Participating),
            participant(&chat(), "u2", ParticipantState::Participating),
        ],
    );
    let handle = start(remote.clone());
    let criteria = ParticipantCriteria {
        limit: Some(50),
        ..ParticipantCriteria::default()
    };

    let first = handle
        .get_participants(chat(), criteria.clone())
        .await
        .unwrap();
    assert_eq!(first.len(), 2);
    let calls = remote.calls();

    let second = handle.get_participants(chat(), criteria).await.unwrap();
    assert_eq!(second, first);
    assert_eq!(remote.calls(), calls);
}

#[tokio::test]
async fn test_missing_stream_is_not_cached_unless_asked() {
    tokio::time::pause();
    let remote = Arc::new(MockRemote::default());
    let handle = start(remote.clone());
    let ghost = StreamKey::new("u3", "nothing").unwrap();

    let err = handle.get_stream(ghost.clone()).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(handle.get_stream(ghost.clone()).await.is_err());
    assert_eq!(remote.calls(), 2);

    let options = rivulet_client::FetchOptions {
        cache_if_missing: true,
        ..Default::default()
    };
    let query = rivulet_shared::protocol::StreamQuery::plain(ghost.clone());
    assert!(handle
        .get_stream_with(query.clone(), options.clone())
        .await
        .is_err());
    assert!(handle.get_stream_with(query, options).await.is_err());
    assert_eq!(remote.calls(), 3);
}

// ---------------------------------------------------------------------------
// Retention & refresh
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_refresh_hits_each_retained_stream_once() {
    tokio::time::pause();
    let remote = MockRemote::with_stream(&chat(), 7);
    let handle = start(remote.clone());

    handle.retain_with("App").get_stream(chat()).await.unwrap();
    assert_eq!(handle.retained_streams().await.unwrap(), vec![chat()]);
    let before = remote.calls();

    assert!(handle.refresh(RefreshOptions::default()).await.unwrap());
    assert_eq!(remote.calls(), before + 1);
    assert!(matches!(
        remote.last_batch().as_slice(),
        [BatchItem::Stream(query)] if query.key == chat()
    ));

    // Throttled right after.
    assert!(!handle.refresh(RefreshOptions::default()).await.unwrap());
    assert_eq!(remote.calls(), before + 1);
}

#[tokio::test]
async fn test_refresh_fires_field_changes() {
    tokio::time::pause();
    let remote = MockRemote::with_stream(&chat(), 7);
    let handle = start(remote.clone());
    handle.retain_with("App").get_stream(chat()).await.unwrap();

    let changed = Arc::new(Mutex::new(Vec::new()));
    let sink = changed.clone();
    handle
        .subscribe(Subscription::field_changed(
            Some(chat().publisher_id),
            Some(chat().stream_name),
            None,
            move |event: &FieldChangedEvent| sink.lock().unwrap().push(event.field.clone()),
        ))
        .await
        .unwrap();

    remote
        .streams
        .lock()
        .unwrap()
        .get_mut(&chat())
        .unwrap()
        .title = "Renamed".into();
    let refreshed = handle
        .refresh_stream(chat(), RefreshOptions::default())
        .await
        .unwrap();
    assert!(refreshed);
    assert_eq!(*changed.lock().unwrap(), vec!["title".to_string()]);
}

#[tokio::test]
async fn test_refresh_of_unretained_stream_evicts_it() {
    tokio::time::pause();
    let remote = MockRemote::with_stream(&chat(), 7);
    let handle = start(remote.clone());
    handle.get_stream(chat()).await.unwrap();
    let calls = remote.calls();

    let refreshed = handle
        .refresh_stream(chat(), RefreshOptions::default())
        .await
        .unwrap();
    assert!(!refreshed);
    assert_eq!(remote.calls(), calls);
    assert_eq!(handle.stats().await.unwrap().streams, 0);
}

#[tokio::test]
async fn test_logout_clears_caches_and_retention() {
    tokio::time::pause();
    let remote = MockRemote::with_stream(&chat(), 7);
    let handle = start(remote.clone());
    handle.login(UserId::new("u9").unwrap()).await.unwrap();

    handle.retain_with("App").get_stream(chat()).await.unwrap();
    handle.get_message(chat(), 1).await.unwrap();
    handle
        .get_participants(chat(), ParticipantCriteria::default())
        .await
        .unwrap();
    handle.get_avatar(UserId::new("u1").unwrap()).await.unwrap();

    let stats = handle.stats().await.unwrap();
    assert!(stats.streams > 0 && stats.messages > 0);
    assert!(stats.participants > 0 && stats.avatars > 0);
    assert_eq!(stats.retained, 1);

    handle.logout().await.unwrap();
    let stats = handle.stats().await.unwrap();
    assert_eq!(stats, rivulet_client::CacheStats::default());

    // The old key no longer retains anything, so nothing is refreshed.
    let calls = remote.calls();
    assert!(handle.refresh(RefreshOptions::default()).await.unwrap());
    assert_eq!(remote.calls(), calls);
    assert!(handle.retained_streams().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_offline_refresh_is_refused() {
    tokio::time::pause();
    let remote = MockRemote::with_stream(&chat(), 7);
    let handle = start(remote.clone());
    handle.retain_with("App").get_stream(chat()).await.unwrap();

    handle
        .set_connection(rivulet_shared::types::ConnectionMode::Offline)
        .await
        .unwrap();
    assert!(!handle.refresh(RefreshOptions::default()).await.unwrap());
}

// ---------------------------------------------------------------------------
// Writes & push effects
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_save_sends_draft_and_commits() {
    tokio::time::pause();
    let remote = MockRemote::with_stream(&chat(), 7);
    let handle = start(remote.clone());
    let stream = handle.get_stream(chat()).await.unwrap();

    rivulet_client::stream::write(&stream).set_attribute("color", json!("blue"));
    let saved = handle.save(chat()).await.unwrap();

    let saved = rivulet_client::stream::read(&saved);
    assert!(!saved.has_draft());
    assert_eq!(saved.get_attribute("color"), Some(&json!("blue")));
}

#[tokio::test]
async fn test_changed_message_updates_stream_fields() {
    tokio::time::pause();
    let remote = MockRemote::with_stream(&chat(), 7);
    let handle = start(remote.clone());
    let stream = handle.get_stream(chat()).await.unwrap();

    let mut changed = message(&chat(), 8);
    changed.message_type = "Streams/changed".into();
    changed.instructions = json!({"changes": {"title": "New title"}}).to_string();
    handle
        .push(partition(&chat()), PushEvent::Post(changed))
        .await
        .unwrap();
    handle.stats().await.unwrap();

    assert_eq!(rivulet_client::stream::read(&stream).fields().title, "New title");
}

#[tokio::test]
async fn test_removed_stream_is_forgotten() {
    tokio::time::pause();
    let remote = MockRemote::with_stream(&chat(), 7);
    let handle = start(remote.clone());
    handle.get_stream(chat()).await.unwrap();

    handle
        .push(partition(&chat()), PushEvent::Remove(chat()))
        .await
        .unwrap();
    assert!(handle.cached_stream(chat()).await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_disk_cache_warms_next_start() {
    tokio::time::pause();
    let dir = tempfile::tempdir().unwrap();
    let config = StreamsConfig {
        cache_path: Some(dir.path().join("streams.db")),
        ..StreamsConfig::default()
    };
    let remote = MockRemote::with_stream(&chat(), 7);

    let (handle, task) = spawn_streams(config.clone(), remote.clone()).unwrap();
    handle.get_stream(chat()).await.unwrap();
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    let (handle, _task) = spawn_streams(config, remote.clone()).unwrap();
    let cached = handle.cached_stream(chat()).await.unwrap();
    assert!(cached.is_some());
    assert_eq!(remote.calls(), 1);
}

// ---------------------------------------------------------------------------
// Failed fetches
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_held_post_survives_failed_gap_fetch() {
    tokio::time::pause();
    let remote = MockRemote::with_stream(&chat(), 7);
    remote.fail_ranges.store(true, Ordering::SeqCst);
    let handle = start(remote.clone());
    handle.get_stream(chat()).await.unwrap();
    let seen = record_ordinals(&handle, &chat()).await;

    handle
        .push(partition(&chat()), PushEvent::Post(message(&chat(), 9)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(handle.stats().await.unwrap().waits, 1);

    // The missing message turns up on the push channel after all.
    handle
        .push(partition(&chat()), PushEvent::Post(message(&chat(), 8)))
        .await
        .unwrap();
    wait_until(|| seen.lock().unwrap().len() >= 2).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(*seen.lock().unwrap(), vec![8, 9]);
    assert_eq!(handle.stats().await.unwrap().waits, 0);
}

#[tokio::test]
async fn test_failed_fetch_reaches_waiter_and_keeps_listening() {
    tokio::time::pause();
    let remote = MockRemote::with_stream(&chat(), 7);
    remote.fail_ranges.store(true, Ordering::SeqCst);
    let handle = start(remote.clone());
    handle.get_stream(chat()).await.unwrap();
    handle.socket_connected(partition(&chat())).await.unwrap();
    let seen = record_ordinals(&handle, &chat()).await;

    let errors = Arc::new(AtomicUsize::new(0));
    let counter = errors.clone();
    handle
        .subscribe(Subscription::error(move |_: &ErrorEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();

    let waiting = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .wait_for_message(chat(), WaitTarget::Ordinal(10), WaitOptions::default())
                .await
        })
    };
    let outcome = waiting.await.unwrap();
    assert!(outcome.is_err());
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(handle.stats().await.unwrap().waits, 1);

    for ordinal in 8..=10 {
        handle
            .push(partition(&chat()), PushEvent::Post(message(&chat(), ordinal)))
            .await
            .unwrap();
    }
    handle.stats().await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![8, 9, 10]);
    assert_eq!(handle.stats().await.unwrap().waits, 0);
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_lookup_after_logout_does_not_join_old_request() {
    tokio::time::pause();
    let remote = MockRemote::with_stream(&chat(), 7);
    *remote.batch_delay.lock().unwrap() = Some(Duration::from_secs(1));
    let handle = start(remote.clone());

    let early = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.get_stream(chat()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(remote.calls(), 1);

    handle.logout().await.unwrap();
    handle.retain_with("App").get_stream(chat()).await.unwrap();

    // The early caller still gets its answer, just not a cached one.
    assert!(early.await.unwrap().is_ok());
    assert_eq!(remote.calls(), 2);
    assert_eq!(handle.retained_streams().await.unwrap(), vec![chat()]);
    assert!(handle.cached_stream(chat()).await.unwrap().is_some());
}

#[tokio::test]
async fn test_sink_after_shutdown_is_quiet() {
    let remote = MockRemote::with_stream(&chat(), 7);
    let (handle, task) = spawn_streams(config(), remote).unwrap();
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    let sink: &dyn PushSink = &handle;
    sink.connected(&partition(&chat())).await;
    sink.event(&partition(&chat()), PushEvent::Post(message(&chat(), 8))).await;
    sink.disconnected(&partition(&chat())).await;
    assert!(handle.stats().await.is_err());
}

// ---------------------------------------------------------------------------
// Relations
// ---------------------------------------------------------------------------

/// Record the relation changes seen on `key`.
async fn record_relations(
    handle: &StreamsHandle,
    key: &StreamKey,
) -> Arc<Mutex<Vec<(RelationChange, Option<StreamKey>)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    handle
        .subscribe(Subscription::relation(
            Some(key.publisher_id.clone()),
            Some(key.stream_name.clone()),
            None,
            move |event: &RelationEvent| {
                sink.lock().unwrap().push((event.change, event.other.clone()))
            },
        ))
        .await
        .unwrap();
    seen
}

#[tokio::test]
async fn test_relation_message_invalidates_and_refreshes_other_end() {
    tokio::time::pause();
    let remote = with_category();
    let handle = start(remote.clone());
    handle
        .retain_with("App")
        .get_stream(second_chat())
        .await
        .unwrap();
    handle.get_stream(category()).await.unwrap();

    handle.related(category_query(), false).await.unwrap();
    handle.related(category_query(), false).await.unwrap();
    assert_eq!(remote.related_calls(), 1);

    let changes = record_relations(&handle, &category()).await;
    let notice = remote.relation_notice(&category(), &second_chat(), "Streams/relatedTo");
    let before = remote.batches_for(&second_chat());
    handle
        .push(partition(&category()), PushEvent::Post(notice))
        .await
        .unwrap();
    handle.stats().await.unwrap();

    assert_eq!(
        *changes.lock().unwrap(),
        vec![(RelationChange::RelatedTo, Some(second_chat()))]
    );
    wait_until(|| remote.batches_for(&second_chat()) > before).await;

    handle.related(category_query(), false).await.unwrap();
    assert_eq!(remote.related_calls(), 2);
}

#[tokio::test]
async fn test_related_lookup_retains_every_stream() {
    tokio::time::pause();
    let remote = with_category();
    let handle = start(remote.clone());

    let related = handle
        .retain_with("Feed")
        .related(category_query(), false)
        .await
        .unwrap();
    assert_eq!(related.streams.len(), 2);
    assert_eq!(related.relations.len(), 2);
    assert_eq!(
        handle.retained_streams().await.unwrap(),
        vec![category(), chat(), second_chat()]
    );

    // A cache hit retains just the same.
    handle.release("Feed").await.unwrap();
    assert!(handle.retained_streams().await.unwrap().is_empty());
    handle
        .retain_with("Other")
        .related(category_query(), false)
        .await
        .unwrap();
    assert_eq!(remote.related_calls(), 1);
    assert_eq!(handle.retained_streams().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_update_relation_posts_notice_and_invalidates() {
    tokio::time::pause();
    let remote = with_category();
    let handle = start(remote.clone());
    handle.get_stream(category()).await.unwrap();
    handle.related(category_query(), false).await.unwrap();
    let changes = record_relations(&handle, &category()).await;

    handle
        .update_relation(
            RelationRequest {
                to: category(),
                relation_type: "Streams/chat".into(),
                from: second_chat(),
                weight: Some(2.0),
            },
            true,
        )
        .await
        .unwrap();
    handle.stats().await.unwrap();

    assert_eq!(
        *changes.lock().unwrap(),
        vec![(RelationChange::UpdatedRelateTo, Some(second_chat()))]
    );
    handle.related(category_query(), false).await.unwrap();
    assert_eq!(remote.related_calls(), 2);
}

// ---------------------------------------------------------------------------
// Create & reopen
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_create_caches_retains_and_invalidates_category() {
    tokio::time::pause();
    let remote = with_category();
    let handle = start(remote.clone());
    handle.related(category_query(), false).await.unwrap();

    let created = handle
        .retain_with("App")
        .create(NewStream {
            publisher_id: chat().publisher_id,
            stream_type: "Streams/chat".into(),
            fields: json!({"title": "Fresh"}).as_object().unwrap().clone(),
            related: Some(RelateOnCreate {
                to: category(),
                relation_type: "Streams/chat".into(),
            }),
        })
        .await
        .unwrap();

    let key = StreamKey::new("u1", "chat/new").unwrap();
    {
        let stream = rivulet_client::stream::read(&created.stream);
        assert_eq!(stream.key(), &key);
        assert_eq!(stream.fields().title, "Fresh");
    }
    let notice = created.message_to.unwrap();
    assert_eq!(notice.message_type, "Streams/relatedTo");
    assert_eq!(notice.key(), category());

    assert!(handle.cached_stream(key.clone()).await.unwrap().is_some());
    assert!(handle.retained_streams().await.unwrap().contains(&key));

    let related = handle.related(category_query(), false).await.unwrap();
    assert_eq!(remote.related_calls(), 2);
    assert_eq!(related.streams.len(), 3);
}

#[tokio::test]
async fn test_reopen_clears_closed_time() {
    tokio::time::pause();
    let remote = MockRemote::with_stream(&chat(), 7);
    let handle = start(remote.clone());
    handle.get_stream(chat()).await.unwrap();

    let closed = handle.close(chat()).await.unwrap();
    assert!(rivulet_client::stream::read(&closed).is_closed());

    let reopened = handle.reopen(chat()).await.unwrap();
    assert!(!rivulet_client::stream::read(&reopened).is_closed());
    let cached = handle.cached_stream(chat()).await.unwrap().unwrap();
    assert!(!rivulet_client::stream::read(&cached).is_closed());
}

#[tokio::test]
async fn test_closed_message_fires_closed_listeners() {
    tokio::time::pause();
    let remote = MockRemote::with_stream(&chat(), 7);
    let handle = start(remote.clone());
    let stream = handle.get_stream(chat()).await.unwrap();

    let closes = Arc::new(AtomicUsize::new(0));
    let counter = closes.clone();
    handle
        .subscribe(Subscription::closed(
            Some(chat().publisher_id),
            Some(chat().stream_name),
            move |_: &StreamEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        ))
        .await
        .unwrap();

    let mut closing = message(&chat(), 8);
    closing.message_type = "Streams/closed".into();
    handle
        .push(partition(&chat()), PushEvent::Post(closing))
        .await
        .unwrap();
    handle.stats().await.unwrap();

    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert!(rivulet_client::stream::read(&stream).is_closed());
}

// ---------------------------------------------------------------------------
// Automatic refresh
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_burst_of_watched_messages_refreshes_once() {
    tokio::time::pause();
    let remote = MockRemote::with_stream(&chat(), 7);
    let handle = start(remote.clone());
    handle.get_stream(chat()).await.unwrap();
    handle
        .should_refresh_stream("Streams/chat/message", true)
        .await
        .unwrap();
    let calls = remote.calls();

    for ordinal in [8, 9] {
        handle
            .push(partition(&chat()), PushEvent::Post(message(&chat(), ordinal)))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(remote.calls(), calls);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(remote.calls(), calls + 1);
    assert!(matches!(
        remote.last_batch().as_slice(),
        [BatchItem::Stream(query)] if query.key == chat()
    ));
}

#[tokio::test]
async fn test_stalled_tick_refreshes_retained_streams() {
    tokio::time::pause();
    let remote = MockRemote::with_stream(&chat(), 7);
    let handle = start(remote.clone());
    handle.retain_with("App").get_stream(chat()).await.unwrap();
    let calls = remote.calls();

    // The host slept.
    tokio::time::advance(Duration::from_secs(10)).await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(remote.calls(), calls + 1);
}

#[tokio::test]
async fn test_stalled_tick_respects_opt_out() {
    tokio::time::pause();
    let remote = MockRemote::with_stream(&chat(), 7);
    let config = StreamsConfig {
        prevent_automatic_refresh: true,
        ..config()
    };
    let handle = start_with(config, remote.clone());
    handle.retain_with("App").get_stream(chat()).await.unwrap();
    let calls = remote.calls();

    tokio::time::advance(Duration::from_secs(10)).await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(remote.calls(), calls);
}
