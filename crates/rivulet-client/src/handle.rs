//! The public face of the coordinator.
//!
//! [`StreamsHandle`] is a cheap, cloneable sender. Every method turns into
//! one [`Command`] and, when there is an answer, awaits it on a oneshot.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use rivulet_net::{
    spawn_socket, NewMessage, NewStream, ParticipatingQuery, Partition, PushSink, RelationRequest,
    RemoteApi,
};
use rivulet_shared::error::StreamsError;
use rivulet_shared::models::{Avatar, Message, Participant};
use rivulet_shared::protocol::{
    BatchItem, BatchPayload, MessageRange, ParticipantCriteria, PushEvent, RelatedQuery,
    StreamQuery,
};
use rivulet_shared::types::{ConnectionMode, Ordinal, StreamKey, UserId, WaitTarget};
use rivulet_store::Database;

use crate::cache::Related;
use crate::config::StreamsConfig;
use crate::coordinator::{
    CacheStats, Command, Core, Created, FetchOptions, RefreshOptions, Reply,
};
use crate::dispatcher::HandlerId;
use crate::hub::Subscription;
use crate::registry::RetainKey;
use crate::stream::SharedStream;
use crate::waiter::{WaitOptions, WaitOutcome};

/// Depth of the command queue in front of the coordinator task.
const COMMAND_QUEUE: usize = 256;

fn unexpected(what: &str) -> StreamsError {
    StreamsError::Decode(format!("expected {what} in batch response"))
}

#[derive(Clone)]
pub struct StreamsHandle {
    tx: mpsc::Sender<Command>,
}

impl StreamsHandle {
    async fn send(&self, command: Command) -> Result<(), StreamsError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| StreamsError::Shutdown)
    }

    /// Send a command carrying a fallible reply and wait for it.
    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, StreamsError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| StreamsError::Shutdown)?
    }

    /// Send a command carrying an infallible reply and wait for it.
    async fn ask<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, StreamsError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| StreamsError::Shutdown)
    }

    // -----------------------------------------------------------------------
    // Streams
    // -----------------------------------------------------------------------

    pub async fn get_stream(&self, key: StreamKey) -> Result<SharedStream, StreamsError> {
        self.get_stream_with(StreamQuery::plain(key), FetchOptions::default())
            .await
    }

    pub async fn get_stream_with(
        &self,
        query: StreamQuery,
        options: FetchOptions,
    ) -> Result<SharedStream, StreamsError> {
        self.fetch_stream(query, options, None).await
    }

    async fn fetch_stream(
        &self,
        query: StreamQuery,
        options: FetchOptions,
        retain: Option<RetainKey>,
    ) -> Result<SharedStream, StreamsError> {
        self.call(|reply| Command::GetStream {
            query,
            options,
            retain,
            reply,
        })
        .await
    }

    /// The instance held in memory, without touching the network.
    pub async fn cached_stream(
        &self,
        key: StreamKey,
    ) -> Result<Option<SharedStream>, StreamsError> {
        self.ask(|reply| Command::CachedStream { key, reply }).await
    }

    pub async fn stats(&self) -> Result<CacheStats, StreamsError> {
        self.ask(Command::Stats).await
    }

    /// Retain whatever the next lookup on the returned builder produces.
    pub fn retain_with(&self, key: impl Into<RetainKey>) -> RetainWith<'_> {
        RetainWith {
            handle: self,
            key: key.into(),
        }
    }

    // -----------------------------------------------------------------------
    // Messages, participants, avatars
    // -----------------------------------------------------------------------

    /// Raw batched lookup.
    pub async fn fetch(&self, item: BatchItem, force: bool) -> Result<BatchPayload, StreamsError> {
        self.call(|reply| Command::Fetch { item, force, reply })
            .await
    }

    pub async fn get_message(
        &self,
        key: StreamKey,
        ordinal: Ordinal,
    ) -> Result<Message, StreamsError> {
        match self.fetch(BatchItem::Message { key, ordinal }, false).await? {
            BatchPayload::Message(message) => Ok(message),
            _ => Err(unexpected("a message")),
        }
    }

    pub async fn get_messages(
        &self,
        key: StreamKey,
        range: MessageRange,
    ) -> Result<Vec<Message>, StreamsError> {
        match self.fetch(BatchItem::Messages { key, range }, false).await? {
            BatchPayload::Messages(messages) => Ok(messages),
            _ => Err(unexpected("messages")),
        }
    }

    pub async fn get_participant(
        &self,
        key: StreamKey,
        user_id: UserId,
    ) -> Result<Participant, StreamsError> {
        match self
            .fetch(BatchItem::Participant { key, user_id }, false)
            .await?
        {
            BatchPayload::Participant(participant) => Ok(participant),
            _ => Err(unexpected("a participant")),
        }
    }

    pub async fn get_participants(
        &self,
        key: StreamKey,
        criteria: ParticipantCriteria,
    ) -> Result<Vec<Participant>, StreamsError> {
        match self
            .fetch(BatchItem::Participants { key, criteria }, false)
            .await?
        {
            BatchPayload::Participants(participants) => Ok(participants),
            _ => Err(unexpected("participants")),
        }
    }

    pub async fn get_avatar(&self, user_id: UserId) -> Result<Avatar, StreamsError> {
        match self.fetch(BatchItem::Avatar { user_id }, false).await? {
            BatchPayload::Avatar(avatar) => Ok(avatar),
            _ => Err(unexpected("an avatar")),
        }
    }

    pub async fn related(&self, query: RelatedQuery, force: bool) -> Result<Related, StreamsError> {
        self.call(|reply| Command::Related {
            query,
            force,
            retain: None,
            reply,
        })
        .await
    }

    /// What the logged-in user participates in.
    pub async fn get_participating(
        &self,
        query: ParticipatingQuery,
        force: bool,
    ) -> Result<Vec<Participant>, StreamsError> {
        self.call(|reply| Command::Participating {
            query,
            force,
            reply,
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    pub async fn post_message(
        &self,
        key: StreamKey,
        message: NewMessage,
    ) -> Result<Message, StreamsError> {
        self.call(|reply| Command::Post {
            key,
            message,
            reply,
        })
        .await
    }

    pub async fn join(&self, key: StreamKey) -> Result<Participant, StreamsError> {
        self.call(|reply| Command::Participate {
            key,
            join: true,
            reply,
        })
        .await
    }

    pub async fn leave(&self, key: StreamKey) -> Result<Participant, StreamsError> {
        self.call(|reply| Command::Participate {
            key,
            join: false,
            reply,
        })
        .await
    }

    /// Save the draft attributes of a cached stream.
    pub async fn save(&self, key: StreamKey) -> Result<SharedStream, StreamsError> {
        self.call(|reply| Command::Save { key, reply }).await
    }

    pub async fn close(&self, key: StreamKey) -> Result<SharedStream, StreamsError> {
        self.call(|reply| Command::Close { key, reply }).await
    }

    /// Undo [`close`](Self::close) while the stream has not been removed.
    pub async fn reopen(&self, key: StreamKey) -> Result<SharedStream, StreamsError> {
        self.call(|reply| Command::Reopen { key, reply }).await
    }

    pub async fn create(&self, stream: NewStream) -> Result<Created, StreamsError> {
        self.call(|reply| Command::Create {
            stream,
            retain: None,
            reply,
        })
        .await
    }

    pub async fn relate(&self, request: RelationRequest) -> Result<(), StreamsError> {
        self.call(|reply| Command::Relate {
            request,
            add: true,
            reply,
        })
        .await
    }

    pub async fn unrelate(&self, request: RelationRequest) -> Result<(), StreamsError> {
        self.call(|reply| Command::Relate {
            request,
            add: false,
            reply,
        })
        .await
    }

    /// Move a relation to `request.weight`. With `adjust_weights` the
    /// server shifts the other relations of the category to make room.
    pub async fn update_relation(
        &self,
        request: RelationRequest,
        adjust_weights: bool,
    ) -> Result<(), StreamsError> {
        self.call(|reply| Command::UpdateRelation {
            request,
            adjust_weights,
            reply,
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    pub async fn retain(
        &self,
        key: StreamKey,
        retain: impl Into<RetainKey>,
    ) -> Result<(), StreamsError> {
        self.send(Command::Retain {
            key,
            retain: retain.into(),
        })
        .await
    }

    pub async fn release_stream(&self, key: StreamKey) -> Result<(), StreamsError> {
        self.send(Command::ReleaseStream(key)).await
    }

    pub async fn release(&self, retain: impl Into<RetainKey>) -> Result<(), StreamsError> {
        self.send(Command::Release(retain.into())).await
    }

    pub async fn release_all(&self) -> Result<(), StreamsError> {
        self.send(Command::ReleaseAll).await
    }

    pub async fn retained_streams(&self) -> Result<Vec<StreamKey>, StreamsError> {
        self.ask(Command::RetainedStreams).await
    }

    // -----------------------------------------------------------------------
    // Refresh & waits
    // -----------------------------------------------------------------------

    /// Refresh every retained stream. `Ok(false)` when offline or throttled.
    pub async fn refresh(&self, options: RefreshOptions) -> Result<bool, StreamsError> {
        self.call(|reply| Command::Refresh { options, reply }).await
    }

    pub async fn refresh_stream(
        &self,
        key: StreamKey,
        options: RefreshOptions,
    ) -> Result<bool, StreamsError> {
        self.call(|reply| Command::RefreshStream {
            key,
            options,
            reply,
        })
        .await
    }

    /// Refresh a stream shortly after messages of this type arrive.
    pub async fn should_refresh_stream(
        &self,
        message_type: impl Into<String>,
        enabled: bool,
    ) -> Result<(), StreamsError> {
        self.send(Command::ShouldRefresh {
            message_type: message_type.into(),
            enabled,
        })
        .await
    }

    /// Resolve once every message through `target` has been delivered to
    /// listeners, fetching what does not arrive in time.
    pub async fn wait_for_message(
        &self,
        key: StreamKey,
        target: WaitTarget,
        options: WaitOptions,
    ) -> Result<WaitOutcome, StreamsError> {
        self.call(|reply| Command::WaitForMessage {
            key,
            target,
            options,
            reply,
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    pub async fn subscribe(&self, subscription: Subscription) -> Result<HandlerId, StreamsError> {
        self.ask(|reply| Command::Subscribe {
            subscription,
            reply,
        })
        .await
    }

    pub async fn unsubscribe(&self, id: HandlerId) -> Result<bool, StreamsError> {
        self.ask(|reply| Command::Unsubscribe { id, reply }).await
    }

    // -----------------------------------------------------------------------
    // Session
    // -----------------------------------------------------------------------

    pub async fn login(&self, user: UserId) -> Result<(), StreamsError> {
        self.ask(|reply| Command::Login { user, reply }).await
    }

    pub async fn logout(&self) -> Result<(), StreamsError> {
        self.ask(Command::Logout).await
    }

    pub async fn reset(&self) -> Result<(), StreamsError> {
        self.ask(Command::Reset).await
    }

    pub async fn set_connection(&self, mode: ConnectionMode) -> Result<(), StreamsError> {
        self.send(Command::SetConnection(mode)).await
    }

    // -----------------------------------------------------------------------
    // Push channel
    // -----------------------------------------------------------------------

    pub async fn socket_connected(&self, partition: Partition) -> Result<(), StreamsError> {
        self.send(Command::SocketConnected(partition)).await
    }

    pub async fn socket_disconnected(&self, partition: Partition) -> Result<(), StreamsError> {
        self.send(Command::SocketDisconnected(partition)).await
    }

    pub async fn push(&self, partition: Partition, event: PushEvent) -> Result<(), StreamsError> {
        self.send(Command::Push { partition, event }).await
    }

    pub async fn shutdown(&self) -> Result<(), StreamsError> {
        self.send(Command::Shutdown).await
    }
}

#[async_trait]
impl PushSink for StreamsHandle {
    async fn connected(&self, partition: &Partition) {
        if self.socket_connected(partition.clone()).await.is_err() {
            debug!(partition = %partition, "Coordinator gone, dropping connect notice");
        }
    }

    async fn event(&self, partition: &Partition, event: PushEvent) {
        if self.push(partition.clone(), event).await.is_err() {
            debug!(partition = %partition, "Coordinator gone, dropping push event");
        }
    }

    async fn disconnected(&self, partition: &Partition) {
        if self.socket_disconnected(partition.clone()).await.is_err() {
            debug!(partition = %partition, "Coordinator gone, dropping disconnect notice");
        }
    }
}

/// Lookups whose result is retained under a caller key.
pub struct RetainWith<'a> {
    handle: &'a StreamsHandle,
    key: RetainKey,
}

impl RetainWith<'_> {
    pub async fn get_stream(self, key: StreamKey) -> Result<SharedStream, StreamsError> {
        self.get_stream_with(StreamQuery::plain(key), FetchOptions::default())
            .await
    }

    pub async fn get_stream_with(
        self,
        query: StreamQuery,
        options: FetchOptions,
    ) -> Result<SharedStream, StreamsError> {
        self.handle
            .fetch_stream(query, options, Some(self.key))
            .await
    }

    pub async fn related(self, query: RelatedQuery, force: bool) -> Result<Related, StreamsError> {
        let retain = Some(self.key);
        self.handle
            .call(|reply| Command::Related {
                query,
                force,
                retain,
                reply,
            })
            .await
    }

    pub async fn create(self, stream: NewStream) -> Result<Created, StreamsError> {
        let retain = Some(self.key);
        self.handle
            .call(|reply| Command::Create {
                stream,
                retain,
                reply,
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

/// Start the coordinator task.
///
/// Opens the on-disk cache when `config.cache_path` is set. The task runs
/// until [`StreamsHandle::shutdown`] or until every handle is dropped.
pub fn spawn_streams(
    config: StreamsConfig,
    remote: Arc<dyn RemoteApi>,
) -> anyhow::Result<(StreamsHandle, JoinHandle<()>)> {
    let store = match &config.cache_path {
        Some(path) => {
            let db = Database::open_at(path)
                .with_context(|| format!("opening stream cache at {}", path.display()))?;
            info!(path = %path.display(), "On-disk stream cache enabled");
            Some(db)
        }
        None => None,
    };

    let (tx, commands) = mpsc::channel::<Command>(COMMAND_QUEUE);
    let (internal_tx, internal) = mpsc::unbounded_channel();

    let core = Core::new(config, remote, store, internal_tx);
    let task = tokio::spawn(core.run(commands, internal));

    Ok((StreamsHandle { tx }, task))
}

/// Open one push channel per partition, feeding `handle`. Abort the
/// returned tasks to close them.
pub fn spawn_push_channels(handle: &StreamsHandle, config: &StreamsConfig) -> Vec<JoinHandle<()>> {
    let sink: Arc<dyn PushSink> = Arc::new(handle.clone());
    config
        .router()
        .partitions()
        .into_iter()
        .map(|partition| spawn_socket(partition, sink.clone(), config.socket_retry))
        .collect()
}
