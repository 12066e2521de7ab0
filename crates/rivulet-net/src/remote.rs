//! The remote Streams service as seen by the coordinator.
//!
//! Every call names the partition it goes to; routing is the caller's job
//! (see [`crate::partition::Router`]). Implementations must be cheap to
//! share across tasks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use rivulet_shared::error::StreamsError;
use rivulet_shared::models::{Message, Participant, StreamFields};
use rivulet_shared::protocol::{BatchItem, BatchSlot, RelatedQuery, RelatedResult};
use rivulet_shared::types::{PublisherId, StreamKey, UserId};

use crate::partition::Partition;

pub type RemoteResult<T> = Result<T, StreamsError>;

/// A message to post. The server assigns the ordinal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub content: String,
    /// JSON object, serialized.
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ParticipatingQuery {
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
    #[serde(default)]
    pub stream_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelationRequest {
    /// The category side.
    pub to: StreamKey,
    pub relation_type: String,
    pub from: StreamKey,
    #[serde(default)]
    pub weight: Option<f64>,
}

/// A stream to create. The server fills in whatever is not given.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewStream {
    pub publisher_id: PublisherId,
    #[serde(rename = "type")]
    pub stream_type: String,
    /// Extra row fields such as `title`, `content` or `attributes`.
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub related: Option<RelateOnCreate>,
}

/// Relate a new stream to a category in the same request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelateOnCreate {
    pub to: StreamKey,
    pub relation_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreatedStream {
    pub stream: StreamFields,
    /// The `Streams/relatedTo` message posted to the category, if related.
    #[serde(default)]
    pub message_to: Option<Message>,
}

#[async_trait]
pub trait RemoteApi: Send + Sync + 'static {
    /// Resolve up to `batch_max` lookups in one round trip. The returned
    /// vector is parallel to `items`.
    async fn batch(&self, partition: &Partition, items: Vec<BatchItem>)
        -> RemoteResult<Vec<BatchSlot>>;

    async fn related(&self, partition: &Partition, query: &RelatedQuery)
        -> RemoteResult<RelatedResult>;

    async fn participating(
        &self,
        partition: &Partition,
        user: &UserId,
        query: &ParticipatingQuery,
    ) -> RemoteResult<Vec<Participant>>;

    async fn post_message(
        &self,
        partition: &Partition,
        key: &StreamKey,
        message: &NewMessage,
    ) -> RemoteResult<Message>;

    async fn join(&self, partition: &Partition, key: &StreamKey) -> RemoteResult<Participant>;

    async fn leave(&self, partition: &Partition, key: &StreamKey) -> RemoteResult<Participant>;

    /// Persist changed fields. `attributes` travels as a serialized object.
    async fn save_stream(
        &self,
        partition: &Partition,
        key: &StreamKey,
        changes: &Map<String, Value>,
    ) -> RemoteResult<StreamFields>;

    async fn close_stream(&self, partition: &Partition, key: &StreamKey)
        -> RemoteResult<StreamFields>;

    async fn create_stream(&self, partition: &Partition, stream: &NewStream)
        -> RemoteResult<CreatedStream>;

    async fn relate(&self, partition: &Partition, request: &RelationRequest) -> RemoteResult<()>;

    async fn unrelate(&self, partition: &Partition, request: &RelationRequest)
        -> RemoteResult<()>;

    /// Change the weight of an existing relation. Returns the
    /// `Streams/updatedRelateTo` message posted to the category, if any.
    async fn update_relation(
        &self,
        partition: &Partition,
        request: &RelationRequest,
        adjust_weights: bool,
    ) -> RemoteResult<Option<Message>>;
}
