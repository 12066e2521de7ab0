//! [`RemoteApi`] over JSON HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use rivulet_shared::error::StreamsError;
use rivulet_shared::models::{Message, Participant, StreamFields};
use rivulet_shared::protocol::{
    BatchItem, BatchRequest, BatchResponse, BatchSlot, RelatedQuery, RelatedResult,
};
use rivulet_shared::types::{StreamKey, UserId};

use crate::partition::Partition;
use crate::remote::{
    CreatedStream, NewMessage, NewStream, ParticipatingQuery, RelationRequest, RemoteApi,
    RemoteResult,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
}

impl HttpRemote {
    pub fn new() -> RemoteResult<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> RemoteResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StreamsError::Network(e.to_string()))?;
        Ok(Self { client })
    }

    async fn post<B, R>(&self, partition: &Partition, path: &str, body: &B) -> RemoteResult<R>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let url = partition.url(path);
        debug!(url = %url, "POST");

        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| StreamsError::Network(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StreamsError::NotFound(url));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(url = %url, status = %status, "Streams service returned an error");
            return Err(StreamsError::Remote(format!("{status}: {text}")));
        }

        resp.json::<R>()
            .await
            .map_err(|e| StreamsError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn batch(
        &self,
        partition: &Partition,
        items: Vec<BatchItem>,
    ) -> RemoteResult<Vec<BatchSlot>> {
        let expected = items.len();
        let request = BatchRequest { batch: items };
        let response: BatchResponse = self.post(partition, "batch", &request).await?;
        if response.batch.len() != expected {
            return Err(StreamsError::Decode(format!(
                "batch returned {} slots for {} items",
                response.batch.len(),
                expected
            )));
        }
        Ok(response.batch)
    }

    async fn related(
        &self,
        partition: &Partition,
        query: &RelatedQuery,
    ) -> RemoteResult<RelatedResult> {
        self.post(partition, "related", query).await
    }

    async fn participating(
        &self,
        partition: &Partition,
        user: &UserId,
        query: &ParticipatingQuery,
    ) -> RemoteResult<Vec<Participant>> {
        let body = json!({ "userId": user, "query": query });
        self.post(partition, "participating", &body).await
    }

    async fn post_message(
        &self,
        partition: &Partition,
        key: &StreamKey,
        message: &NewMessage,
    ) -> RemoteResult<Message> {
        let body = json!({ "key": key, "message": message });
        self.post(partition, "message", &body).await
    }

    async fn join(&self, partition: &Partition, key: &StreamKey) -> RemoteResult<Participant> {
        self.post(partition, "participant/join", &json!({ "key": key }))
            .await
    }

    async fn leave(&self, partition: &Partition, key: &StreamKey) -> RemoteResult<Participant> {
        self.post(partition, "participant/leave", &json!({ "key": key }))
            .await
    }

    async fn save_stream(
        &self,
        partition: &Partition,
        key: &StreamKey,
        changes: &Map<String, Value>,
    ) -> RemoteResult<StreamFields> {
        let body = json!({ "key": key, "changes": changes });
        self.post(partition, "stream/save", &body).await
    }

    async fn close_stream(
        &self,
        partition: &Partition,
        key: &StreamKey,
    ) -> RemoteResult<StreamFields> {
        self.post(partition, "stream/close", &json!({ "key": key }))
            .await
    }

    async fn create_stream(
        &self,
        partition: &Partition,
        stream: &NewStream,
    ) -> RemoteResult<CreatedStream> {
        self.post(partition, "stream/create", stream).await
    }

    async fn relate(&self, partition: &Partition, request: &RelationRequest) -> RemoteResult<()> {
        let _: Value = self.post(partition, "relation/add", request).await?;
        Ok(())
    }

    async fn unrelate(
        &self,
        partition: &Partition,
        request: &RelationRequest,
    ) -> RemoteResult<()> {
        let _: Value = self.post(partition, "relation/remove", request).await?;
        Ok(())
    }

    async fn update_relation(
        &self,
        partition: &Partition,
        request: &RelationRequest,
        adjust_weights: bool,
    ) -> RemoteResult<Option<Message>> {
        let body = json!({ "relation": request, "adjustWeights": adjust_weights });
        self.post(partition, "relation/update", &body).await
    }
}
