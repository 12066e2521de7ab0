//! Push channel client.
//!
//! One WebSocket per partition. Text frames carry a JSON [`PushEvent`];
//! everything else is ignored. Liveness changes are reported to the sink so
//! the coordinator knows whether listening for ordinals is worthwhile.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as Frame};
use tracing::{debug, info, warn};

use rivulet_shared::error::StreamsError;
use rivulet_shared::protocol::PushEvent;

use crate::partition::Partition;

/// Receives what arrives on a push channel.
#[async_trait]
pub trait PushSink: Send + Sync + 'static {
    async fn connected(&self, partition: &Partition);
    async fn event(&self, partition: &Partition, event: PushEvent);
    async fn disconnected(&self, partition: &Partition);
}

/// Decode one text frame. Malformed frames are dropped with a warning.
pub fn parse_frame(text: &str) -> Option<PushEvent> {
    match PushEvent::from_json(text) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, "Dropping malformed push frame");
            None
        }
    }
}

/// Hold one connection until the server closes it or it fails.
pub async fn run_socket<S: PushSink + ?Sized>(
    partition: &Partition,
    sink: &S,
) -> Result<(), StreamsError> {
    let url = partition.socket_url();
    let (ws, _) = connect_async(url.as_str())
        .await
        .map_err(|e| StreamsError::Network(format!("connect {url}: {e}")))?;

    info!(partition = %partition, "Push channel connected");
    sink.connected(partition).await;

    let (_write, mut read) = ws.split();
    let mut result = Ok(());

    while let Some(frame) = read.next().await {
        match frame {
            Ok(Frame::Text(text)) => {
                if let Some(event) = parse_frame(&text) {
                    sink.event(partition, event).await;
                }
            }
            Ok(Frame::Close(_)) => {
                debug!(partition = %partition, "Push channel closed by server");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                result = Err(StreamsError::Network(e.to_string()));
                break;
            }
        }
    }

    sink.disconnected(partition).await;
    result
}

/// Keep a push channel open in the background, reconnecting after `retry`.
/// Abort the returned handle to stop it.
pub fn spawn_socket(
    partition: Partition,
    sink: Arc<dyn PushSink>,
    retry: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = run_socket(&partition, sink.as_ref()).await {
                warn!(partition = %partition, error = %e, "Push channel failed");
            }
            tokio::time::sleep(retry).await;
        }
    })
}
