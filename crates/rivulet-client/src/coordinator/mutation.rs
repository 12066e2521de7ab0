//! Writes: posting, joining, creating, saving, closing and relating.
//!
//! The server's answer is authoritative. Posted messages go through the same
//! ordered delivery as pushed ones, so a post and its push echo are
//! processed once.

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use rivulet_net::{CreatedStream, NewMessage, NewStream, RelationRequest, RemoteResult};
use rivulet_shared::error::StreamsError;
use rivulet_shared::models::{Message, Participant, StreamFields};
use rivulet_shared::protocol::{StreamBundle, StreamQuery};
use rivulet_shared::types::StreamKey;

use super::{Core, Internal, RefreshDone, RefreshOptions, Reply, Work};
use crate::registry::RetainKey;
use crate::stream::{self, SharedStream, Stream};

/// A newly created stream.
#[derive(Debug, Clone)]
pub struct Created {
    pub stream: SharedStream,
    /// The relation message posted to the category, when created related.
    pub message_to: Option<Message>,
}

impl Core {
    pub(super) fn post_message(
        &mut self,
        key: StreamKey,
        message: NewMessage,
        reply: Reply<Message>,
    ) {
        let partition = self.router.for_publisher(&key.publisher_id);
        let remote = self.remote.clone();
        let epoch = self.epoch;
        debug!(stream = %key, message_type = %message.message_type, "Posting message");
        self.spawn_call(async move {
            let result = remote.post_message(&partition, &key, &message).await;
            Internal::Posted {
                epoch,
                result,
                reply,
            }
        });
    }

    pub(super) fn on_posted(
        &mut self,
        epoch: u64,
        result: RemoteResult<Message>,
        reply: Reply<Message>,
    ) {
        match &result {
            Ok(message) if epoch == self.epoch => {
                self.work.push_back(Work::Post(message.clone()));
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Posting message failed"),
        }
        let _ = reply.send(result);
    }

    pub(super) fn participate(&mut self, key: StreamKey, join: bool, reply: Reply<Participant>) {
        let partition = self.router.for_publisher(&key.publisher_id);
        let remote = self.remote.clone();
        let epoch = self.epoch;
        self.spawn_call(async move {
            let result = if join {
                remote.join(&partition, &key).await
            } else {
                remote.leave(&partition, &key).await
            };
            Internal::Participated {
                epoch,
                result,
                reply,
            }
        });
    }

    /// Send the draft changes of a cached stream. With nothing to send the
    /// draft is simply dropped.
    pub(super) fn save(&mut self, key: StreamKey, reply: Reply<SharedStream>) {
        let Some(instance) = self.instance(&key) else {
            let _ = reply.send(Err(StreamsError::NotFound(key.to_string())));
            return;
        };
        let changes = stream::read(&instance).draft_changes();
        let Some(changes) = changes.filter(|c| !c.is_empty()) else {
            debug!(stream = %key, "Nothing to save");
            stream::write(&instance).discard_draft();
            let _ = reply.send(Ok(instance));
            return;
        };

        let partition = self.router.for_publisher(&key.publisher_id);
        let remote = self.remote.clone();
        let epoch = self.epoch;
        self.spawn_call(async move {
            let result = remote.save_stream(&partition, &key, &changes).await;
            Internal::StreamSaved {
                epoch,
                key,
                saved: true,
                result,
                reply,
            }
        });
    }

    pub(super) fn close(&mut self, key: StreamKey, reply: Reply<SharedStream>) {
        let partition = self.router.for_publisher(&key.publisher_id);
        let remote = self.remote.clone();
        let epoch = self.epoch;
        self.spawn_call(async move {
            let result = remote.close_stream(&partition, &key).await;
            Internal::StreamSaved {
                epoch,
                key,
                saved: false,
                result,
                reply,
            }
        });
    }

    /// Clear `closedTime` on the server. Any pending draft is left alone.
    pub(super) fn reopen(&mut self, key: StreamKey, reply: Reply<SharedStream>) {
        let mut changes = Map::new();
        changes.insert("closedTime".to_string(), Value::Null);

        let partition = self.router.for_publisher(&key.publisher_id);
        let remote = self.remote.clone();
        let epoch = self.epoch;
        self.spawn_call(async move {
            let result = remote.save_stream(&partition, &key, &changes).await;
            Internal::StreamSaved {
                epoch,
                key,
                saved: false,
                result,
                reply,
            }
        });
    }

    pub(super) fn on_stream_saved(
        &mut self,
        epoch: u64,
        key: StreamKey,
        saved: bool,
        result: RemoteResult<StreamFields>,
        reply: Reply<SharedStream>,
    ) {
        let fields = match result {
            Ok(fields) => fields,
            Err(e) => {
                warn!(stream = %key, error = %e, "Saving stream failed");
                self.hub.fire_error(&e, format!("saving {key}"));
                let _ = reply.send(Err(e));
                return;
            }
        };

        let current = if epoch == self.epoch {
            self.instance(&key)
        } else {
            None
        };
        let Some(instance) = current else {
            let _ = reply.send(Ok(Stream::shared(fields)));
            return;
        };

        self.persist_stream(&fields);
        let diff = {
            let mut s = stream::write(&instance);
            let diff = s.update(fields, &[]);
            if saved {
                s.discard_draft();
            }
            diff
        };
        self.hub.fire_diff(&instance, &diff);
        let _ = reply.send(Ok(instance));
    }

    pub(super) fn relate(&mut self, request: RelationRequest, add: bool, reply: Reply<()>) {
        let partition = self.router.for_publisher(&request.to.publisher_id);
        let remote = self.remote.clone();
        let epoch = self.epoch;
        debug!(
            to = %request.to,
            from = %request.from,
            relation_type = %request.relation_type,
            add,
            "Updating relation"
        );
        self.spawn_call(async move {
            let result = if add {
                remote.relate(&partition, &request).await
            } else {
                remote.unrelate(&partition, &request).await
            };
            Internal::RelationDone {
                epoch,
                request,
                result,
                reply,
            }
        });
    }

    pub(super) fn update_relation(
        &mut self,
        request: RelationRequest,
        adjust_weights: bool,
        reply: Reply<()>,
    ) {
        let partition = self.router.for_publisher(&request.to.publisher_id);
        let remote = self.remote.clone();
        let epoch = self.epoch;
        debug!(
            to = %request.to,
            from = %request.from,
            weight = ?request.weight,
            "Updating relation weight"
        );
        self.spawn_call(async move {
            let result = remote
                .update_relation(&partition, &request, adjust_weights)
                .await;
            Internal::RelationUpdated {
                epoch,
                request,
                result,
                reply,
            }
        });
    }

    pub(super) fn on_relation_updated(
        &mut self,
        epoch: u64,
        request: RelationRequest,
        result: RemoteResult<Option<Message>>,
        reply: Reply<()>,
    ) {
        match result {
            Ok(message) => {
                if epoch == self.epoch {
                    self.caches.invalidate_related(&request.to);
                    self.caches.invalidate_related(&request.from);
                    if let Some(message) = message {
                        self.work.push_back(Work::Post(message));
                    }
                }
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                warn!(to = %request.to, error = %e, "Updating relation failed");
                let _ = reply.send(Err(e));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Create
    // -----------------------------------------------------------------------

    pub(super) fn create(
        &mut self,
        request: NewStream,
        retain: Option<RetainKey>,
        reply: Reply<Created>,
    ) {
        let partition = self.router.for_publisher(&request.publisher_id);
        let remote = self.remote.clone();
        let epoch = self.epoch;
        debug!(
            publisher = %request.publisher_id,
            stream_type = %request.stream_type,
            "Creating stream"
        );
        self.spawn_call(async move {
            let result = remote.create_stream(&partition, &request).await;
            Internal::StreamCreated {
                epoch,
                request,
                retain,
                result,
                reply,
            }
        });
    }

    pub(super) fn on_stream_created(
        &mut self,
        epoch: u64,
        request: NewStream,
        retain: Option<RetainKey>,
        result: RemoteResult<CreatedStream>,
        reply: Reply<Created>,
    ) {
        let CreatedStream { stream, message_to } = match result {
            Ok(created) => created,
            Err(e) => {
                warn!(publisher = %request.publisher_id, error = %e, "Creating stream failed");
                self.hub
                    .fire_error(&e, format!("creating a {} stream", request.stream_type));
                let _ = reply.send(Err(e));
                return;
            }
        };

        if epoch != self.epoch {
            let _ = reply.send(Ok(Created {
                stream: Stream::shared(stream),
                message_to,
            }));
            return;
        }

        let key = stream.key();
        info!(stream = %key, "Stream created");
        if let Some(related) = &request.related {
            self.caches.invalidate_related(&related.to);
        }
        let bundle = StreamBundle {
            stream,
            messages: Vec::new(),
            participants: Vec::new(),
        };
        let instance = self.adopt_stream(&StreamQuery::plain(key.clone()), bundle, &[]);
        if let Some(retain) = retain {
            self.registry.retain(key, retain, Some(instance.clone()));
        }
        self.caches.participating.clear();

        let _ = reply.send(Ok(Created {
            stream: instance,
            message_to,
        }));

        if let Some(related) = request.related {
            let options = RefreshOptions {
                messages: true,
                unless_socket: true,
                ..RefreshOptions::default()
            };
            self.refresh_stream(related.to, options, RefreshDone::Silent);
        }
    }
}
