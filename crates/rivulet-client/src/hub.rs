//! The coordinator's event dispatchers.

use std::sync::Arc;

use serde_json::{Map, Value};

use rivulet_shared::error::StreamsError;
use rivulet_shared::models::{Message, RelationChange};
use rivulet_shared::types::{PublisherId, StreamKey, StreamName};

use crate::dispatcher::{Dispatcher, Handler, HandlerId};
use crate::stream::SharedStream;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A message delivered in ordinal order.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub stream: SharedStream,
    pub message: Message,
}

#[derive(Debug, Clone)]
pub struct FieldChangedEvent {
    pub stream: SharedStream,
    pub field: String,
    pub value: Value,
}

/// One attribute changed. `updated` and `cleared` describe the whole change
/// set the attribute belonged to.
#[derive(Debug, Clone)]
pub struct AttributeEvent {
    pub stream: SharedStream,
    pub attribute: String,
    /// New value, `None` when the attribute was cleared.
    pub value: Option<Value>,
    pub updated: Map<String, Value>,
    pub cleared: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub stream: SharedStream,
}

#[derive(Debug, Clone)]
pub struct RelationEvent {
    pub stream: SharedStream,
    pub change: RelationChange,
    pub message: Message,
    /// The other end of the relation, from the message instructions.
    pub other: Option<StreamKey>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub error: StreamsError,
    pub context: String,
}

// ---------------------------------------------------------------------------
// Axis keys
// ---------------------------------------------------------------------------

pub type TypeKey = (Option<String>, Option<String>);
pub type StreamAxes = (Option<PublisherId>, Option<StreamName>);
pub type StreamNamedAxes = (Option<PublisherId>, Option<StreamName>, Option<String>);
pub type RelationAxes = (Option<PublisherId>, Option<StreamName>, Option<RelationChange>);

pub fn stream_axes(key: &StreamKey) -> StreamAxes {
    (Some(key.publisher_id.clone()), Some(key.stream_name.clone()))
}

pub fn stream_named_axes(key: &StreamKey, name: &str) -> StreamNamedAxes {
    (
        Some(key.publisher_id.clone()),
        Some(key.stream_name.clone()),
        Some(name.to_string()),
    )
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// A handler registration. `None` on any axis matches every value.
pub enum Subscription {
    /// By (stream type, message type).
    Message(TypeKey, Handler<MessageEvent>),
    /// By (publisher, stream, message type).
    StreamMessage(StreamNamedAxes, Handler<MessageEvent>),
    /// By (publisher, stream, field).
    FieldChanged(StreamNamedAxes, Handler<FieldChangedEvent>),
    /// By (publisher, stream, attribute).
    AttributeUpdated(StreamNamedAxes, Handler<AttributeEvent>),
    Closed(StreamAxes, Handler<StreamEvent>),
    Relation(RelationAxes, Handler<RelationEvent>),
    Construct(StreamAxes, Handler<StreamEvent>),
    /// By stream type.
    ConstructType(Option<String>, Handler<StreamEvent>),
    Refresh(StreamAxes, Handler<StreamEvent>),
    RefreshType(Option<String>, Handler<StreamEvent>),
    Error(Handler<ErrorEvent>),
}

impl Subscription {
    /// `(stream type, message type)` handler.
    pub fn message(
        stream_type: Option<&str>,
        message_type: Option<&str>,
        f: impl Fn(&MessageEvent) + Send + Sync + 'static,
    ) -> Self {
        Subscription::Message(
            (stream_type.map(String::from), message_type.map(String::from)),
            Arc::new(f),
        )
    }

    pub fn stream_message(
        publisher: Option<PublisherId>,
        stream: Option<StreamName>,
        message_type: Option<&str>,
        f: impl Fn(&MessageEvent) + Send + Sync + 'static,
    ) -> Self {
        Subscription::StreamMessage(
            (publisher, stream, message_type.map(String::from)),
            Arc::new(f),
        )
    }

    pub fn field_changed(
        publisher: Option<PublisherId>,
        stream: Option<StreamName>,
        field: Option<&str>,
        f: impl Fn(&FieldChangedEvent) + Send + Sync + 'static,
    ) -> Self {
        Subscription::FieldChanged((publisher, stream, field.map(String::from)), Arc::new(f))
    }

    pub fn attribute_updated(
        publisher: Option<PublisherId>,
        stream: Option<StreamName>,
        attribute: Option<&str>,
        f: impl Fn(&AttributeEvent) + Send + Sync + 'static,
    ) -> Self {
        Subscription::AttributeUpdated(
            (publisher, stream, attribute.map(String::from)),
            Arc::new(f),
        )
    }

    pub fn closed(
        publisher: Option<PublisherId>,
        stream: Option<StreamName>,
        f: impl Fn(&StreamEvent) + Send + Sync + 'static,
    ) -> Self {
        Subscription::Closed((publisher, stream), Arc::new(f))
    }

    pub fn relation(
        publisher: Option<PublisherId>,
        stream: Option<StreamName>,
        change: Option<RelationChange>,
        f: impl Fn(&RelationEvent) + Send + Sync + 'static,
    ) -> Self {
        Subscription::Relation((publisher, stream, change), Arc::new(f))
    }

    pub fn error(f: impl Fn(&ErrorEvent) + Send + Sync + 'static) -> Self {
        Subscription::Error(Arc::new(f))
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct Hub {
    next_id: u64,
    pub message: Dispatcher<TypeKey, MessageEvent>,
    pub stream_message: Dispatcher<StreamNamedAxes, MessageEvent>,
    pub field_changed: Dispatcher<StreamNamedAxes, FieldChangedEvent>,
    pub attribute_updated: Dispatcher<StreamNamedAxes, AttributeEvent>,
    pub closed: Dispatcher<StreamAxes, StreamEvent>,
    pub relation: Dispatcher<RelationAxes, RelationEvent>,
    pub construct: Dispatcher<StreamAxes, StreamEvent>,
    pub construct_type: Dispatcher<(Option<String>,), StreamEvent>,
    pub refresh: Dispatcher<StreamAxes, StreamEvent>,
    pub refresh_type: Dispatcher<(Option<String>,), StreamEvent>,
    pub error: Dispatcher<(), ErrorEvent>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, subscription: Subscription) -> HandlerId {
        self.next_id += 1;
        let id = HandlerId(self.next_id);
        match subscription {
            Subscription::Message(k, h) => self.message.add(id, k, h),
            Subscription::StreamMessage(k, h) => self.stream_message.add(id, k, h),
            Subscription::FieldChanged(k, h) => self.field_changed.add(id, k, h),
            Subscription::AttributeUpdated(k, h) => self.attribute_updated.add(id, k, h),
            Subscription::Closed(k, h) => self.closed.add(id, k, h),
            Subscription::Relation(k, h) => self.relation.add(id, k, h),
            Subscription::Construct(k, h) => self.construct.add(id, k, h),
            Subscription::ConstructType(t, h) => self.construct_type.add(id, (t,), h),
            Subscription::Refresh(k, h) => self.refresh.add(id, k, h),
            Subscription::RefreshType(t, h) => self.refresh_type.add(id, (t,), h),
            Subscription::Error(h) => self.error.add(id, (), h),
        }
        id
    }

    pub fn unsubscribe(&mut self, id: HandlerId) -> bool {
        self.message.remove(id)
            || self.stream_message.remove(id)
            || self.field_changed.remove(id)
            || self.attribute_updated.remove(id)
            || self.closed.remove(id)
            || self.relation.remove(id)
            || self.construct.remove(id)
            || self.construct_type.remove(id)
            || self.refresh.remove(id)
            || self.refresh_type.remove(id)
            || self.error.remove(id)
    }

    // -----------------------------------------------------------------------
    // Firing helpers
    // -----------------------------------------------------------------------

    pub fn fire_message(&self, stream_type: &str, event: &MessageEvent) {
        let message_type = event.message.message_type.clone();
        self.message.dispatch(
            &(Some(stream_type.to_string()), Some(message_type.clone())),
            event,
        );
        self.stream_message
            .dispatch(&stream_named_axes(&event.message.key(), &message_type), event);
    }

    pub fn fire_stream(
        dispatcher: &Dispatcher<StreamAxes, StreamEvent>,
        typed: Option<&Dispatcher<(Option<String>,), StreamEvent>>,
        stream: &SharedStream,
    ) {
        let (key, stream_type) = {
            let s = crate::stream::read(stream);
            (s.key().clone(), s.stream_type().to_string())
        };
        let event = StreamEvent {
            stream: stream.clone(),
        };
        dispatcher.dispatch(&stream_axes(&key), &event);
        if let Some(typed) = typed {
            typed.dispatch(&(Some(stream_type),), &event);
        }
    }

    pub fn fire_construct(&self, stream: &SharedStream) {
        Self::fire_stream(&self.construct, Some(&self.construct_type), stream);
    }

    pub fn fire_refresh(&self, stream: &SharedStream) {
        Self::fire_stream(&self.refresh, Some(&self.refresh_type), stream);
    }

    pub fn fire_closed(&self, stream: &SharedStream) {
        Self::fire_stream(&self.closed, None, stream);
    }

    /// Field and attribute events for an applied diff.
    pub fn fire_diff(&self, stream: &SharedStream, diff: &crate::stream::StreamDiff) {
        if diff.is_empty() {
            return;
        }
        let key = crate::stream::read(stream).key().clone();

        for (field, value) in &diff.fields {
            let event = FieldChangedEvent {
                stream: stream.clone(),
                field: field.clone(),
                value: value.clone(),
            };
            self.field_changed
                .dispatch(&stream_named_axes(&key, field), &event);
        }

        let cleared = diff.cleared.iter().map(|name| (name, None));
        let updated = diff.updated.iter().map(|(name, v)| (name, Some(v.clone())));
        for (name, value) in cleared.chain(updated) {
            let event = AttributeEvent {
                stream: stream.clone(),
                attribute: name.clone(),
                value,
                updated: diff.updated.clone(),
                cleared: diff.cleared.clone(),
            };
            self.attribute_updated
                .dispatch(&stream_named_axes(&key, name), &event);
        }
    }

    pub fn fire_error(&self, error: &StreamsError, context: impl Into<String>) {
        let event = ErrorEvent {
            error: error.clone(),
            context: context.into(),
        };
        self.error.dispatch(&(), &event);
    }
}
