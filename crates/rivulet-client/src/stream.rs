//! The stream entity as held by the coordinator.
//!
//! One [`Stream`] exists per [`StreamKey`] and is shared as a
//! [`SharedStream`]; refreshes and push notifications update it in place so
//! every holder sees the new state. Attribute and permission edits go to a
//! draft until the stream is saved.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::{Map, Value};

use rivulet_shared::levels::{AdminLevel, ReadLevel, WriteLevel};
use rivulet_shared::models::{parse_json_object, Participant, StreamFields};
use rivulet_shared::types::{Ordinal, StreamKey};

pub type SharedStream = Arc<RwLock<Stream>>;

/// Read a shared stream, recovering the data if a handler panicked while
/// holding the lock.
pub fn read(stream: &SharedStream) -> RwLockReadGuard<'_, Stream> {
    stream.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn write(stream: &SharedStream) -> RwLockWriteGuard<'_, Stream> {
    stream.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, PartialEq)]
struct Draft {
    attributes: Map<String, Value>,
    permissions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Stream {
    key: StreamKey,
    fields: StreamFields,
    attributes: Map<String, Value>,
    draft: Option<Draft>,
}

/// What changed when server fields were applied to a stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamDiff {
    /// Changed row fields and their new values, in field-name order.
    pub fields: Vec<(String, Value)>,
    /// Attributes whose value changed or that were added.
    pub updated: Map<String, Value>,
    /// Attributes that disappeared.
    pub cleared: Vec<String>,
}

impl StreamDiff {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.updated.is_empty() && self.cleared.is_empty()
    }
}

impl Stream {
    pub fn new(fields: StreamFields) -> Self {
        let attributes = parse_json_object(&fields.attributes);
        Self {
            key: fields.key(),
            fields,
            attributes,
            draft: None,
        }
    }

    pub fn shared(fields: StreamFields) -> SharedStream {
        Arc::new(RwLock::new(Self::new(fields)))
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn fields(&self) -> &StreamFields {
        &self.fields
    }

    pub fn stream_type(&self) -> &str {
        &self.fields.stream_type
    }

    pub fn message_count(&self) -> Ordinal {
        self.fields.message_count
    }

    pub fn is_closed(&self) -> bool {
        self.fields.closed_time.is_some()
    }

    pub fn participant(&self) -> Option<&Participant> {
        self.fields.participant.as_ref()
    }

    // -----------------------------------------------------------------------
    // Attributes
    // -----------------------------------------------------------------------

    /// Current attribute value, draft first.
    pub fn get_attribute(&self, name: &str) -> Option<&Value> {
        self.attributes().get(name)
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        match &self.draft {
            Some(draft) => &draft.attributes,
            None => &self.attributes,
        }
    }

    /// Attributes as last confirmed by the server.
    pub fn committed_attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: Value) {
        self.draft_mut().attributes.insert(name.into(), value);
    }

    pub fn clear_attribute(&mut self, name: &str) {
        self.draft_mut().attributes.remove(name);
    }

    // -----------------------------------------------------------------------
    // Permissions
    // -----------------------------------------------------------------------

    pub fn permissions(&self) -> Vec<String> {
        match &self.draft {
            Some(draft) => draft.permissions.clone(),
            None => self.committed_permissions(),
        }
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions().iter().any(|p| p == permission)
    }

    pub fn add_permission(&mut self, permission: impl Into<String>) {
        let permission = permission.into();
        let draft = self.draft_mut();
        if !draft.permissions.contains(&permission) {
            draft.permissions.push(permission);
        }
    }

    pub fn remove_permission(&mut self, permission: &str) {
        self.draft_mut().permissions.retain(|p| p != permission);
    }

    fn committed_permissions(&self) -> Vec<String> {
        self.fields
            .permissions
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Draft lifecycle
    // -----------------------------------------------------------------------

    fn draft_mut(&mut self) -> &mut Draft {
        let draft = match self.draft.take() {
            Some(draft) => draft,
            None => Draft {
                attributes: self.attributes.clone(),
                permissions: self.committed_permissions(),
            },
        };
        self.draft.insert(draft)
    }

    pub fn has_draft(&self) -> bool {
        self.draft.is_some()
    }

    /// Field changes a save would send, or `None` without a draft.
    pub fn draft_changes(&self) -> Option<Map<String, Value>> {
        let draft = self.draft.as_ref()?;
        let mut changes = Map::new();
        if draft.attributes != self.attributes {
            changes.insert(
                "attributes".to_string(),
                Value::String(Value::Object(draft.attributes.clone()).to_string()),
            );
        }
        if draft.permissions != self.committed_permissions() {
            let list = serde_json::to_string(&draft.permissions).unwrap_or_else(|_| "[]".into());
            changes.insert("permissions".to_string(), Value::String(list));
        }
        Some(changes)
    }

    /// Promote the draft to committed state.
    pub fn commit_draft(&mut self) {
        if let Some(draft) = self.draft.take() {
            self.fields.attributes = Value::Object(draft.attributes.clone()).to_string();
            self.fields.permissions = serde_json::to_string(&draft.permissions).ok();
            self.attributes = draft.attributes;
        }
    }

    pub fn discard_draft(&mut self) {
        self.draft = None;
    }

    // -----------------------------------------------------------------------
    // Access
    // -----------------------------------------------------------------------

    pub fn test_read_level(&self, level: ReadLevel) -> bool {
        self.fields
            .access
            .map(|a| a.read_level >= level)
            .unwrap_or(level == ReadLevel::None)
    }

    pub fn test_write_level(&self, level: WriteLevel) -> bool {
        self.fields
            .access
            .map(|a| a.write_level >= level)
            .unwrap_or(level == WriteLevel::None)
    }

    pub fn test_admin_level(&self, level: AdminLevel) -> bool {
        self.fields
            .access
            .map(|a| a.admin_level >= level)
            .unwrap_or(level == AdminLevel::None)
    }

    // -----------------------------------------------------------------------
    // Server-driven updates
    // -----------------------------------------------------------------------

    pub(crate) fn set_message_count(&mut self, ordinal: Ordinal) {
        if ordinal > self.fields.message_count {
            self.fields.message_count = ordinal;
        }
    }

    pub(crate) fn set_participant(&mut self, participant: Participant) {
        self.fields.participant = Some(participant);
    }

    pub(crate) fn adjust_counts(&mut self, joined: bool, prev_state: Option<&str>) {
        let f = &mut self.fields;
        match prev_state {
            Some("invited") => f.invited_count = f.invited_count.saturating_sub(1),
            Some("participating") => {
                f.participating_count = f.participating_count.saturating_sub(1)
            }
            Some("left") => f.left_count = f.left_count.saturating_sub(1),
            _ => {}
        }
        if joined {
            f.participating_count += 1;
        } else {
            f.left_count += 1;
        }
    }

    /// Replace the committed fields, reporting what differs. Fields named in
    /// `force` are reported even when unchanged. The draft survives.
    pub fn update(&mut self, mut fields: StreamFields, force: &[String]) -> StreamDiff {
        if fields.access.is_none() {
            fields.access = self.fields.access;
        }
        if fields.participant.is_none() {
            fields.participant = self.fields.participant.take();
        }

        let old = self.fields.field_map();
        let new = fields.field_map();
        let mut diff = StreamDiff::default();

        for (name, value) in &new {
            if old.get(name) != Some(value) || force.iter().any(|f| f == name) {
                diff.fields.push((name.clone(), value.clone()));
            }
        }

        let attributes = parse_json_object(&fields.attributes);
        let forced_attributes = force.iter().any(|f| f == "attributes");
        for name in self.attributes.keys() {
            if !attributes.contains_key(name) {
                diff.cleared.push(name.clone());
            }
        }
        for (name, value) in &attributes {
            if self.attributes.get(name) != Some(value) || forced_attributes {
                diff.updated.insert(name.clone(), value.clone());
            }
        }

        self.fields = fields;
        self.attributes = attributes;
        diff
    }

    /// Apply a partial change set (as carried by `Streams/changed`).
    pub fn apply_changes(
        &mut self,
        changes: &Map<String, Value>,
    ) -> serde_json::Result<StreamDiff> {
        let mut map = match serde_json::to_value(&self.fields)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (name, value) in changes {
            if name == "publisherId" || name == "name" {
                continue;
            }
            map.insert(name.clone(), value.clone());
        }
        let fields: StreamFields = serde_json::from_value(Value::Object(map))?;
        Ok(self.update(fields, &[]))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rivulet_shared::levels::Access;
    use rivulet_shared::types::{PublisherId, StreamName};
    use serde_json::json;

    pub(crate) fn sample_fields(publisher: &str, name: &str) -> StreamFields {
        StreamFields {
            publisher_id: PublisherId::new(publisher).unwrap(),
            name: StreamName::new(name).unwrap(),
            stream_type: "Streams/chat".into(),
            title: "Chat".into(),
            content: String::new(),
            attributes: r#"{"color":"red","size":3}"#.into(),
            icon: String::new(),
            permissions: Some(r#"["read"]"#.into()),
            message_count: 7,
            invited_count: 0,
            participating_count: 2,
            left_count: 0,
            inserted_time: None,
            updated_time: None,
            closed_time: None,
            read_level: ReadLevel::Messages,
            write_level: WriteLevel::Post,
            admin_level: AdminLevel::None,
            inherit_access: None,
            access: Some(Access {
                read_level: ReadLevel::Messages,
                write_level: WriteLevel::Join,
                admin_level: AdminLevel::None,
            }),
            participant: None,
            is_required: None,
        }
    }

    #[test]
    fn test_draft_is_copy_on_write() {
        let mut stream = Stream::new(sample_fields("u1", "chat/1"));
        assert!(!stream.has_draft());

        stream.set_attribute("color", json!("blue"));
        assert!(stream.has_draft());
        assert_eq!(stream.get_attribute("color"), Some(&json!("blue")));
        assert_eq!(stream.committed_attributes().get("color"), Some(&json!("red")));

        stream.discard_draft();
        assert_eq!(stream.get_attribute("color"), Some(&json!("red")));
    }

    #[test]
    fn test_commit_draft() {
        let mut stream = Stream::new(sample_fields("u1", "chat/1"));
        stream.clear_attribute("size");
        stream.add_permission("write");

        let changes = stream.draft_changes().unwrap();
        assert!(changes.contains_key("attributes"));
        assert!(changes.contains_key("permissions"));

        stream.commit_draft();
        assert!(!stream.has_draft());
        assert_eq!(stream.get_attribute("size"), None);
        assert!(stream.has_permission("write"));
        assert!(stream.fields().attributes.contains("color"));
    }

    #[test]
    fn test_update_reports_only_differences() {
        let mut stream = Stream::new(sample_fields("u1", "chat/1"));
        let mut next = sample_fields("u1", "chat/1");
        next.title = "Renamed".into();
        next.attributes = r#"{"color":"red","mood":"ok"}"#.into();

        let diff = stream.update(next, &[]);
        let names: Vec<&str> = diff.fields.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["attributes", "title"]);
        assert_eq!(diff.updated.get("mood"), Some(&json!("ok")));
        assert!(!diff.updated.contains_key("color"));
        assert_eq!(diff.cleared, vec!["size".to_string()]);
    }

    #[test]
    fn test_update_forced_fields() {
        let mut stream = Stream::new(sample_fields("u1", "chat/1"));
        let diff = stream.update(sample_fields("u1", "chat/1"), &["title".to_string()]);
        assert_eq!(diff.fields.len(), 1);
        assert_eq!(diff.fields[0].0, "title");
        assert!(diff.updated.is_empty());
    }

    #[test]
    fn test_update_keeps_access_when_missing() {
        let mut stream = Stream::new(sample_fields("u1", "chat/1"));
        let mut next = sample_fields("u1", "chat/1");
        next.access = None;
        stream.update(next, &[]);
        assert!(stream.test_read_level(ReadLevel::Messages));
        assert!(stream.test_write_level(WriteLevel::Join));
        assert!(!stream.test_write_level(WriteLevel::Post));
        assert!(stream.test_admin_level(AdminLevel::None));
    }

    #[test]
    fn test_apply_changes() {
        let mut stream = Stream::new(sample_fields("u1", "chat/1"));
        let changes = json!({"title": "New", "name": "ignored"});
        let diff = stream
            .apply_changes(changes.as_object().unwrap())
            .unwrap();
        assert_eq!(stream.fields().title, "New");
        assert_eq!(stream.key().stream_name.as_str(), "chat/1");
        assert_eq!(diff.fields, vec![("title".to_string(), json!("New"))]);
    }
}
