//! Payloads exchanged between live sessions, the broadcast channel, and the
//! transport.

use alive_sync_core::{FieldKey, Fields, RecordId, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Broadcast action names, as they appear in the `action` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// A session took a field lock
    LockAcquired,
    /// A field lock was released
    LockReleased,
    /// A field received a new committed value
    ContentChanged,
    /// A record was added to the collection
    RecordCreated,
    /// A record was removed from the collection
    RecordDeleted,
    /// The display order changed
    OrderChanged,
}

impl Action {
    /// Wire name of the action.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::LockAcquired => "lock_acquired",
            Action::LockReleased => "lock_released",
            Action::ContentChanged => "content_changed",
            Action::RecordCreated => "record_created",
            Action::RecordDeleted => "record_deleted",
            Action::OrderChanged => "order_changed",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change notification fanned out to every session of a collection.
///
/// Serialized flat, tagged by `action`:
/// `{"action": "content_changed", "record_id": 5, "field": "title", "value": "Pasta"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BroadcastEvent {
    /// `holder` now owns the lock on `(record_id, field)`
    LockAcquired {
        /// Locked record
        record_id: RecordId,
        /// Locked field
        field: String,
        /// New lock holder
        holder: SessionId,
    },
    /// `holder` no longer owns the lock on `(record_id, field)`
    LockReleased {
        /// Unlocked record
        record_id: RecordId,
        /// Unlocked field
        field: String,
        /// Former lock holder
        holder: SessionId,
    },
    /// `(record_id, field)` now holds `value`
    ContentChanged {
        /// Changed record
        record_id: RecordId,
        /// Changed field
        field: String,
        /// Committed value
        value: Value,
        /// Session that committed the value; `None` for out-of-band writes
        #[serde(default, skip_serializing_if = "Option::is_none")]
        holder: Option<SessionId>,
    },
    /// A record was appended to the collection
    RecordCreated {
        /// New record
        record_id: RecordId,
        /// Full display order after the insert
        order: Vec<RecordId>,
    },
    /// A record was removed from the collection
    RecordDeleted {
        /// Removed record
        record_id: RecordId,
        /// Full display order after the removal
        order: Vec<RecordId>,
    },
    /// The collection was reordered; `order` is authoritative
    OrderChanged {
        /// Full display order
        order: Vec<RecordId>,
    },
}

impl BroadcastEvent {
    /// Action tag of this event.
    #[must_use]
    pub fn action(&self) -> Action {
        match self {
            BroadcastEvent::LockAcquired { .. } => Action::LockAcquired,
            BroadcastEvent::LockReleased { .. } => Action::LockReleased,
            BroadcastEvent::ContentChanged { .. } => Action::ContentChanged,
            BroadcastEvent::RecordCreated { .. } => Action::RecordCreated,
            BroadcastEvent::RecordDeleted { .. } => Action::RecordDeleted,
            BroadcastEvent::OrderChanged { .. } => Action::OrderChanged,
        }
    }

    /// Record the event refers to, if any.
    #[must_use]
    pub fn record_id(&self) -> Option<RecordId> {
        match self {
            BroadcastEvent::LockAcquired { record_id, .. }
            | BroadcastEvent::LockReleased { record_id, .. }
            | BroadcastEvent::ContentChanged { record_id, .. }
            | BroadcastEvent::RecordCreated { record_id, .. }
            | BroadcastEvent::RecordDeleted { record_id, .. } => Some(*record_id),
            BroadcastEvent::OrderChanged { .. } => None,
        }
    }

    /// Field the event refers to, for field-level events.
    #[must_use]
    pub fn field_key(&self) -> Option<FieldKey> {
        match self {
            BroadcastEvent::LockAcquired {
                record_id, field, ..
            }
            | BroadcastEvent::LockReleased {
                record_id, field, ..
            }
            | BroadcastEvent::ContentChanged {
                record_id, field, ..
            } => Some(FieldKey::new(*record_id, field.clone())),
            _ => None,
        }
    }
}

/// A broadcast event as delivered on a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Topic the event was published on
    pub topic: String,
    /// Per-topic publish sequence number, starting at 1
    pub seq: u64,
    /// Publish time
    pub emitted_at: DateTime<Utc>,
    /// The event itself
    pub event: BroadcastEvent,
}

impl Envelope {
    /// Wrap `event` for publication on `topic`.
    #[must_use]
    pub fn new(topic: impl Into<String>, seq: u64, event: BroadcastEvent) -> Self {
        Self {
            topic: topic.into(),
            seq,
            emitted_at: Utc::now(),
            event,
        }
    }

    /// Serialize to JSON for a transport push.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(|e| MessageError::Serialize(e.to_string()))
    }

    /// Deserialize from JSON.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_json(text: &str) -> Result<Self, MessageError> {
        serde_json::from_str(text).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// An inbound user action, as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientAction {
    /// Begin editing a field
    StartEdit {
        /// Target record
        record_id: RecordId,
        /// Target field
        field: String,
    },
    /// Replace the local edit buffer
    UpdateDraft {
        /// Target record
        record_id: RecordId,
        /// Target field
        field: String,
        /// New draft value
        value: Value,
    },
    /// Commit the edit buffer
    SaveEdit {
        /// Target record
        record_id: RecordId,
        /// Target field
        field: String,
    },
    /// Abandon the edit buffer
    CancelEdit {
        /// Target record
        record_id: RecordId,
        /// Target field
        field: String,
    },
    /// Replace the edit buffer with a conflicting out-of-band value
    AcceptExternal {
        /// Target record
        record_id: RecordId,
        /// Target field
        field: String,
    },
    /// Move a record to an absolute position
    ReorderToPosition {
        /// Record to move
        record_id: RecordId,
        /// Target position; clamped into range
        position: i64,
    },
    /// Move a record up (negative) or down (positive)
    MoveItem {
        /// Record to move
        record_id: RecordId,
        /// Number of positions to move by
        direction: i64,
    },
    /// Create a record
    CreateItem {
        /// Initial field values
        #[serde(default)]
        fields: Fields,
    },
    /// Delete a record
    DeleteItem {
        /// Record to delete
        record_id: RecordId,
    },
}

impl ClientAction {
    /// Decode a named transport event with a loosely typed payload.
    ///
    /// Browsers send form data, so ids may arrive as strings, under
    /// `record_id`, `item_id` or `card_id`, and draft values may arrive
    /// wrapped in a single-element list.
    ///
    /// # Errors
    ///
    /// Returns error if the event name is unknown or a required key is
    /// missing or malformed.
    pub fn from_event(name: &str, payload: &serde_json::Map<String, Value>) -> Result<Self, MessageError> {
        let action = match name {
            "start_edit" => ClientAction::StartEdit {
                record_id: payload_record_id(payload)?,
                field: payload_string(payload, "field")?,
            },
            "update_draft" => ClientAction::UpdateDraft {
                record_id: payload_record_id(payload)?,
                field: payload_string(payload, "field")?,
                value: payload_value(payload),
            },
            "save_edit" => ClientAction::SaveEdit {
                record_id: payload_record_id(payload)?,
                field: payload_string(payload, "field")?,
            },
            "cancel_edit" => ClientAction::CancelEdit {
                record_id: payload_record_id(payload)?,
                field: payload_string(payload, "field")?,
            },
            "accept_external" => ClientAction::AcceptExternal {
                record_id: payload_record_id(payload)?,
                field: payload_string(payload, "field")?,
            },
            "reorder_to_position" => ClientAction::ReorderToPosition {
                record_id: payload_record_id(payload)?,
                position: payload_int(payload, "position")?,
            },
            "move_item" => ClientAction::MoveItem {
                record_id: payload_record_id(payload)?,
                direction: payload_int(payload, "direction")?,
            },
            "create_item" => ClientAction::CreateItem {
                fields: match payload.get("fields") {
                    Some(Value::Object(fields)) => fields.clone(),
                    Some(_) => return Err(MessageError::InvalidField("fields".to_string())),
                    None => payload.clone(),
                },
            },
            "delete_item" => ClientAction::DeleteItem {
                record_id: payload_record_id(payload)?,
            },
            other => return Err(MessageError::UnknownEvent(other.to_string())),
        };
        Ok(action)
    }
}

fn payload_record_id(payload: &serde_json::Map<String, Value>) -> Result<RecordId, MessageError> {
    let raw = ["record_id", "item_id", "card_id"]
        .iter()
        .find_map(|key| payload.get(*key))
        .ok_or_else(|| MessageError::MissingField("record_id".to_string()))?;

    let parsed = match unwrap_single(raw) {
        Value::Number(n) => n.as_u64().map(RecordId),
        Value::String(s) => s.parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| MessageError::InvalidField("record_id".to_string()))
}

fn payload_string(payload: &serde_json::Map<String, Value>, key: &str) -> Result<String, MessageError> {
    match payload.get(key).map(unwrap_single) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(MessageError::InvalidField(key.to_string())),
        None => Err(MessageError::MissingField(key.to_string())),
    }
}

fn payload_int(payload: &serde_json::Map<String, Value>, key: &str) -> Result<i64, MessageError> {
    match payload.get(key).map(unwrap_single) {
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| MessageError::InvalidField(key.to_string())),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| MessageError::InvalidField(key.to_string())),
        Some(_) => Err(MessageError::InvalidField(key.to_string())),
        None => Ok(0),
    }
}

fn payload_value(payload: &serde_json::Map<String, Value>) -> Value {
    payload
        .get("value")
        .map_or(Value::String(String::new()), |v| unwrap_single(v).clone())
}

fn unwrap_single(value: &Value) -> &Value {
    match value {
        Value::Array(items) if items.len() == 1 => &items[0],
        other => other,
    }
}

/// An out-of-band change to a record, made outside any live session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExternalChange {
    /// A single field was written
    FieldUpdated {
        /// Changed record
        record_id: RecordId,
        /// Changed field
        field: String,
        /// New value
        value: Value,
    },
    /// A record was rewritten directly in storage; no values are carried
    RecordUpdated {
        /// Rewritten record
        record_id: RecordId,
    },
    /// A record was inserted directly into storage
    RecordCreated {
        /// New record
        record_id: RecordId,
    },
    /// A record was removed directly from storage
    RecordDeleted {
        /// Removed record
        record_id: RecordId,
    },
}

impl ExternalChange {
    /// Record the change refers to.
    #[must_use]
    pub fn record_id(&self) -> RecordId {
        match self {
            ExternalChange::FieldUpdated { record_id, .. }
            | ExternalChange::RecordUpdated { record_id }
            | ExternalChange::RecordCreated { record_id }
            | ExternalChange::RecordDeleted { record_id } => *record_id,
        }
    }
}

/// Errors for message encoding and decoding.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    /// Event name is not a known client action
    #[error("unknown event: {0}")]
    UnknownEvent(String),
    /// Payload lacks a required key
    #[error("missing payload field: {0}")]
    MissingField(String),
    /// Payload key has the wrong shape
    #[error("invalid payload field: {0}")]
    InvalidField(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> serde_json::Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("payload must be an object"),
        }
    }

    #[test]
    fn broadcast_event_wire_shape() {
        let event = BroadcastEvent::ContentChanged {
            record_id: RecordId(5),
            field: "title".to_string(),
            value: json!("Pasta"),
            holder: None,
        };

        let encoded = serde_json::to_value(&event).unwrap();
        assert_eq!(
            encoded,
            json!({"action": "content_changed", "record_id": 5, "field": "title", "value": "Pasta"})
        );
        assert_eq!(event.action().as_str(), "content_changed");
        assert_eq!(event.field_key(), Some(FieldKey::new(RecordId(5), "title")));
    }

    #[test]
    fn order_changed_carries_full_sequence() {
        let event: BroadcastEvent =
            serde_json::from_value(json!({"action": "order_changed", "order": [3, 1, 2]})).unwrap();
        assert_eq!(
            event,
            BroadcastEvent::OrderChanged {
                order: vec![RecordId(3), RecordId(1), RecordId(2)]
            }
        );
        assert_eq!(event.record_id(), None);
        assert_eq!(event.field_key(), None);
    }

    #[test]
    fn envelope_json_roundtrip() {
        let holder = SessionId::new();
        let envelope = Envelope::new(
            "alive:cards",
            7,
            BroadcastEvent::LockAcquired {
                record_id: RecordId(1),
                field: "title".to_string(),
                holder,
            },
        );

        let decoded = Envelope::from_json(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn client_action_accepts_form_payloads() {
        let action = ClientAction::from_event(
            "update_draft",
            &payload(json!({"card_id": "12", "field": "title", "value": ["Pasta"]})),
        )
        .unwrap();
        assert_eq!(
            action,
            ClientAction::UpdateDraft {
                record_id: RecordId(12),
                field: "title".to_string(),
                value: json!("Pasta"),
            }
        );

        let action = ClientAction::from_event(
            "reorder_to_position",
            &payload(json!({"item_id": 4, "position": "0"})),
        )
        .unwrap();
        assert_eq!(
            action,
            ClientAction::ReorderToPosition {
                record_id: RecordId(4),
                position: 0
            }
        );
    }

    #[test]
    fn client_action_rejects_bad_payloads() {
        let err = ClientAction::from_event("start_edit", &payload(json!({"field": "title"})))
            .unwrap_err();
        assert!(matches!(err, MessageError::MissingField(_)));

        let err = ClientAction::from_event("start_edit", &payload(json!({"record_id": "abc", "field": "title"})))
            .unwrap_err();
        assert!(matches!(err, MessageError::InvalidField(_)));

        let err = ClientAction::from_event("explode", &serde_json::Map::new()).unwrap_err();
        assert!(matches!(err, MessageError::UnknownEvent(_)));
    }

    #[test]
    fn create_item_uses_bare_payload_as_fields() {
        let action =
            ClientAction::from_event("create_item", &payload(json!({"title": "New"}))).unwrap();
        let ClientAction::CreateItem { fields } = action else {
            panic!("expected create");
        };
        assert_eq!(fields.get("title"), Some(&json!("New")));
    }

    #[test]
    fn external_change_tagged_by_kind() {
        let change: ExternalChange = serde_json::from_value(
            json!({"kind": "field_updated", "record_id": 3, "field": "title", "value": "Admin"}),
        )
        .unwrap();
        assert_eq!(change.record_id(), RecordId(3));
    }
}
