//! Record model shared by every layer.
//!
//! A record is owned by the storage collaborator. Live sessions only ever
//! hold a working copy of its fields.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Field values of a record, keyed by field name.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Identifier of a record within its collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl From<u64> for RecordId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Identity of a connected session; the holder of edit locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a fresh random session identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of a single field of a single record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldKey {
    /// Record the field belongs to
    pub record_id: RecordId,
    /// Field name
    pub field: String,
}

impl FieldKey {
    /// Create a new field key.
    #[must_use]
    pub fn new(record_id: RecordId, field: impl Into<String>) -> Self {
        Self {
            record_id,
            field: field.into(),
        }
    }
}

impl std::fmt::Display for FieldKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.record_id, self.field)
    }
}

/// A record as returned by the storage collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record identifier
    pub id: RecordId,
    /// Field values
    pub fields: Fields,
}

impl Record {
    /// Create a record from its parts.
    #[must_use]
    pub fn new(id: RecordId, fields: Fields) -> Self {
        Self { id, fields }
    }

    /// Value of `field`, or `Null` when the record has no such field.
    #[must_use]
    pub fn value(&self, field: &str) -> serde_json::Value {
        self.fields
            .get(field)
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_id_parse_and_display() {
        let id: RecordId = " 42 ".parse().unwrap();
        assert_eq!(id, RecordId(42));
        assert_eq!(id.to_string(), "42");
        assert!("card-1".parse::<RecordId>().is_err());
    }

    #[test]
    fn field_key_display() {
        let key = FieldKey::new(RecordId(5), "title");
        assert_eq!(key.to_string(), "5:title");
    }

    #[test]
    fn missing_field_reads_as_null() {
        let mut fields = Fields::new();
        fields.insert("title".into(), json!("Soup"));
        let record = Record::new(RecordId(1), fields);

        assert_eq!(record.value("title"), json!("Soup"));
        assert_eq!(record.value("content"), serde_json::Value::Null);
    }

    #[test]
    fn session_id_serializes_as_bare_uuid() {
        let id = SessionId::new();
        let encoded = serde_json::to_value(id).unwrap();
        assert_eq!(encoded, json!(id.0.to_string()));
    }
}
