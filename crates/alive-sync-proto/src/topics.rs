//! Topic naming.
//!
//! Two schemes live here:
//! - [`TopicScheme`]: in-process broadcast topics, one per collection,
//!   `{prefix}:{collection}` (e.g. `alive:cards`).
//! - [`BridgeTopicScheme`]: MQTT topics carrying out-of-band changes,
//!   `{prefix}/v1/{collection}/{record_id}/{field}/updated` plus record-level
//!   `updated`, `created` and `deleted`. Segments are percent-encoded so that field names
//!   containing `/`, `+` or `#` cannot break the topic structure.

use alive_sync_core::RecordId;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};

/// Protocol version for bridge topics.
pub const PROTOCOL_VERSION: &str = "v1";

/// Characters escaped inside a single MQTT topic segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'/')
    .add(b'%')
    .add(b'+')
    .add(b'#');

/// Naming of in-process broadcast topics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicScheme {
    /// Topic prefix (default: "alive")
    pub prefix: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self {
            prefix: "alive".to_string(),
        }
    }
}

impl TopicScheme {
    /// Create a scheme with the given prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Broadcast topic for a collection.
    #[must_use]
    pub fn collection(&self, collection: &str) -> String {
        format!("{}:{}", self.prefix, collection)
    }

    /// Collection name of a broadcast topic produced by this scheme.
    #[must_use]
    pub fn parse<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
            .filter(|collection| !collection.is_empty())
    }
}

/// What a bridge topic announces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeTopicKind {
    /// A field was written; the payload is the new value
    FieldUpdated {
        /// Field name
        field: String,
    },
    /// A record was rewritten; its fields must be re-read
    RecordUpdated,
    /// A record was created
    RecordCreated,
    /// A record was deleted
    RecordDeleted,
}

/// A parsed bridge topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeTopic {
    /// Collection name
    pub collection: String,
    /// Affected record
    pub record_id: RecordId,
    /// Change kind
    pub kind: BridgeTopicKind,
}

/// Naming of MQTT topics carrying out-of-band changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeTopicScheme {
    /// Topic prefix (default: "alive-sync")
    pub prefix: String,
}

impl Default for BridgeTopicScheme {
    fn default() -> Self {
        Self {
            prefix: "alive-sync".to_string(),
        }
    }
}

impl BridgeTopicScheme {
    /// Create a scheme with the given prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Build the base topic path for a record.
    fn base(&self, collection: &str, record_id: RecordId) -> String {
        format!(
            "{}/{}/{}/{}",
            self.prefix,
            PROTOCOL_VERSION,
            encode_segment(collection),
            record_id
        )
    }

    /// Topic announcing a field write.
    #[must_use]
    pub fn field_updated(&self, collection: &str, record_id: RecordId, field: &str) -> String {
        format!(
            "{}/{}/updated",
            self.base(collection, record_id),
            encode_segment(field)
        )
    }

    /// Topic announcing a whole-record rewrite.
    #[must_use]
    pub fn record_updated(&self, collection: &str, record_id: RecordId) -> String {
        format!("{}/updated", self.base(collection, record_id))
    }

    /// Topic announcing a record insert.
    #[must_use]
    pub fn record_created(&self, collection: &str, record_id: RecordId) -> String {
        format!("{}/created", self.base(collection, record_id))
    }

    /// Topic announcing a record removal.
    #[must_use]
    pub fn record_deleted(&self, collection: &str, record_id: RecordId) -> String {
        format!("{}/deleted", self.base(collection, record_id))
    }

    /// Wildcard subscription for every change in one collection.
    #[must_use]
    pub fn collection_wildcard(&self, collection: &str) -> String {
        format!(
            "{}/{}/{}/#",
            self.prefix,
            PROTOCOL_VERSION,
            encode_segment(collection)
        )
    }

    /// Wildcard subscription for every change in every collection.
    #[must_use]
    pub fn all_wildcard(&self) -> String {
        format!("{}/{}/#", self.prefix, PROTOCOL_VERSION)
    }

    /// Parse a topic produced by this scheme.
    #[must_use]
    pub fn parse(&self, topic: &str) -> Option<BridgeTopic> {
        let expected_prefix = format!("{}/{}/", self.prefix, PROTOCOL_VERSION);
        let remainder = topic.strip_prefix(&expected_prefix)?;
        let parts: Vec<&str> = remainder.split('/').collect();

        let (collection, record_id, kind) = match parts.as_slice() {
            [collection, record_id, field, "updated"] => (
                collection,
                record_id,
                BridgeTopicKind::FieldUpdated {
                    field: decode_segment(field)?,
                },
            ),
            [collection, record_id, "updated"] => {
                (collection, record_id, BridgeTopicKind::RecordUpdated)
            }
            [collection, record_id, "created"] => {
                (collection, record_id, BridgeTopicKind::RecordCreated)
            }
            [collection, record_id, "deleted"] => {
                (collection, record_id, BridgeTopicKind::RecordDeleted)
            }
            _ => return None,
        };

        Some(BridgeTopic {
            collection: decode_segment(collection)?,
            record_id: record_id.parse().ok()?,
            kind,
        })
    }
}

fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}

fn decode_segment(segment: &str) -> Option<String> {
    if segment.is_empty() {
        return None;
    }
    percent_decode_str(segment)
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}
