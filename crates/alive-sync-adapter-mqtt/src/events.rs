//! Out-of-band change events received over MQTT.

use alive_sync_proto::{BridgeTopicKind, BridgeTopicScheme, ExternalChange};
use serde::{Deserialize, Serialize};

/// A parsed change event, addressed to one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalEvent {
    /// Target collection
    pub collection: String,
    /// The change itself
    pub change: ExternalChange,
}

impl ExternalEvent {
    /// Parse an event from an MQTT topic and payload.
    ///
    /// # Topic Format
    ///
    /// - `{prefix}/v1/{collection}/{record_id}/{field}/updated`, payload is
    ///   the new JSON value (empty means `null`)
    /// - `{prefix}/v1/{collection}/{record_id}/updated`, the record was
    ///   rewritten in storage; payload ignored
    /// - `{prefix}/v1/{collection}/{record_id}/created`
    /// - `{prefix}/v1/{collection}/{record_id}/deleted`
    ///
    /// # Errors
    ///
    /// Returns error if the topic does not match `scheme` or an update
    /// payload is not valid JSON.
    pub fn parse(
        scheme: &BridgeTopicScheme,
        topic: &str,
        payload: &[u8],
    ) -> Result<Self, EventParseError> {
        let parsed = scheme
            .parse(topic)
            .ok_or_else(|| EventParseError::InvalidTopic(topic.to_string()))?;

        let change = match parsed.kind {
            BridgeTopicKind::FieldUpdated { field } => {
                let value = if payload.is_empty() {
                    serde_json::Value::Null
                } else {
                    serde_json::from_slice(payload)
                        .map_err(|e| EventParseError::PayloadParse(e.to_string()))?
                };
                ExternalChange::FieldUpdated {
                    record_id: parsed.record_id,
                    field,
                    value,
                }
            }
            BridgeTopicKind::RecordUpdated => ExternalChange::RecordUpdated {
                record_id: parsed.record_id,
            },
            BridgeTopicKind::RecordCreated => ExternalChange::RecordCreated {
                record_id: parsed.record_id,
            },
            BridgeTopicKind::RecordDeleted => ExternalChange::RecordDeleted {
                record_id: parsed.record_id,
            },
        };

        Ok(Self {
            collection: parsed.collection,
            change,
        })
    }
}

/// Errors that can occur parsing change events.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EventParseError {
    /// Topic is not a bridge topic
    #[error("invalid topic format: {0}")]
    InvalidTopic(String),
    /// Failed to parse payload JSON
    #[error("payload parse error: {0}")]
    PayloadParse(String),
}
