//! Ingestion point for changes made outside any live session.

use crate::collection::{ExternalOutcome, LiveCollection};
use crate::error::LiveError;
use alive_sync_core::RecordId;
use alive_sync_proto::ExternalChange;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Routes external changes to live collections by name.
#[derive(Debug, Default)]
pub struct Bridge {
    collections: HashMap<String, Arc<LiveCollection>>,
}

impl Bridge {
    /// Create an empty bridge.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route changes for `collection.name()` to `collection`.
    pub fn register(&mut self, collection: Arc<LiveCollection>) {
        tracing::debug!(collection = collection.name(), "Registered bridge target");
        self.collections
            .insert(collection.name().to_string(), collection);
    }

    /// Registered collection called `name`.
    #[must_use]
    pub fn collection(&self, name: &str) -> Option<&Arc<LiveCollection>> {
        self.collections.get(name)
    }

    /// Apply an external change to the named collection.
    ///
    /// Unknown collections are logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the change cannot be applied.
    pub fn ingest(&self, collection: &str, change: &ExternalChange) -> Result<ExternalOutcome, LiveError> {
        let Some(target) = self.collections.get(collection) else {
            tracing::warn!(collection, record_id = %change.record_id(), "Change for unknown collection");
            return Ok(ExternalOutcome::Ignored);
        };

        let outcome = target.apply_external(change)?;
        match outcome {
            ExternalOutcome::Conflict { holder } => {
                tracing::info!(
                    collection,
                    record_id = %change.record_id(),
                    %holder,
                    "External change to a locked field"
                );
            }
            ExternalOutcome::Applied => {
                tracing::debug!(collection, record_id = %change.record_id(), "External change applied");
            }
            ExternalOutcome::Ignored => {}
        }
        Ok(outcome)
    }

    /// Apply an external write of one field.
    ///
    /// # Errors
    ///
    /// Same as [`Bridge::ingest`].
    pub fn ingest_field(
        &self,
        collection: &str,
        record_id: RecordId,
        field: &str,
        value: Value,
    ) -> Result<ExternalOutcome, LiveError> {
        self.ingest(
            collection,
            &ExternalChange::FieldUpdated {
                record_id,
                field: field.to_string(),
                value,
            },
        )
    }
}
