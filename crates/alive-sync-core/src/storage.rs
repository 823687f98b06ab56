//! Storage collaborator interface.
//!
//! The live layer never owns record content; every read of authoritative
//! values and every write goes through a [`Storage`] implementation.

use crate::record::{Fields, Record, RecordId};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Backing store for the records of one collection.
pub trait Storage: Send + Sync {
    /// Fetch a record by id.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn get(&self, id: RecordId) -> Result<Option<Record>, StorageError>;

    /// All records, in ascending id order.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn list(&self) -> Result<Vec<Record>, StorageError>;

    /// Overwrite a single field of an existing record.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the record does not exist, or a
    /// backend error if the write fails.
    fn set(&self, id: RecordId, field: &str, value: serde_json::Value) -> Result<(), StorageError>;

    /// Insert a new record and return its id.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn create(&self, fields: Fields) -> Result<RecordId, StorageError>;

    /// Delete a record. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn delete(&self, id: RecordId) -> Result<bool, StorageError>;

    /// Current value of one field, `None` if the record does not exist.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn get_field(&self, id: RecordId, field: &str) -> Result<Option<serde_json::Value>, StorageError> {
        Ok(self.get(id)?.map(|record| record.value(field)))
    }
}

/// Errors reported by storage backends.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    /// The record does not exist
    #[error("record {0} not found")]
    NotFound(RecordId),
    /// The stored bytes could not be decoded
    #[error("corrupt record {id}: {reason}")]
    Corrupt {
        /// Affected record
        id: RecordId,
        /// Decoder message
        reason: String,
    },
    /// The backend rejected or failed the operation
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// In-memory [`Storage`] with sequential ids starting at 1.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    records: BTreeMap<RecordId, Fields>,
    last_id: u64,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `records`, assigned ids 1, 2, ...
    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = Fields>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.lock();
            for fields in records {
                inner.last_id += 1;
                let id = RecordId(inner.last_id);
                inner.records.insert(id, fields);
            }
        }
        store
    }
}

impl Storage for MemoryStore {
    fn get(&self, id: RecordId) -> Result<Option<Record>, StorageError> {
        let inner = self.inner.lock();
        Ok(inner
            .records
            .get(&id)
            .map(|fields| Record::new(id, fields.clone())))
    }

    fn list(&self) -> Result<Vec<Record>, StorageError> {
        let inner = self.inner.lock();
        Ok(inner
            .records
            .iter()
            .map(|(id, fields)| Record::new(*id, fields.clone()))
            .collect())
    }

    fn set(&self, id: RecordId, field: &str, value: serde_json::Value) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let fields = inner
            .records
            .get_mut(&id)
            .ok_or(StorageError::NotFound(id))?;
        fields.insert(field.to_string(), value);
        Ok(())
    }

    fn create(&self, fields: Fields) -> Result<RecordId, StorageError> {
        let mut inner = self.inner.lock();
        inner.last_id += 1;
        let id = RecordId(inner.last_id);
        inner.records.insert(id, fields);
        Ok(id)
    }

    fn delete(&self, id: RecordId) -> Result<bool, StorageError> {
        Ok(self.inner.lock().records.remove(&id).is_some())
    }
}
