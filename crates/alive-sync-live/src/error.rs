//! Error taxonomy of the live layer.
//!
//! Lock conflicts are not errors: they are reported as outcomes and shown as
//! "locked by other". Nothing here is fatal to the process; every failure is
//! scoped to the session that triggered it.

use alive_sync_core::{FieldKey, RecordId, StorageError};

/// Errors returned by live collection and session operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LiveError {
    /// The record no longer exists in the collection
    #[error("record {0} no longer exists")]
    RecordGone(RecordId),
    /// The field is not editable in this collection
    #[error("field '{0}' is not editable")]
    NotEditable(String),
    /// The field may not be supplied on create
    #[error("field '{0}' is not accepted on create")]
    UnknownField(String),
    /// The operation requires an active edit of this field
    #[error("field {0} is not being edited")]
    NotEditing(FieldKey),
    /// The session no longer holds the lock it was editing under
    #[error("lock on {0} is no longer held")]
    LockLost(FieldKey),
    /// The storage collaborator failed
    #[error("persistence failed: {0}")]
    Persistence(#[from] StorageError),
    /// The broadcast channel was closed
    #[error("broadcast channel closed")]
    ChannelClosed,
}
