//! # Alive-Sync Core
//!
//! Shared data model for live, collaboratively edited record collections.
//!
//! This crate provides:
//! - Record, field, and session identifiers
//! - The per-field edit [`LockTable`]
//! - The per-collection display [`OrderIndex`]
//! - Collection display/edit configuration
//! - The [`Storage`] collaborator trait and an in-memory implementation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conf;
pub mod lock;
pub mod order;
pub mod record;
pub mod storage;

pub use conf::CollectionConf;
pub use lock::LockTable;
pub use order::{Move, OrderIndex};
pub use record::{FieldKey, Fields, Record, RecordId, SessionId};
pub use storage::{MemoryStore, Storage, StorageError};
