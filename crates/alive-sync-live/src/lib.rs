//! # Alive-Sync Live
//!
//! Real-time collaborative editing of record collections.
//!
//! ## Architecture
//!
//! ```text
//!  Session A ──┐                         ┌──▶ Session A
//!  Session B ──┼──▶ LiveCollection ──▶ Topic ──▶ Session B
//!  Bridge    ──┘   (locks, order,          └──▶ Session C
//!                   storage writes)
//! ```
//!
//! - [`LiveCollection`]: the only writer of a collection's lock table and
//!   display order. Each operation is atomic and publishes its broadcasts
//!   before returning.
//! - [`Topic`]: ordered fan-out of [`Envelope`](alive_sync_proto::Envelope)s,
//!   one topic per collection.
//! - [`Session`]: one connected client, with a [`FieldController`] per
//!   displayed field.
//! - [`Bridge`]: feeds changes made outside live sessions back in.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod channel;
pub mod collection;
pub mod error;
pub mod field;
pub mod session;

pub use bridge::Bridge;
pub use channel::{ChannelError, Hub, Subscription, Topic, DEFAULT_CAPACITY};
pub use collection::{Acquire, ExternalOutcome, LiveCollection, Snapshot};
pub use error::LiveError;
pub use field::{EditOutcome, FieldController, FieldMode, SaveOutcome};
pub use session::{FieldView, FieldViewMode, Notice, RecordView, Session, ViewState};
