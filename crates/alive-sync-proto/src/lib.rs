//! # Alive-Sync Protocol
//!
//! Payload definitions and topic naming for live collections.
//!
//! ## Messages
//!
//! - `BroadcastEvent`: fan-out notification on a collection topic
//! - `ClientAction`: inbound user action from a connected client
//! - `ExternalChange`: out-of-band record change fed to the bridge
//!
//! ## Topics
//!
//! Broadcast topics: `{prefix}:{collection}`.
//! Bridge topics: `alive-sync/v1/{collection}/{record_id}/...`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod topics;

pub use messages::{Action, BroadcastEvent, ClientAction, Envelope, ExternalChange, MessageError};
pub use topics::{BridgeTopic, BridgeTopicKind, BridgeTopicScheme, TopicScheme};
