//! # MQTT Change Adapter
//!
//! Ingests record changes made outside live sessions (admin edits, batch
//! jobs, other services) from an MQTT broker.
//!
//! ## Topics
//!
//! - `alive-sync/v1/{collection}/{record_id}/{field}/updated` (payload: new JSON value)
//! - `alive-sync/v1/{collection}/{record_id}/created`
//! - `alive-sync/v1/{collection}/{record_id}/deleted`
//!
//! Parsed events are handed to the live bridge by the agent.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod events;
pub mod subscriber;

pub use events::{EventParseError, ExternalEvent};
pub use subscriber::{parse_mqtt_url, ExternalSubscriber, ExternalSubscriberConfig, SubscriberError};
