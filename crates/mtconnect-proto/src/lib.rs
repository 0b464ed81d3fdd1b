//! # MTConnect Protocol
//!
//! MQTT topic scheme and payload definitions for MTConnect records.
//!
//! ## Payloads
//!
//! - `DevicePayload`: Device definition with its component tree
//! - `ObservationPayload`: Sample, event, or condition (single or array)
//! - `AssetPayload`: Asset document with type-specific content
//!
//! ## MQTT Topics
//!
//! Topic scheme: `MTConnect/Devices/{uuid}/{Device|Observations|Assets}`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod topics;

pub use messages::{
    decode_record, AssetPayload, DevicePayload, MessageError, ObservationPayload, PayloadFormat,
    Record,
};
pub use topics::{TopicKind, TopicScheme};
