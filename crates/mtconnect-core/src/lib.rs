//! # MTConnect Core
//!
//! Buffering and query engine of the MTConnect agent.
//!
//! This crate provides:
//! - Observation, asset, and device records
//! - A fixed-capacity, sequence-ordered observation ring buffer
//! - A bounded asset store with in-place updates and ordered drains
//! - `current` / `sample` queries and long-poll streaming sessions
//! - The persisted agent identity

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod asset;
pub mod buffer;
pub mod device;
pub mod identity;
pub mod observation;
pub mod query;
pub mod streaming;

pub use asset::{Asset, AssetKey, AssetStore};
pub use buffer::{BufferError, ObservationBuffer, ObservationFilter, SequenceWindow};
pub use device::{Component, DataItem, Device, DeviceRegistry};
pub use identity::AgentIdentity;
pub use observation::{value_keys, DataItemCategory, Observation};
pub use query::{QueryError, QueryParams};
pub use streaming::{Frame, StreamError, StreamRequest, StreamSession, StreamState};
