//! # MTConnect MQTT Transport
//!
//! MQTT client that feeds MTConnect records into the agent and publishes
//! them back out.
//!
//! ## Inbound
//!
//! Every publish is classified against the topic scheme, decoded, and handed
//! to the handlers registered on a [`MessageRouter`] for its record kind.
//! Messages on unknown topics, empty payloads, and undecodable payloads are
//! dropped and counted in [`RouterStats`].
//!
//! ## Outbound
//!
//! [`MqttClient`] publishes devices, observations, and assets on the topic
//! derived from the record kind and owning device.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod router;

pub use client::{parse_mqtt_url, BrokerAddress, ClientError, MqttClient, MqttClientConfig};
pub use router::{
    ConnectionEvent, DispatchError, HandlerGuard, MessageRouter, RouterStats, StatsSnapshot,
};
