//! Transport layer for inspection event streams.
//!
//! This module provides MQTT endpoint and TLS handling for the bridge, and
//! decoding of published inspection payloads into raw events.

pub mod mqtt;
pub mod payload;

pub use mqtt::{MqttEndpoint, MqttSession, TlsMaterials};
pub use payload::decode_payload;
