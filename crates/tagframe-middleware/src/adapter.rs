//! The Universal Adapter Pattern.
//!
//! The detector node never speaks directly to ROS 2 or WebSockets.  It
//! consumes and produces events on the internal
//! [`EventBus`][crate::bus::EventBus].  Adapters translate between those
//! events and the wire format of the outside world; a transport (such as
//! [`Ros2Bridge`][crate::ros2_bridge::Ros2Bridge]) only moves the resulting
//! text frames around.
//!
//! - [`TagAdapter`] – the trait every adapter must implement.
//! - [`Ros2Adapter`][crate::ros2_adapter::Ros2Adapter] – rosbridge v2 JSON.

use tagframe_types::{Event, TagError};

use crate::bus::Topic;

/// Every external-protocol adapter must implement this trait.
///
/// # Contract
///
/// * `ingest` – decodes one inbound text frame and publishes the resulting
///   event on the bus.  Returns the topic it published to, or `None` when
///   the frame carried nothing the node consumes (or only half of a frame
///   that still waits for its partner).
///
/// * `encode` – renders an outbound bus event as one text frame, or `None`
///   when the protocol has no mapping for it.
///
/// * `handshake` – frames a transport sends once per connection before any
///   traffic (subscriptions, advertisements).
pub trait TagAdapter: Send + Sync {
    fn ingest(&self, frame: &str) -> Result<Option<Topic>, TagError>;

    fn encode(&self, event: &Event) -> Result<Option<String>, TagError>;

    fn handshake(&self) -> Vec<String> {
        Vec::new()
    }
}
