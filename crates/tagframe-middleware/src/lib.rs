//! `tagframe-middleware` – The Nervous System
//!
//! Routes camera frames in and detection results out without caring about
//! their meaning.
//!
//! # Modules
//!
//! - [`bus`] – Headless, typed, topic-based publish/subscribe event bus built
//!   on Tokio broadcast channels.
//! - [`adapter`] – The [`TagAdapter`] trait that translates between bus
//!   events and an external wire format.
//! - [`ros2_adapter`] – rosbridge v2 JSON codec for the ROS 2 topics the
//!   detector consumes and produces.
//! - [`ros2_bridge`] – WebSocket transport that pumps rosbridge frames
//!   through an adapter.

pub mod adapter;
pub mod bus;
pub mod ros2_adapter;
pub mod ros2_bridge;

pub use adapter::TagAdapter;
pub use bus::{EventBus, Topic, TopicReceiver};
pub use ros2_adapter::Ros2Adapter;
pub use ros2_bridge::Ros2Bridge;
